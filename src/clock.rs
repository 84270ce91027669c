use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Logical tick counter. The kernel only ever reads this type, never wall
/// clock time directly, which is what makes its transitions deterministic
/// and replay-safe (spec'd requirement: "the kernel never reads wall-clock
/// time directly").
pub type Tick = u64;

/// A `Clock` supplies the kernel with the current logical time and tick
/// number. Three implementations correspond to `time.manual` / `time.startTime`
/// config knobs: real-time, stepped (test harness drives ticks), and a fixed
/// wall-clock offset.
pub trait Clock: Send + Sync {
    /// Current logical tick. Monotonically non-decreasing.
    fn tick(&self) -> Tick;

    /// Current logical wall-clock time corresponding to `tick()`.
    fn now(&self) -> DateTime<Utc>;

    /// Advance to the next tick. Real-time clocks advance automatically with
    /// wall time; this is the explicit knob stepped clocks use in tests.
    fn advance(&self) -> Tick;
}

/// Ticks follow wall-clock time at a fixed period (`time.cycleMillis`,
/// default 1000ms). `tick()` derives its value from elapsed wall time rather
/// than a counter, so a slow test process doesn't skip logical ticks.
pub struct RealTimeClock {
    start: DateTime<Utc>,
    cycle_millis: i64,
    first_tick: Tick,
}

impl RealTimeClock {
    pub fn new(cycle_millis: i64, first_tick: Tick) -> Self {
        RealTimeClock { start: Utc::now(), cycle_millis: cycle_millis.max(1), first_tick }
    }
}

impl Clock for RealTimeClock {
    fn tick(&self) -> Tick {
        let elapsed = Utc::now().signed_duration_since(self.start).num_milliseconds();
        self.first_tick + (elapsed / self.cycle_millis).max(0) as u64
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn advance(&self) -> Tick {
        self.tick()
    }
}

/// Manual (`time.manual=true`) clock driven entirely by `advance()` calls
/// from a test harness. `now()` derives from `tick * cycle_millis` added to
/// a fixed start time so lease windows remain comparable across ticks.
pub struct SteppedClock {
    start: DateTime<Utc>,
    cycle_millis: i64,
    tick: AtomicI64,
}

impl SteppedClock {
    pub fn new(start: DateTime<Utc>, cycle_millis: i64, first_tick: Tick) -> Self {
        SteppedClock { start, cycle_millis: cycle_millis.max(1), tick: AtomicI64::new(first_tick as i64) }
    }

    pub fn set_tick(&self, tick: Tick) {
        self.tick.store(tick as i64, Ordering::SeqCst);
    }
}

impl Clock for SteppedClock {
    fn tick(&self) -> Tick {
        self.tick.load(Ordering::SeqCst) as u64
    }

    fn now(&self) -> DateTime<Utc> {
        self.start + Duration::milliseconds(self.tick() as i64 * self.cycle_millis)
    }

    fn advance(&self) -> Tick {
        self.tick.fetch_add(1, Ordering::SeqCst) as u64 + 1
    }
}

/// Real-time clock shifted by a fixed offset (`time.startTime` override),
/// used to replay a scenario as if it began at a specific historical time
/// while still advancing with wall clock.
pub struct OffsetClock {
    inner: RealTimeClock,
    offset: Duration,
}

impl OffsetClock {
    pub fn new(start_time: DateTime<Utc>, cycle_millis: i64, first_tick: Tick) -> Self {
        let inner = RealTimeClock::new(cycle_millis, first_tick);
        let offset = start_time.signed_duration_since(inner.now());
        OffsetClock { inner, offset }
    }
}

impl Clock for OffsetClock {
    fn tick(&self) -> Tick {
        self.inner.tick()
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.now() + self.offset
    }

    fn advance(&self) -> Tick {
        self.inner.advance()
    }
}
