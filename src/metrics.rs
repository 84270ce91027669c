use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight kernel counters, incremented on each tick/transition and
/// exported as Prometheus text format on `prometheus.port` (spec §6). The
/// actual HTTP listener binding this exporter to a socket is left to
/// `main.rs`'s wiring, consistent with Non-goals excluding user-facing web
/// surfaces while still carrying structured metrics as an ambient concern.
#[derive(Default)]
pub struct KernelMetrics {
    ticks_processed: AtomicU64,
    events_drained: AtomicU64,
    transitions: AtomicU64,
    reservations_failed: AtomicU64,
    reservations_closed: AtomicU64,
    commits: AtomicU64,
}

impl KernelMetrics {
    pub fn new() -> Self {
        KernelMetrics::default()
    }

    pub fn record_tick(&self) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_drained(&self, count: u64) {
        self.events_drained.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.reservations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.reservations_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> KernelMetricsSnapshot {
        KernelMetricsSnapshot {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            events_drained: self.events_drained.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            reservations_failed: self.reservations_failed.load(Ordering::Relaxed),
            reservations_closed: self.reservations_closed.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }

    /// Renders current counters in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            "# TYPE kernel_ticks_processed_total counter\nkernel_ticks_processed_total {}\n\
             # TYPE kernel_events_drained_total counter\nkernel_events_drained_total {}\n\
             # TYPE kernel_transitions_total counter\nkernel_transitions_total {}\n\
             # TYPE kernel_reservations_failed_total counter\nkernel_reservations_failed_total {}\n\
             # TYPE kernel_reservations_closed_total counter\nkernel_reservations_closed_total {}\n\
             # TYPE kernel_commits_total counter\nkernel_commits_total {}\n",
            s.ticks_processed, s.events_drained, s.transitions, s.reservations_failed, s.reservations_closed, s.commits
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelMetricsSnapshot {
    pub ticks_processed: u64,
    pub events_drained: u64,
    pub transitions: u64,
    pub reservations_failed: u64,
    pub reservations_closed: u64,
    pub commits: u64,
}
