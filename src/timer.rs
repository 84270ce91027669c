use std::time::Duration;

use actix::Addr;

use crate::id::{MsgId, ReservationId};
use crate::kernel::{Kernel, TimeoutFired};

/// Fires deferred timeouts back into the kernel queue (spec §5
/// "Cancellation and timeouts"). Every outgoing RPC has a deadline; rather
/// than block the kernel thread waiting for it, the caller registers one
/// with `TimerService::schedule`, which sleeps on its own tokio task and
/// enqueues a synthetic `TimeoutFired` event when the deadline passes. The
/// kernel never awaits anything; this is the other half of that contract.
#[derive(Clone)]
pub struct TimerService {
    kernel: Addr<Kernel>,
}

impl TimerService {
    pub fn new(kernel: Addr<Kernel>) -> Self {
        TimerService { kernel }
    }

    /// Schedules a `TimeoutFired` for `reservation_id`/`correlation_id` to
    /// be delivered after `deadline`. Returns a handle that cancels the
    /// timer if the RPC completes first (dropping it is enough; the
    /// underlying task checks the handle's generation before sending).
    pub fn schedule(&self, deadline: Duration, reservation_id: ReservationId, correlation_id: MsgId) -> TimerHandle {
        let cancelled = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle = TimerHandle { cancelled: cancelled.clone() };
        let kernel = self.kernel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            kernel.do_send(TimeoutFired { reservation_id, correlation_id });
        });

        handle
    }
}

/// Cancels a pending timer on drop-equivalent call. Held by the caller that
/// registered the timer (e.g. the producer pool) so a reply arriving before
/// the deadline suppresses the synthetic failure.
pub struct TimerHandle {
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
