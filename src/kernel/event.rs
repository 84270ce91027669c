use actix::Message;

use crate::error::Error;
use crate::id::{MsgId, ReservationId};
use crate::protocol::messages::Envelope;

/// The four kinds of kernel event (spec §4.1): tick, inbound message,
/// outgoing-request completion (here folded into `Inbound` since a reply is
/// just another envelope correlated by id), and timeout firing. Local
/// commands (e.g. "create a slice") are modeled as their own message types
/// below rather than a single `LocalCommand` enum, which is the more
/// idiomatic actix shape (one `Handler<M>` per request kind).
#[derive(Message)]
#[rtype(result = "()")]
pub struct Tick;

#[derive(Message)]
#[rtype(result = "()")]
pub struct Inbound(pub Envelope);

/// Enqueued by the timer thread when an outstanding RPC's deadline expires
/// (spec §5 "Cancellation and timeouts"). The kernel never awaits; this is
/// the synthetic failure event that replaces a blocking join.
#[derive(Message)]
#[rtype(result = "()")]
pub struct TimeoutFired {
    pub reservation_id: ReservationId,
    pub correlation_id: MsgId,
}

/// Fired by the authority's provisioning pool when a `provision`/`teardown`
/// invocation completes (spec §4.5 step 5). The pool itself runs off the
/// kernel thread; only this completion event touches reservation state.
#[derive(Message)]
#[rtype(result = "()")]
pub struct HandlerCompleted {
    pub reservation_id: ReservationId,
    pub ok: bool,
    pub properties: std::collections::HashMap<String, String>,
    pub error: Option<Error>,
    pub is_teardown: bool,
}
