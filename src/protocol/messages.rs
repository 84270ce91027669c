use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::delegation::Delegation;
use crate::domain::reservation::Reservation;
use crate::error::Error;
use crate::id::{ActorGuid, MsgId, ReservationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    Summary,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationResult {
    pub ok: bool,
    pub error: Option<Error>,
}

impl OperationResult {
    pub fn ok() -> Self {
        OperationResult { ok: true, error: None }
    }
    pub fn failed(e: Error) -> Self {
        OperationResult { ok: false, error: Some(e) }
    }
}

/// Core envelope kinds exchanged between orchestrator, broker, and authority
/// (spec §4.7). Every variant's payload identifies the reservation(s) it
/// concerns; `Envelope` carries the routing/correlation metadata common to
/// all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    Ticket { reservations: Vec<Reservation> },
    UpdateTicket { reservation: Reservation, result: OperationResult },
    Redeem { reservation: Reservation },
    UpdateLease { reservation: Reservation, result: OperationResult },
    ExtendTicket { reservation_id: ReservationId, new_lease_end: DateTime<Utc> },
    ExtendLease { reservation_id: ReservationId, new_lease_end: DateTime<Utc> },
    Close { reservation_id: ReservationId },
    Claim { delegation: Delegation },
    Reclaim { delegation_id: crate::id::DelegationId },
    Query { level: QueryLevel },
    QueryResponse { payload: Vec<Reservation> },
    Probe,
}

/// Wire envelope. All messages carry `msg_id`, `correlation_id`,
/// `source_actor_guid`, `callback_topic`, and `auth_token` (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: MsgId,
    pub correlation_id: Option<MsgId>,
    pub source_actor_guid: ActorGuid,
    pub callback_topic: String,
    pub auth_token: Option<String>,
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(source_actor_guid: ActorGuid, callback_topic: impl Into<String>, body: MessageBody) -> Self {
        Envelope { msg_id: MsgId::new(), correlation_id: None, source_actor_guid, callback_topic: callback_topic.into(), auth_token: None, body }
    }

    /// Builds a reply envelope correlated to this one.
    pub fn reply(&self, source_actor_guid: ActorGuid, callback_topic: impl Into<String>, body: MessageBody) -> Self {
        Envelope { msg_id: MsgId::new(), correlation_id: Some(self.msg_id), source_actor_guid, callback_topic: callback_topic.into(), auth_token: None, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_correlates_to_original_msg_id() {
        let env = Envelope::new(ActorGuid::new(), "orchestrator-in", MessageBody::Probe);
        let reply = env.reply(ActorGuid::new(), "broker-in", MessageBody::Probe);
        assert_eq!(reply.correlation_id, Some(env.msg_id));
    }
}
