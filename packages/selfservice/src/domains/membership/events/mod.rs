//! Domain events raised by the membership aggregates.
//!
//! Events are facts. They are recorded by aggregate state transitions,
//! harvested by the unit of work into outbox rows, and published to the
//! broker by the relay. Consumers (including our own policies) only ever see
//! the serialized payloads, so ids travel as strings in camelCase JSON.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::common::{ApplicationId, CapabilityId, UserId};
use crate::domains::membership::models::application::CancelReason;
use crate::kernel::outbox::OutboxEntry;

// ============================================================================
// Topics and message types
// ============================================================================

/// Topic carrying membership application lifecycle events.
pub const MEMBERSHIP_APPLICATION_TOPIC: &str = "cloudengineering.selfservice.membershipapplication";

/// Topic carrying membership events.
pub const MEMBERSHIP_TOPIC: &str = "cloudengineering.selfservice.membership";

/// Topic carrying capability events (produced elsewhere, consumed here).
pub const CAPABILITY_TOPIC: &str = "cloudengineering.selfservice.capability";

pub const MEMBERSHIP_APPLICATION_SUBMITTED: &str = "membership-submitted";
pub const MEMBERSHIP_APPLICATION_APPROVED: &str = "membership-application-approved";
pub const MEMBERSHIP_APPLICATION_FINALIZED: &str = "membership-application-finalized";
pub const MEMBERSHIP_APPLICATION_CANCELLED: &str = "membership-application-cancelled";
pub const USER_HAS_JOINED_CAPABILITY: &str = "user-has-joined-capability";

/// Message type of the foreign capability-created event we react to.
pub const CAPABILITY_CREATED: &str = "capability-created";

// ============================================================================
// EventSource
// ============================================================================

/// An aggregate that records domain events as a side effect of state
/// transitions.
pub trait EventSource {
    /// Hands ownership of the buffered events to the caller, leaving the
    /// aggregate with an empty buffer.
    ///
    /// The unit of work calls this exactly once per transaction when the
    /// aggregate is saved; nothing else should call it.
    fn drain_events(&mut self) -> Vec<DomainEvent>;
}

// ============================================================================
// DomainEvent
// ============================================================================

/// Domain events recorded by the membership aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    NewMembershipApplicationHasBeenSubmitted {
        membership_application_id: ApplicationId,
        occurred_at: DateTime<Utc>,
    },
    MembershipApplicationHasReceivedAnApproval {
        membership_application_id: ApplicationId,
        occurred_at: DateTime<Utc>,
    },
    MembershipApplicationHasBeenFinalized {
        membership_application_id: ApplicationId,
        occurred_at: DateTime<Utc>,
    },
    MembershipApplicationHasBeenCancelled {
        membership_application_id: ApplicationId,
        reason: CancelReason,
        occurred_at: DateTime<Utc>,
    },
    UserHasJoinedCapability {
        capability_id: CapabilityId,
        user_id: UserId,
        occurred_at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Canonical message type tag, as it appears on the wire.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::NewMembershipApplicationHasBeenSubmitted { .. } => MEMBERSHIP_APPLICATION_SUBMITTED,
            Self::MembershipApplicationHasReceivedAnApproval { .. } => MEMBERSHIP_APPLICATION_APPROVED,
            Self::MembershipApplicationHasBeenFinalized { .. } => MEMBERSHIP_APPLICATION_FINALIZED,
            Self::MembershipApplicationHasBeenCancelled { .. } => MEMBERSHIP_APPLICATION_CANCELLED,
            Self::UserHasJoinedCapability { .. } => USER_HAS_JOINED_CAPABILITY,
        }
    }

    /// Target topic for the event.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::UserHasJoinedCapability { .. } => MEMBERSHIP_TOPIC,
            _ => MEMBERSHIP_APPLICATION_TOPIC,
        }
    }

    /// Partitioning key. Events of one aggregate share a key so consumers see
    /// them in order.
    pub fn partition_key(&self) -> String {
        match self {
            Self::NewMembershipApplicationHasBeenSubmitted {
                membership_application_id, ..
            }
            | Self::MembershipApplicationHasReceivedAnApproval {
                membership_application_id, ..
            }
            | Self::MembershipApplicationHasBeenFinalized {
                membership_application_id, ..
            }
            | Self::MembershipApplicationHasBeenCancelled {
                membership_application_id, ..
            } => membership_application_id.to_string(),
            Self::UserHasJoinedCapability { user_id, .. } => user_id.to_string(),
        }
    }

    /// Serialized payload in wire format.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::NewMembershipApplicationHasBeenSubmitted {
                membership_application_id, ..
            }
            | Self::MembershipApplicationHasReceivedAnApproval {
                membership_application_id, ..
            }
            | Self::MembershipApplicationHasBeenFinalized {
                membership_application_id, ..
            } => json!({
                "membershipApplicationId": membership_application_id.to_string(),
            }),
            Self::MembershipApplicationHasBeenCancelled {
                membership_application_id,
                reason,
                ..
            } => json!({
                "membershipApplicationId": membership_application_id.to_string(),
                "reason": reason.as_str(),
            }),
            Self::UserHasJoinedCapability {
                capability_id,
                user_id,
                ..
            } => json!({
                "capabilityId": capability_id.to_string(),
                "userId": user_id.as_str(),
            }),
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::NewMembershipApplicationHasBeenSubmitted { occurred_at, .. }
            | Self::MembershipApplicationHasReceivedAnApproval { occurred_at, .. }
            | Self::MembershipApplicationHasBeenFinalized { occurred_at, .. }
            | Self::MembershipApplicationHasBeenCancelled { occurred_at, .. }
            | Self::UserHasJoinedCapability { occurred_at, .. } => *occurred_at,
        }
    }
}

impl From<DomainEvent> for OutboxEntry {
    fn from(event: DomainEvent) -> Self {
        OutboxEntry::new(
            event.message_type().to_string(),
            event.topic().to_string(),
            event.partition_key(),
            event.payload(),
            event.occurred_at(),
        )
    }
}
