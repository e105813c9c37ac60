//! The membership aggregate.
//!
//! Deliberately small: a membership is created when an application is
//! accepted (or a capability creator is added directly) and its only fact is
//! that the user joined.

use chrono::{DateTime, Utc};

use crate::common::{CapabilityId, MembershipId, UserId};
use crate::domains::membership::events::{DomainEvent, EventSource};

#[derive(Debug, Clone)]
pub struct Membership {
    id: MembershipId,
    capability_id: CapabilityId,
    user_id: UserId,
    joined_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
}

impl Membership {
    /// Creates a membership and records `UserHasJoinedCapability`.
    pub fn create_for(capability_id: CapabilityId, user_id: UserId, now: DateTime<Utc>) -> Self {
        let mut membership = Self {
            id: MembershipId::new(),
            capability_id,
            user_id: user_id.clone(),
            joined_at: now,
            events: Vec::new(),
        };

        membership.events.push(DomainEvent::UserHasJoinedCapability {
            capability_id,
            user_id,
            occurred_at: now,
        });

        membership
    }

    /// Reconstitutes a membership from its persisted parts.
    pub fn from_parts(
        id: MembershipId,
        capability_id: CapabilityId,
        user_id: UserId,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            capability_id,
            user_id,
            joined_at,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> MembershipId {
        self.id
    }

    pub fn capability_id(&self) -> CapabilityId {
        self.capability_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }
}

impl EventSource for Membership {
    fn drain_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_create_for_records_joined_event() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let capability_id = CapabilityId::new();

        let mut membership =
            Membership::create_for(capability_id, UserId::new("alice@acme.co"), now);

        let events = membership.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            DomainEvent::UserHasJoinedCapability { capability_id: cid, user_id, .. }
                if *cid == capability_id && user_id.as_str() == "alice@acme.co"
        ));
        assert!(membership.drain_events().is_empty());
    }
}
