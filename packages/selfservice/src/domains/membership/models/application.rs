//! The membership application aggregate.
//!
//! A membership application is a small state machine:
//!
//! ```text
//! PendingApproval ──finalize──► Finalized   (terminal)
//!        │
//!        └────────cancel──────► Cancelled   (terminal)
//! ```
//!
//! Terminal states are absorbing. Approvals can only be appended while the
//! application is pending, an applicant can never approve their own
//! application, and a duplicate approval from the same user is a silent
//! no-op so that redelivered broker messages cannot double-count.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use std::fmt;
use thiserror::Error;

use crate::common::{ApplicationId, CapabilityId, UserId};
use crate::domains::membership::events::{DomainEvent, EventSource};

/// Lifecycle states of a membership application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationStatus {
    PendingApproval,
    Finalized,
    Cancelled,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Finalized => "finalized",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending_approval" => Some(Self::PendingApproval),
            "finalized" => Some(Self::Finalized),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an application was cancelled. Travels in the cancelled event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The application outlived its deadline.
    Expired,
    /// The applicant became a member through another path.
    Superseded,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Superseded => "superseded",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by aggregate state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("membership application {id} is {status} and does not allow {operation}")]
    InvalidState {
        id: ApplicationId,
        status: ApplicationStatus,
        operation: &'static str,
    },

    #[error("user {applicant} cannot approve their own membership application {id}")]
    SelfApproval {
        id: ApplicationId,
        applicant: UserId,
    },
}

/// A single approval on a membership application. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipApproval {
    pub approved_by: UserId,
    pub approved_at: DateTime<Utc>,
}

/// The membership application aggregate root.
#[derive(Debug, Clone)]
pub struct MembershipApplication {
    id: ApplicationId,
    capability_id: CapabilityId,
    applicant: UserId,
    status: ApplicationStatus,
    submitted_at: DateTime<Utc>,
    expires_on: DateTime<Utc>,
    approvals: Vec<MembershipApproval>,
    events: Vec<DomainEvent>,
}

impl MembershipApplication {
    /// Creates a new application in `PendingApproval` and records the
    /// submitted event.
    ///
    /// The caller (the service) guarantees that no other pending application
    /// exists for the same applicant and capability. The expiry deadline is
    /// truncated to midnight so a whole day is either in or out.
    pub fn submit(
        capability_id: CapabilityId,
        applicant: UserId,
        now: DateTime<Utc>,
        expiry_window: Duration,
    ) -> Self {
        let expires_on = (now + expiry_window)
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();

        let mut application = Self {
            id: ApplicationId::new(),
            capability_id,
            applicant,
            status: ApplicationStatus::PendingApproval,
            submitted_at: now,
            expires_on,
            approvals: Vec::new(),
            events: Vec::new(),
        };

        application.events.push(DomainEvent::NewMembershipApplicationHasBeenSubmitted {
            membership_application_id: application.id,
            occurred_at: now,
        });

        application
    }

    /// Reconstitutes an aggregate from its persisted parts. Does not record
    /// any events.
    pub fn from_parts(
        id: ApplicationId,
        capability_id: CapabilityId,
        applicant: UserId,
        status: ApplicationStatus,
        submitted_at: DateTime<Utc>,
        expires_on: DateTime<Utc>,
        approvals: Vec<MembershipApproval>,
    ) -> Self {
        Self {
            id,
            capability_id,
            applicant,
            status,
            submitted_at,
            expires_on,
            approvals,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> ApplicationId {
        self.id
    }

    pub fn capability_id(&self) -> CapabilityId {
        self.capability_id
    }

    pub fn applicant(&self) -> &UserId {
        &self.applicant
    }

    pub fn status(&self) -> ApplicationStatus {
        self.status
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    /// Approvals in the order they were given.
    pub fn approvals(&self) -> &[MembershipApproval] {
        &self.approvals
    }

    pub fn is_finalized(&self) -> bool {
        self.status == ApplicationStatus::Finalized
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ApplicationStatus::Cancelled
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApplicationStatus::PendingApproval
    }

    pub fn has_approved(&self, user_id: &UserId) -> bool {
        self.approvals.iter().any(|a| &a.approved_by == user_id)
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_on <= now
    }

    /// Registers an approval.
    ///
    /// A repeated approval by the same user is a silent no-op; duplicate
    /// broker deliveries must not double-count.
    pub fn approve(&mut self, approved_by: UserId, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != ApplicationStatus::PendingApproval {
            return Err(DomainError::InvalidState {
                id: self.id,
                status: self.status,
                operation: "approve",
            });
        }

        if approved_by == self.applicant {
            return Err(DomainError::SelfApproval {
                id: self.id,
                applicant: approved_by,
            });
        }

        if self.has_approved(&approved_by) {
            return Ok(());
        }

        self.approvals.push(MembershipApproval {
            approved_by,
            approved_at: now,
        });

        self.events.push(DomainEvent::MembershipApplicationHasReceivedAnApproval {
            membership_application_id: self.id,
            occurred_at: now,
        });

        Ok(())
    }

    /// Transitions to `Finalized`.
    ///
    /// Quorum is the service's responsibility; calling this before quorum is
    /// met is a caller error the aggregate cannot detect.
    pub fn finalize(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != ApplicationStatus::PendingApproval {
            return Err(DomainError::InvalidState {
                id: self.id,
                status: self.status,
                operation: "finalize",
            });
        }

        self.status = ApplicationStatus::Finalized;
        self.events.push(DomainEvent::MembershipApplicationHasBeenFinalized {
            membership_application_id: self.id,
            occurred_at: now,
        });

        Ok(())
    }

    /// Transitions to `Cancelled`. No-op when the application already reached
    /// a terminal state.
    pub fn cancel(&mut self, now: DateTime<Utc>, reason: CancelReason) {
        if self.status != ApplicationStatus::PendingApproval {
            return;
        }

        self.status = ApplicationStatus::Cancelled;
        self.events.push(DomainEvent::MembershipApplicationHasBeenCancelled {
            membership_application_id: self.id,
            reason,
            occurred_at: now,
        });
    }
}

impl EventSource for MembershipApplication {
    fn drain_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 45).unwrap()
    }

    fn pending_application() -> MembershipApplication {
        MembershipApplication::submit(
            CapabilityId::new(),
            UserId::new("alice@acme.co"),
            now(),
            Duration::days(15),
        )
    }

    #[test]
    fn test_submit_starts_pending_and_records_event() {
        let mut application = pending_application();

        assert_eq!(application.status(), ApplicationStatus::PendingApproval);
        assert_eq!(application.submitted_at(), now());

        let events = application.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DomainEvent::NewMembershipApplicationHasBeenSubmitted { membership_application_id, .. }
                if membership_application_id == application.id()
        ));
    }

    #[test]
    fn test_submit_truncates_expiry_to_midnight() {
        let application = pending_application();

        let expected = Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).unwrap();
        assert_eq!(application.expires_on(), expected);
    }

    #[test]
    fn test_approve_appends_approval_and_records_event() {
        let mut application = pending_application();
        application.drain_events();

        application.approve(UserId::new("bob@acme.co"), now()).unwrap();

        assert_eq!(application.approvals().len(), 1);
        assert_eq!(application.approvals()[0].approved_by, UserId::new("bob@acme.co"));

        let events = application.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DomainEvent::MembershipApplicationHasReceivedAnApproval { .. }
        ));
    }

    #[test]
    fn test_approve_twice_by_same_user_is_a_silent_noop() {
        let mut application = pending_application();
        application.drain_events();

        application.approve(UserId::new("bob@acme.co"), now()).unwrap();
        application.approve(UserId::new("bob@acme.co"), now()).unwrap();
        application.approve(UserId::new("bob@acme.co"), now()).unwrap();

        assert_eq!(application.approvals().len(), 1);
        // Only the first approval records an event.
        assert_eq!(application.drain_events().len(), 1);
    }

    #[test]
    fn test_approve_by_applicant_is_rejected() {
        let mut application = pending_application();
        application.drain_events();

        let err = application
            .approve(UserId::new("alice@acme.co"), now())
            .unwrap_err();

        assert!(matches!(err, DomainError::SelfApproval { .. }));
        assert!(application.approvals().is_empty());
        assert!(application.drain_events().is_empty());
    }

    #[test]
    fn test_approve_on_terminal_states_is_rejected() {
        let mut finalized = pending_application();
        finalized.finalize(now()).unwrap();
        let err = finalized.approve(UserId::new("bob@acme.co"), now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState { operation: "approve", .. }));
        assert_eq!(finalized.status(), ApplicationStatus::Finalized);

        let mut cancelled = pending_application();
        cancelled.cancel(now(), CancelReason::Expired);
        let err = cancelled.approve(UserId::new("bob@acme.co"), now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState { operation: "approve", .. }));
        assert_eq!(cancelled.status(), ApplicationStatus::Cancelled);
    }

    #[test]
    fn test_finalize_transitions_and_records_event() {
        let mut application = pending_application();
        application.drain_events();

        application.finalize(now()).unwrap();

        assert!(application.is_finalized());
        let events = application.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DomainEvent::MembershipApplicationHasBeenFinalized { .. }
        ));
    }

    #[test]
    fn test_finalize_on_terminal_states_is_rejected() {
        let mut application = pending_application();
        application.finalize(now()).unwrap();
        assert!(application.finalize(now()).is_err());

        let mut cancelled = pending_application();
        cancelled.cancel(now(), CancelReason::Expired);
        assert!(cancelled.finalize(now()).is_err());
        assert_eq!(cancelled.status(), ApplicationStatus::Cancelled);
    }

    #[test]
    fn test_cancel_is_idempotent_and_keeps_terminal_states() {
        let mut application = pending_application();
        application.drain_events();

        application.cancel(now(), CancelReason::Expired);
        application.cancel(now(), CancelReason::Expired);

        assert!(application.is_cancelled());
        // A single cancellation event despite repeated calls.
        assert_eq!(application.drain_events().len(), 1);

        let mut finalized = pending_application();
        finalized.finalize(now()).unwrap();
        finalized.drain_events();

        finalized.cancel(now(), CancelReason::Superseded);
        assert!(finalized.is_finalized());
        assert!(finalized.drain_events().is_empty());
    }

    #[test]
    fn test_has_expired() {
        let application = pending_application();

        assert!(!application.has_expired(now()));
        assert!(application.has_expired(application.expires_on()));
        assert!(application.has_expired(application.expires_on() + Duration::days(1)));

        let mut finalized = pending_application();
        finalized.finalize(now()).unwrap();
        assert!(!finalized.has_expired(finalized.expires_on() + Duration::days(1)));
    }

    #[test]
    fn test_drain_events_transfers_ownership_once() {
        let mut application = pending_application();

        assert_eq!(application.drain_events().len(), 1);
        assert!(application.drain_events().is_empty());
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            ApplicationStatus::PendingApproval,
            ApplicationStatus::Finalized,
            ApplicationStatus::Cancelled,
        ] {
            assert_eq!(ApplicationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ApplicationStatus::parse("unknown"), None);
    }
}
