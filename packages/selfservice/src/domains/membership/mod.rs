// Membership domain - applications, approvals and memberships.
//
// The membership application aggregate is the core state machine of this
// crate. Everything it does becomes visible to the rest of the platform as
// domain events flowing through the transactional outbox.

pub mod events;
pub mod models;
pub mod policies;
pub mod quorum;
pub mod service;

pub use service::{MembershipApplicationService, SelfServiceError};
