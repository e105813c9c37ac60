// Domain models for the membership context

pub mod application;
pub mod membership;

pub use application::{
    ApplicationStatus, CancelReason, DomainError, MembershipApplication, MembershipApproval,
};
pub use membership::Membership;
