//! Typed ID definitions for the domain entities owned by this crate.
//!
//! Each entity gets a marker type and an `Id<Marker>` alias, providing
//! compile-time type safety for ID usage throughout the application.

// Re-export the core Id type and version markers
pub use super::id::{Id, V4, V7};

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker type for Capability entities.
pub struct Capability;

/// Marker type for Membership entities.
pub struct Membership;

/// Marker type for MembershipApplication aggregates.
pub struct MembershipApplication;

// ============================================================================
// Type aliases - the primary API
// ============================================================================

/// Typed ID for Capability entities.
pub type CapabilityId = Id<Capability>;

/// Typed ID for Membership entities.
pub type MembershipId = Id<Membership>;

/// Typed ID for MembershipApplication aggregates.
pub type ApplicationId = Id<MembershipApplication>;
