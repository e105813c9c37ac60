//! Process composition.
//!
//! Ownership is explicit: `main` builds the dependency graph top-down and
//! hands each long-running piece to the runtime. No container, no scanning -
//! what is wired here is everything that runs.

use std::sync::Arc;

use crate::domains::membership::events::{
    CAPABILITY_CREATED, CAPABILITY_TOPIC, MEMBERSHIP_APPLICATION_APPROVED,
    MEMBERSHIP_APPLICATION_CANCELLED, MEMBERSHIP_APPLICATION_FINALIZED,
    MEMBERSHIP_APPLICATION_TOPIC,
};
use crate::domains::membership::policies::{
    AddCreatorAsInitialMember, ConvertMembershipApplicationToActualMembership,
    FinalizeMembershipApplication, RemoveCancelledMembershipApplication,
};
use crate::domains::membership::service::MembershipApplicationService;
use crate::kernel::consumer::HandlerRegistry;
use crate::kernel::persistence::Database;

/// Topics this process consumes.
pub fn consumed_topics() -> Vec<String> {
    vec![
        MEMBERSHIP_APPLICATION_TOPIC.to_string(),
        CAPABILITY_TOPIC.to_string(),
    ]
}

/// The explicit policy registration table. The submitted event is
/// intentionally absent: nothing here reacts to it.
pub fn build_registry<D: Database>(
    service: Arc<MembershipApplicationService<D>>,
) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            MEMBERSHIP_APPLICATION_APPROVED,
            Arc::new(FinalizeMembershipApplication::new(service.clone())),
        )
        .register(
            MEMBERSHIP_APPLICATION_FINALIZED,
            Arc::new(ConvertMembershipApplicationToActualMembership::new(
                service.clone(),
            )),
        )
        .register(
            MEMBERSHIP_APPLICATION_CANCELLED,
            Arc::new(RemoveCancelledMembershipApplication::new(service.clone())),
        )
        .register(
            CAPABILITY_CREATED,
            Arc::new(AddCreatorAsInitialMember::new(service)),
        )
}
