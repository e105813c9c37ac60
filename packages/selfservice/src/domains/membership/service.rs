//! Application-layer orchestration of the membership application lifecycle.
//!
//! Every mutating operation runs inside the transactional unit of work, so
//! aggregate changes and their domain events commit atomically and reach the
//! broker through the outbox relay. All operations are written to be safely
//! replayable: the policies that call them run under at-least-once delivery.

use chrono::Duration;
use std::sync::Arc;
use thiserror::Error;

use crate::common::{ApplicationId, CapabilityId, UserId};
use crate::domains::membership::models::{
    CancelReason, DomainError, Membership, MembershipApplication,
};
use crate::domains::membership::quorum::ApprovalQuorumPolicy;
use crate::kernel::clock::Clock;
use crate::kernel::persistence::{transactional, Database, StoreError, StoreTx, UnitOfWork};

/// How long an application may stay pending before the sweeper cancels it.
const EXPIRY_WINDOW_DAYS: i64 = 15;

/// Errors surfaced by the membership application service.
#[derive(Debug, Error)]
pub enum SelfServiceError {
    #[error("{entity} \"{id}\" was not found")]
    EntityNotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("user \"{user_id}\" already has a pending membership application for capability \"{capability_id}\"")]
    PendingApplicationAlreadyExists {
        user_id: UserId,
        capability_id: CapabilityId,
    },

    #[error("user \"{user_id}\" is already a member of capability \"{capability_id}\"")]
    AlreadyHasActiveMembership {
        user_id: UserId,
        capability_id: CapabilityId,
    },

    #[error("user \"{user_id}\" is not authorized to approve membership application \"{application_id}\"")]
    NotAuthorizedToApprove {
        user_id: UserId,
        application_id: ApplicationId,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SelfServiceError {
    /// Infrastructure faults must propagate so the broker redelivers;
    /// everything else is a business condition a policy may log and skip.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Orchestrates membership applications over the persistence and clock
/// seams.
pub struct MembershipApplicationService<D: Database> {
    db: D,
    clock: Arc<dyn Clock>,
}

impl<D: Database> MembershipApplicationService<D> {
    pub fn new(db: D, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Submits a new membership application for `applicant`.
    ///
    /// Enforces the service-boundary invariants: the capability must exist,
    /// the applicant must not already be a member, and at most one pending
    /// application per (applicant, capability) pair may exist.
    pub async fn submit_membership_application(
        &self,
        capability_id: CapabilityId,
        applicant: UserId,
    ) -> Result<ApplicationId, SelfServiceError> {
        let now = self.clock.now();

        transactional(&self.db, |uow| {
            Box::pin(async move {
                if !uow.store().capability_exists(capability_id).await? {
                    return Err(SelfServiceError::EntityNotFound {
                        entity: "capability",
                        id: capability_id.to_string(),
                    });
                }

                if uow
                    .store()
                    .has_active_membership(capability_id, &applicant)
                    .await?
                {
                    return Err(SelfServiceError::AlreadyHasActiveMembership {
                        user_id: applicant,
                        capability_id,
                    });
                }

                let pending = uow
                    .store()
                    .pending_applications_for(capability_id, &applicant)
                    .await?;
                if !pending.is_empty() {
                    return Err(SelfServiceError::PendingApplicationAlreadyExists {
                        user_id: applicant,
                        capability_id,
                    });
                }

                let mut application = MembershipApplication::submit(
                    capability_id,
                    applicant.clone(),
                    now,
                    Duration::days(EXPIRY_WINDOW_DAYS),
                );
                uow.store().insert_application(&application).await?;
                uow.collect(&mut application);

                tracing::info!(
                    application_id = %application.id(),
                    capability_id = %capability_id,
                    applicant = %applicant,
                    "membership application submitted"
                );

                Ok(application.id())
            })
        })
        .await
    }

    /// Registers an approval by `approved_by`, who must be an active member
    /// of the target capability.
    pub async fn approve_membership_application(
        &self,
        application_id: ApplicationId,
        approved_by: UserId,
    ) -> Result<(), SelfServiceError> {
        let now = self.clock.now();

        transactional(&self.db, |uow| {
            Box::pin(async move {
                let mut application = uow
                    .store()
                    .find_application(application_id)
                    .await?
                    .ok_or(SelfServiceError::EntityNotFound {
                        entity: "membership application",
                        id: application_id.to_string(),
                    })?;

                let members = uow
                    .store()
                    .active_member_ids(application.capability_id())
                    .await?;
                if !members.contains(&approved_by) {
                    tracing::warn!(
                        application_id = %application_id,
                        user_id = %approved_by,
                        capability_id = %application.capability_id(),
                        "approver is not an active member of the capability"
                    );
                    return Err(SelfServiceError::NotAuthorizedToApprove {
                        user_id: approved_by,
                        application_id,
                    });
                }

                application.approve(approved_by.clone(), now)?;
                uow.store().update_application(&application).await?;
                uow.collect(&mut application);

                tracing::debug!(
                    application_id = %application_id,
                    user_id = %approved_by,
                    "membership application received approval"
                );

                Ok(())
            })
        })
        .await
    }

    /// Finalizes the application if quorum is met; a quiet no-op otherwise.
    ///
    /// Called speculatively after every approval, and safe under redelivery:
    /// an application that already left `PendingApproval` is left untouched.
    pub async fn try_finalize_membership_application(
        &self,
        application_id: ApplicationId,
    ) -> Result<(), SelfServiceError> {
        let now = self.clock.now();

        transactional(&self.db, |uow| {
            Box::pin(async move {
                let mut application = uow
                    .store()
                    .find_application(application_id)
                    .await?
                    .ok_or(SelfServiceError::EntityNotFound {
                        entity: "membership application",
                        id: application_id.to_string(),
                    })?;

                if !application.is_pending() {
                    tracing::debug!(
                        application_id = %application_id,
                        status = %application.status(),
                        "membership application is no longer pending - nothing to finalize"
                    );
                    return Ok(());
                }

                let members = uow
                    .store()
                    .active_member_ids(application.capability_id())
                    .await?;

                if !ApprovalQuorumPolicy::is_quorum_met(&members, application.approvals()) {
                    tracing::debug!(
                        application_id = %application_id,
                        "could not yet finalize membership application approvals"
                    );
                    return Ok(());
                }

                application.finalize(now)?;
                uow.store().update_application(&application).await?;
                uow.collect(&mut application);

                tracing::info!(
                    application_id = %application_id,
                    capability_id = %application.capability_id(),
                    "finalized membership application approvals"
                );

                Ok(())
            })
        })
        .await
    }

    /// Converts a finalized application into an actual membership.
    pub async fn accept_application(
        &self,
        application_id: ApplicationId,
    ) -> Result<(), SelfServiceError> {
        let now = self.clock.now();

        transactional(&self.db, |uow| {
            Box::pin(async move {
                let application = uow
                    .store()
                    .find_application(application_id)
                    .await?
                    .ok_or(SelfServiceError::EntityNotFound {
                        entity: "membership application",
                        id: application_id.to_string(),
                    })?;

                if !application.is_finalized() {
                    return Err(DomainError::InvalidState {
                        id: application_id,
                        status: application.status(),
                        operation: "accept",
                    }
                    .into());
                }

                let capability_id = application.capability_id();
                if !uow.store().capability_exists(capability_id).await? {
                    return Err(SelfServiceError::EntityNotFound {
                        entity: "capability",
                        id: capability_id.to_string(),
                    });
                }

                let applicant = application.applicant().clone();
                match Self::create_and_add_membership(uow, capability_id, applicant.clone(), now)
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(SelfServiceError::AlreadyHasActiveMembership { .. }) => {
                        tracing::warn!(
                            user_id = %applicant,
                            capability_id = %capability_id,
                            "user is already a member of the capability"
                        );
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            })
        })
        .await
    }

    /// Physically removes a cancelled application. Cancelled applications
    /// are the only ones that may be purged.
    pub async fn remove_membership_application(
        &self,
        application_id: ApplicationId,
    ) -> Result<(), SelfServiceError> {
        transactional(&self.db, |uow| {
            Box::pin(async move {
                let application = uow
                    .store()
                    .find_application(application_id)
                    .await?
                    .ok_or(SelfServiceError::EntityNotFound {
                        entity: "membership application",
                        id: application_id.to_string(),
                    })?;

                if !application.is_cancelled() {
                    return Err(DomainError::InvalidState {
                        id: application_id,
                        status: application.status(),
                        operation: "remove",
                    }
                    .into());
                }

                uow.store().delete_application(application_id).await?;

                tracing::info!(
                    application_id = %application_id,
                    "removed cancelled membership application"
                );

                Ok(())
            })
        })
        .await
    }

    /// Cancels every pending application that outlived its deadline.
    /// Returns how many applications were cancelled.
    ///
    /// Cancellation flows through the aggregate, so each cancelled
    /// application emits its event through the outbox and is later purged by
    /// the removal policy.
    pub async fn cancel_expired_membership_applications(
        &self,
    ) -> Result<usize, SelfServiceError> {
        let now = self.clock.now();

        transactional(&self.db, |uow| {
            Box::pin(async move {
                let expired = uow.store().expired_pending_applications(now).await?;
                let count = expired.len();

                for mut application in expired {
                    tracing::debug!(
                        application_id = %application.id(),
                        capability_id = %application.capability_id(),
                        applicant = %application.applicant(),
                        "membership application has expired"
                    );

                    application.cancel(now, CancelReason::Expired);
                    uow.store().update_application(&application).await?;
                    uow.collect(&mut application);
                }

                Ok(count)
            })
        })
        .await
    }

    /// Adds the creator of a freshly created capability as its first member.
    /// Safe under redelivery of the capability-created event.
    pub async fn add_creator_as_initial_member(
        &self,
        capability_id: CapabilityId,
        creator: UserId,
    ) -> Result<(), SelfServiceError> {
        let now = self.clock.now();

        tracing::info!(
            user_id = %creator,
            capability_id = %capability_id,
            "adding creator as initial member"
        );

        transactional(&self.db, |uow| {
            Box::pin(async move {
                match Self::create_and_add_membership(uow, capability_id, creator.clone(), now)
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(SelfServiceError::AlreadyHasActiveMembership { .. }) => {
                        tracing::warn!(
                            user_id = %creator,
                            capability_id = %capability_id,
                            "creator is already a member of the capability"
                        );
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            })
        })
        .await
    }

    /// Directly adds a user as a member, bypassing the application flow.
    /// Used by administrative tooling.
    pub async fn join_capability(
        &self,
        capability_id: CapabilityId,
        user_id: UserId,
    ) -> Result<(), SelfServiceError> {
        let now = self.clock.now();

        transactional(&self.db, |uow| {
            Box::pin(async move {
                if !uow.store().capability_exists(capability_id).await? {
                    return Err(SelfServiceError::EntityNotFound {
                        entity: "capability",
                        id: capability_id.to_string(),
                    });
                }

                Self::create_and_add_membership(uow, capability_id, user_id, now).await
            })
        })
        .await
    }

    /// Creates the membership and cancels any pending applications the user
    /// still has for the capability, since another path made them moot.
    async fn create_and_add_membership(
        uow: &mut UnitOfWork<D::Tx>,
        capability_id: CapabilityId,
        user_id: UserId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), SelfServiceError> {
        if uow
            .store()
            .has_active_membership(capability_id, &user_id)
            .await?
        {
            return Err(SelfServiceError::AlreadyHasActiveMembership {
                user_id,
                capability_id,
            });
        }

        let mut membership = Membership::create_for(capability_id, user_id.clone(), now);
        uow.store().insert_membership(&membership).await?;
        uow.collect(&mut membership);

        let superseded = uow
            .store()
            .pending_applications_for(capability_id, &user_id)
            .await?;
        for mut application in superseded {
            application.cancel(now, CancelReason::Superseded);
            uow.store().update_application(&application).await?;
            uow.collect(&mut application);

            tracing::debug!(
                application_id = %application.id(),
                "cancelled superseded membership application"
            );
        }

        tracing::info!(
            user_id = %user_id,
            capability_id = %capability_id,
            "user has joined capability"
        );

        Ok(())
    }
}
