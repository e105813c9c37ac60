//! Reactive policies - the broker-facing side of the membership domain.
//!
//! Each policy subscribes to one message type and performs a single,
//! idempotent state transition by calling back into the service, closing the
//! loop that the outbox relay opened:
//!
//! ```text
//! approved  ──► FinalizeMembershipApplication            ──► try_finalize
//! finalized ──► ConvertMembershipApplicationToActualMembership ──► accept
//! cancelled ──► RemoveCancelledMembershipApplication     ──► remove
//! capability-created ──► AddCreatorAsInitialMember       ──► initial member
//! ```
//!
//! Policies never throw for conditions a redelivered or stale message can
//! cause: unparsable ids, missing applications and business-rule conflicts
//! are logged and the message is acknowledged as handled. Only
//! infrastructure faults propagate, leaving the message to the broker's
//! redelivery.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::common::{ApplicationId, CapabilityId, UserId};
use crate::domains::membership::service::{MembershipApplicationService, SelfServiceError};
use crate::kernel::consumer::{MessageEnvelope, MessageHandler};
use crate::kernel::persistence::Database;

fn application_id_from(envelope: &MessageEnvelope) -> Option<ApplicationId> {
    envelope
        .data
        .get("membershipApplicationId")?
        .as_str()?
        .parse()
        .ok()
}

fn skip_or_fail(policy: &'static str, envelope: &MessageEnvelope, err: SelfServiceError) -> Result<()> {
    if err.is_infrastructure() {
        return Err(err.into());
    }

    tracing::warn!(
        policy,
        message_id = %envelope.message_id,
        error = %err,
        "skipping message"
    );
    Ok(())
}

/// Reacts to an approval by attempting to finalize the application.
pub struct FinalizeMembershipApplication<D: Database> {
    service: Arc<MembershipApplicationService<D>>,
}

impl<D: Database> FinalizeMembershipApplication<D> {
    pub fn new(service: Arc<MembershipApplicationService<D>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<D: Database> MessageHandler for FinalizeMembershipApplication<D> {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<()> {
        let Some(application_id) = application_id_from(envelope) else {
            tracing::warn!(
                message_id = %envelope.message_id,
                "cannot try to finalize membership application because the id is not valid - skipping message"
            );
            return Ok(());
        };

        tracing::debug!(
            application_id = %application_id,
            "trying to finalize membership application"
        );

        match self
            .service
            .try_finalize_membership_application(application_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => skip_or_fail("FinalizeMembershipApplication", envelope, err),
        }
    }
}

/// Reacts to a finalized application by creating the actual membership.
pub struct ConvertMembershipApplicationToActualMembership<D: Database> {
    service: Arc<MembershipApplicationService<D>>,
}

impl<D: Database> ConvertMembershipApplicationToActualMembership<D> {
    pub fn new(service: Arc<MembershipApplicationService<D>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<D: Database> MessageHandler for ConvertMembershipApplicationToActualMembership<D> {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<()> {
        let Some(application_id) = application_id_from(envelope) else {
            tracing::warn!(
                message_id = %envelope.message_id,
                "cannot accept membership application because the id is not valid - skipping message"
            );
            return Ok(());
        };

        tracing::debug!(application_id = %application_id, "accepting membership application");

        match self.service.accept_application(application_id).await {
            Ok(()) => Ok(()),
            Err(err) => skip_or_fail(
                "ConvertMembershipApplicationToActualMembership",
                envelope,
                err,
            ),
        }
    }
}

/// Reacts to a cancellation by purging the application row.
pub struct RemoveCancelledMembershipApplication<D: Database> {
    service: Arc<MembershipApplicationService<D>>,
}

impl<D: Database> RemoveCancelledMembershipApplication<D> {
    pub fn new(service: Arc<MembershipApplicationService<D>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<D: Database> MessageHandler for RemoveCancelledMembershipApplication<D> {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<()> {
        let Some(application_id) = application_id_from(envelope) else {
            tracing::warn!(
                message_id = %envelope.message_id,
                "cannot remove membership application because the id is not valid - skipping message"
            );
            return Ok(());
        };

        tracing::debug!(
            application_id = %application_id,
            "removing cancelled membership application"
        );

        match self
            .service
            .remove_membership_application(application_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => skip_or_fail("RemoveCancelledMembershipApplication", envelope, err),
        }
    }
}

/// Reacts to a capability being created by adding its creator as the first
/// member.
pub struct AddCreatorAsInitialMember<D: Database> {
    service: Arc<MembershipApplicationService<D>>,
}

impl<D: Database> AddCreatorAsInitialMember<D> {
    pub fn new(service: Arc<MembershipApplicationService<D>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<D: Database> MessageHandler for AddCreatorAsInitialMember<D> {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<()> {
        let capability_id: Option<CapabilityId> = envelope
            .data
            .get("capabilityId")
            .and_then(|v| v.as_str())
            .and_then(|raw| raw.parse().ok());
        let creator: Option<UserId> = envelope
            .data
            .get("requestedBy")
            .and_then(|v| v.as_str())
            .and_then(|raw| raw.parse().ok());

        let (Some(capability_id), Some(creator)) = (capability_id, creator) else {
            tracing::warn!(
                message_id = %envelope.message_id,
                "cannot add initial member because the capability-created payload is not valid - skipping message"
            );
            return Ok(());
        };

        match self
            .service
            .add_creator_as_initial_member(capability_id, creator)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => skip_or_fail("AddCreatorAsInitialMember", envelope, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::membership::events::{
        CAPABILITY_CREATED, MEMBERSHIP_APPLICATION_APPROVED, MEMBERSHIP_APPLICATION_CANCELLED,
        MEMBERSHIP_APPLICATION_FINALIZED,
    };
    use crate::domains::membership::models::ApplicationStatus;
    use crate::kernel::consumer::HandlerRegistry;
    use crate::kernel::outbox::OutboxRelay;
    use crate::kernel::producer::TestProducer;
    use crate::kernel::test_dependencies::{FixedClock, InMemoryDatabase};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (
        InMemoryDatabase,
        Arc<MembershipApplicationService<InMemoryDatabase>>,
        CapabilityId,
    ) {
        let db = InMemoryDatabase::new();
        let capability_id = db.seed_capability("payments");
        let service = Arc::new(MembershipApplicationService::new(
            db.clone(),
            Arc::new(FixedClock(fixed_now())),
        ));
        (db, service, capability_id)
    }

    fn approval_envelope(application_id: ApplicationId) -> MessageEnvelope {
        MessageEnvelope::new(
            MEMBERSHIP_APPLICATION_APPROVED,
            json!({"membershipApplicationId": application_id.to_string()}),
        )
    }

    #[tokio::test]
    async fn test_finalize_policy_finalizes_on_quorum() {
        let (db, service, capability_id) = setup();
        db.seed_member(capability_id, "bob@acme.co");

        let id = service
            .submit_membership_application(capability_id, UserId::new("alice@acme.co"))
            .await
            .unwrap();
        service
            .approve_membership_application(id, UserId::new("bob@acme.co"))
            .await
            .unwrap();

        let policy = FinalizeMembershipApplication::new(service);
        policy.handle(&approval_envelope(id)).await.unwrap();

        assert_eq!(
            db.application(id).unwrap().status(),
            ApplicationStatus::Finalized
        );
    }

    #[tokio::test]
    async fn test_policies_skip_malformed_ids() {
        let (_db, service, _) = setup();

        let envelope = MessageEnvelope::new(
            MEMBERSHIP_APPLICATION_APPROVED,
            json!({"membershipApplicationId": "not-a-uuid"}),
        );

        FinalizeMembershipApplication::new(service.clone())
            .handle(&envelope)
            .await
            .unwrap();
        ConvertMembershipApplicationToActualMembership::new(service.clone())
            .handle(&envelope)
            .await
            .unwrap();
        RemoveCancelledMembershipApplication::new(service)
            .handle(&envelope)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_policies_skip_unknown_application_ids() {
        let (_db, service, _) = setup();
        let envelope = approval_envelope(ApplicationId::new());

        // The id may belong to a transaction that rolled back elsewhere; the
        // message is acknowledged, not retried.
        FinalizeMembershipApplication::new(service.clone())
            .handle(&envelope)
            .await
            .unwrap();
        ConvertMembershipApplicationToActualMembership::new(service.clone())
            .handle(&envelope)
            .await
            .unwrap();
        RemoveCancelledMembershipApplication::new(service)
            .handle(&envelope)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_replayed_approval_message_does_not_double_count() {
        let (db, service, capability_id) = setup();
        db.seed_member(capability_id, "bob@acme.co");

        let id = service
            .submit_membership_application(capability_id, UserId::new("alice@acme.co"))
            .await
            .unwrap();
        service
            .approve_membership_application(id, UserId::new("bob@acme.co"))
            .await
            .unwrap();

        let policy = FinalizeMembershipApplication::new(service);
        let envelope = approval_envelope(id);
        policy.handle(&envelope).await.unwrap();
        policy.handle(&envelope).await.unwrap();

        let application = db.application(id).unwrap();
        assert_eq!(application.approvals().len(), 1);
        assert_eq!(application.status(), ApplicationStatus::Finalized);
        // One finalized event, not two.
        assert_eq!(
            db.outbox_entries()
                .iter()
                .filter(|e| e.event_type == MEMBERSHIP_APPLICATION_FINALIZED)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_remove_policy_purges_cancelled_application() {
        let (db, service, capability_id) = setup();

        let id = service
            .submit_membership_application(capability_id, UserId::new("alice@acme.co"))
            .await
            .unwrap();

        let sweeper = MembershipApplicationService::new(
            db.clone(),
            Arc::new(FixedClock(fixed_now() + chrono::Duration::days(16))),
        );
        sweeper.cancel_expired_membership_applications().await.unwrap();

        let policy = RemoveCancelledMembershipApplication::new(service);
        policy
            .handle(&MessageEnvelope::new(
                MEMBERSHIP_APPLICATION_CANCELLED,
                json!({"membershipApplicationId": id.to_string(), "reason": "expired"}),
            ))
            .await
            .unwrap();

        assert_eq!(db.applications_count(), 0);
    }

    #[tokio::test]
    async fn test_capability_created_policy_adds_initial_member() {
        let (db, service, capability_id) = setup();

        let policy = AddCreatorAsInitialMember::new(service);
        let envelope = MessageEnvelope::new(
            CAPABILITY_CREATED,
            json!({
                "capabilityId": capability_id.to_string(),
                "requestedBy": "carol@acme.co",
            }),
        );

        policy.handle(&envelope).await.unwrap();
        // Redelivery is harmless.
        policy.handle(&envelope).await.unwrap();

        assert!(db.membership_exists(capability_id, "carol@acme.co"));
    }

    /// Drives the full loop the way production does: service call, relay
    /// drain, registry dispatch, repeat until quiescent.
    async fn pump(
        relay: &OutboxRelay<InMemoryDatabase>,
        producer: &TestProducer,
        registry: &HandlerRegistry,
    ) {
        let mut delivered = 0;
        loop {
            relay.drain_once().await.unwrap();
            let published = producer.published_messages();
            if delivered == published.len() {
                break;
            }
            for message in &published[delivered..] {
                let envelope: MessageEnvelope =
                    serde_json::from_slice(&message.payload).unwrap();
                registry.dispatch(&envelope).await.unwrap();
            }
            delivered = published.len();
        }
    }

    #[tokio::test]
    async fn test_end_to_end_event_loop_from_approval_to_membership() {
        let (db, service, capability_id) = setup();
        db.seed_member(capability_id, "bob@acme.co");

        let producer = Arc::new(TestProducer::new());
        let relay = OutboxRelay::new(db.clone(), producer.clone());
        let registry = HandlerRegistry::new()
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
            );

        let id = service
            .submit_membership_application(capability_id, UserId::new("alice@acme.co"))
            .await
            .unwrap();
        service
            .approve_membership_application(id, UserId::new("bob@acme.co"))
            .await
            .unwrap();

        pump(&relay, &producer, &registry).await;

        // The approval drove finalization, the finalization drove membership
        // creation, and everything was published.
        assert_eq!(
            db.application(id).unwrap().status(),
            ApplicationStatus::Finalized
        );
        assert!(db.membership_exists(capability_id, "alice@acme.co"));
        assert_eq!(db.undispatched_count(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_expiry_sweep_leads_to_removal() {
        let (db, service, capability_id) = setup();

        let producer = Arc::new(TestProducer::new());
        let relay = OutboxRelay::new(db.clone(), producer.clone());
        let registry = HandlerRegistry::new().register(
            MEMBERSHIP_APPLICATION_CANCELLED,
            Arc::new(RemoveCancelledMembershipApplication::new(service.clone())),
        );

        let id = service
            .submit_membership_application(capability_id, UserId::new("alice@acme.co"))
            .await
            .unwrap();

        let sweeper = MembershipApplicationService::new(
            db.clone(),
            Arc::new(FixedClock(fixed_now() + chrono::Duration::days(16))),
        );
        assert_eq!(
            sweeper.cancel_expired_membership_applications().await.unwrap(),
            1
        );
        assert_eq!(
            db.application(id).unwrap().status(),
            ApplicationStatus::Cancelled
        );

        pump(&relay, &producer, &registry).await;

        // The cancelled event was published and its policy purged the row.
        assert_eq!(db.applications_count(), 0);
        assert_eq!(db.undispatched_count(), 0);
    }
}
