//! Unit of work over the relational store.
//!
//! Service operations run inside `transactional(...)`: a transaction opens,
//! the operation mutates aggregates and saves them through the [`StoreTx`]
//! handle, drained domain events are staged as outbox rows, and everything
//! commits together. If the operation fails, the transaction is dropped and
//! rolls back - an aggregate change and its events are committed together or
//! not at all, and the outbox is never polluted by a failed use case.
//!
//! The combinator is deliberately explicit: the unit-of-work boundary is
//! visible at every call site instead of being woven in by attributes or
//! interceptors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::Postgres;
use sqlx::{PgConnection, PgPool, Transaction};
use std::collections::HashSet;
use thiserror::Error;

use crate::common::{ApplicationId, CapabilityId, UserId};
use crate::domains::membership::events::EventSource;
use crate::domains::membership::models::{
    ApplicationStatus, Membership, MembershipApplication, MembershipApproval,
};
use crate::kernel::outbox::OutboxEntry;

// ============================================================================
// Errors
// ============================================================================

/// Infrastructure-level persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid persisted state: {0}")]
    InvalidData(String),
}

// ============================================================================
// Unit-of-work seams
// ============================================================================

/// Opens transactions against the backing store.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    type Tx: StoreTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// A transaction handle exposing the aggregate repositories.
///
/// Dropping the handle without calling [`StoreTx::commit`] rolls the
/// transaction back.
#[async_trait]
pub trait StoreTx: Send {
    async fn capability_exists(&mut self, capability_id: CapabilityId) -> Result<bool, StoreError>;

    async fn has_active_membership(
        &mut self,
        capability_id: CapabilityId,
        user_id: &UserId,
    ) -> Result<bool, StoreError>;

    /// Active members of a capability, for the quorum policy and approver
    /// authorization.
    async fn active_member_ids(
        &mut self,
        capability_id: CapabilityId,
    ) -> Result<HashSet<UserId>, StoreError>;

    async fn insert_membership(&mut self, membership: &Membership) -> Result<(), StoreError>;

    async fn find_application(
        &mut self,
        id: ApplicationId,
    ) -> Result<Option<MembershipApplication>, StoreError>;

    /// Pending applications of one applicant for one capability, oldest
    /// first.
    async fn pending_applications_for(
        &mut self,
        capability_id: CapabilityId,
        applicant: &UserId,
    ) -> Result<Vec<MembershipApplication>, StoreError>;

    /// Pending applications whose deadline has passed.
    async fn expired_pending_applications(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MembershipApplication>, StoreError>;

    async fn insert_application(
        &mut self,
        application: &MembershipApplication,
    ) -> Result<(), StoreError>;

    async fn update_application(
        &mut self,
        application: &MembershipApplication,
    ) -> Result<(), StoreError>;

    async fn delete_application(&mut self, id: ApplicationId) -> Result<(), StoreError>;

    /// Append outbox rows through this transaction.
    async fn stage_outbox(&mut self, entries: &[OutboxEntry]) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// Tracks the open transaction plus the outbox rows staged for it.
pub struct UnitOfWork<S: StoreTx> {
    store: S,
    staged: Vec<OutboxEntry>,
}

impl<S: StoreTx> UnitOfWork<S> {
    fn new(store: S) -> Self {
        Self {
            store,
            staged: Vec::new(),
        }
    }

    /// Access the repositories of the open transaction.
    pub fn store(&mut self) -> &mut S {
        &mut self.store
    }

    /// Drains the aggregate's recorded events into the staged outbox batch.
    ///
    /// Call once per mutated aggregate, after persisting its row changes.
    pub fn collect<A: EventSource>(&mut self, aggregate: &mut A) {
        self.staged
            .extend(aggregate.drain_events().into_iter().map(OutboxEntry::from));
    }

    async fn complete(mut self) -> Result<(), StoreError> {
        if !self.staged.is_empty() {
            self.store.stage_outbox(&self.staged).await?;
        }
        self.store.commit().await
    }
}

/// Runs `op` inside a transaction, then writes the staged outbox rows and
/// commits. On error the transaction rolls back and the error propagates
/// untouched.
///
/// Generic over the error type so any use case can be decorated; the only
/// requirement is that infrastructure faults convert into it.
pub async fn transactional<D, T, E, F>(db: &D, op: F) -> Result<T, E>
where
    D: Database,
    E: From<StoreError>,
    F: for<'u> FnOnce(&'u mut UnitOfWork<D::Tx>) -> BoxFuture<'u, Result<T, E>> + Send,
{
    let store = db.begin().await?;
    let mut uow = UnitOfWork::new(store);

    let value = op(&mut uow).await?;
    uow.complete().await?;

    Ok(value)
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

/// PostgreSQL-backed [`Database`].
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Tx = PgStoreTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(PgStoreTx {
            tx: self.pool.begin().await?,
        })
    }
}

/// An open PostgreSQL transaction.
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

impl PgStoreTx {
    fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[derive(sqlx::FromRow)]
struct ApplicationRow {
    id: ApplicationId,
    capability_id: CapabilityId,
    applicant: UserId,
    status: String,
    submitted_at: DateTime<Utc>,
    expires_on: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    approved_by: UserId,
    approved_at: DateTime<Utc>,
}

impl ApplicationRow {
    fn into_aggregate(
        self,
        approvals: Vec<ApprovalRow>,
    ) -> Result<MembershipApplication, StoreError> {
        let status = ApplicationStatus::parse(&self.status).ok_or_else(|| {
            StoreError::InvalidData(format!(
                "unknown membership application status {:?} on {}",
                self.status, self.id
            ))
        })?;

        Ok(MembershipApplication::from_parts(
            self.id,
            self.capability_id,
            self.applicant,
            status,
            self.submitted_at,
            self.expires_on,
            approvals
                .into_iter()
                .map(|row| MembershipApproval {
                    approved_by: row.approved_by,
                    approved_at: row.approved_at,
                })
                .collect(),
        ))
    }
}

async fn load_approvals(
    conn: &mut PgConnection,
    application_id: ApplicationId,
) -> Result<Vec<ApprovalRow>, StoreError> {
    sqlx::query_as::<_, ApprovalRow>(
        "SELECT approved_by, approved_at
         FROM membership_approvals
         WHERE application_id = $1
         ORDER BY approved_at",
    )
    .bind(application_id)
    .fetch_all(conn)
    .await
    .map_err(Into::into)
}

async fn load_aggregates(
    conn: &mut PgConnection,
    rows: Vec<ApplicationRow>,
) -> Result<Vec<MembershipApplication>, StoreError> {
    let mut applications = Vec::with_capacity(rows.len());
    for row in rows {
        let approvals = load_approvals(conn, row.id).await?;
        applications.push(row.into_aggregate(approvals)?);
    }
    Ok(applications)
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn capability_exists(&mut self, capability_id: CapabilityId) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM capabilities WHERE id = $1)")
            .bind(capability_id)
            .fetch_one(self.conn())
            .await
            .map_err(Into::into)
    }

    async fn has_active_membership(
        &mut self,
        capability_id: CapabilityId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM memberships WHERE capability_id = $1 AND user_id = $2)",
        )
        .bind(capability_id)
        .bind(user_id)
        .fetch_one(self.conn())
        .await
        .map_err(Into::into)
    }

    async fn active_member_ids(
        &mut self,
        capability_id: CapabilityId,
    ) -> Result<HashSet<UserId>, StoreError> {
        let members = sqlx::query_scalar::<_, UserId>(
            "SELECT user_id FROM memberships WHERE capability_id = $1",
        )
        .bind(capability_id)
        .fetch_all(self.conn())
        .await?;

        Ok(members.into_iter().collect())
    }

    async fn insert_membership(&mut self, membership: &Membership) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO memberships (id, capability_id, user_id, joined_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(membership.id())
        .bind(membership.capability_id())
        .bind(membership.user_id())
        .bind(membership.joined_at())
        .execute(self.conn())
        .await?;

        Ok(())
    }

    async fn find_application(
        &mut self,
        id: ApplicationId,
    ) -> Result<Option<MembershipApplication>, StoreError> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            "SELECT id, capability_id, applicant, status, submitted_at, expires_on
             FROM membership_applications
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.conn())
        .await?;

        match row {
            Some(row) => {
                let approvals = load_approvals(self.conn(), row.id).await?;
                Ok(Some(row.into_aggregate(approvals)?))
            }
            None => Ok(None),
        }
    }

    async fn pending_applications_for(
        &mut self,
        capability_id: CapabilityId,
        applicant: &UserId,
    ) -> Result<Vec<MembershipApplication>, StoreError> {
        let rows = sqlx::query_as::<_, ApplicationRow>(
            "SELECT id, capability_id, applicant, status, submitted_at, expires_on
             FROM membership_applications
             WHERE capability_id = $1 AND applicant = $2 AND status = 'pending_approval'
             ORDER BY submitted_at",
        )
        .bind(capability_id)
        .bind(applicant)
        .fetch_all(self.conn())
        .await?;

        load_aggregates(self.conn(), rows).await
    }

    async fn expired_pending_applications(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MembershipApplication>, StoreError> {
        let rows = sqlx::query_as::<_, ApplicationRow>(
            "SELECT id, capability_id, applicant, status, submitted_at, expires_on
             FROM membership_applications
             WHERE status = 'pending_approval' AND expires_on <= $1
             ORDER BY expires_on",
        )
        .bind(now)
        .fetch_all(self.conn())
        .await?;

        load_aggregates(self.conn(), rows).await
    }

    async fn insert_application(
        &mut self,
        application: &MembershipApplication,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO membership_applications
                 (id, capability_id, applicant, status, submitted_at, expires_on)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(application.id())
        .bind(application.capability_id())
        .bind(application.applicant())
        .bind(application.status().as_str())
        .bind(application.submitted_at())
        .bind(application.expires_on())
        .execute(self.conn())
        .await?;

        Ok(())
    }

    async fn update_application(
        &mut self,
        application: &MembershipApplication,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE membership_applications SET status = $2 WHERE id = $1")
            .bind(application.id())
            .bind(application.status().as_str())
            .execute(self.conn())
            .await?;

        // The approval set is tiny and append-only; re-inserting with a
        // conflict guard keeps the write idempotent.
        for approval in application.approvals() {
            sqlx::query(
                "INSERT INTO membership_approvals (application_id, approved_by, approved_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (application_id, approved_by) DO NOTHING",
            )
            .bind(application.id())
            .bind(&approval.approved_by)
            .bind(approval.approved_at)
            .execute(self.conn())
            .await?;
        }

        Ok(())
    }

    async fn delete_application(&mut self, id: ApplicationId) -> Result<(), StoreError> {
        // Approvals cascade.
        sqlx::query("DELETE FROM membership_applications WHERE id = $1")
            .bind(id)
            .execute(self.conn())
            .await?;

        Ok(())
    }

    async fn stage_outbox(&mut self, entries: &[OutboxEntry]) -> Result<(), StoreError> {
        for entry in entries {
            sqlx::query(
                "INSERT INTO outbox
                     (id, event_type, topic, partition_key, payload, occurred_at, dispatched_at)
                 VALUES ($1, $2, $3, $4, $5, $6, NULL)",
            )
            .bind(entry.id)
            .bind(&entry.event_type)
            .bind(&entry.topic)
            .bind(&entry.partition_key)
            .bind(&entry.payload)
            .bind(entry.occurred_at)
            .execute(self.conn())
            .await?;
        }

        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::membership::models::CancelReason;
    use crate::kernel::test_dependencies::InMemoryDatabase;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_commit_persists_aggregate_and_outbox_together() {
        let db = InMemoryDatabase::new();
        let capability_id = db.seed_capability("payments");

        let result: Result<ApplicationId, StoreError> = transactional(&db, |uow| {
            Box::pin(async move {
                let mut application = MembershipApplication::submit(
                    capability_id,
                    UserId::new("alice@acme.co"),
                    now(),
                    Duration::days(15),
                );
                uow.store().insert_application(&application).await?;
                uow.collect(&mut application);
                Ok(application.id())
            })
        })
        .await;

        let id = result.unwrap();
        assert!(db.application(id).is_some());
        // One event recorded -> one outbox row committed.
        assert_eq!(db.outbox_entries().len(), 1);
        assert_eq!(db.outbox_entries()[0].event_type, "membership-submitted");
    }

    #[tokio::test]
    async fn test_failed_operation_commits_nothing() {
        let db = InMemoryDatabase::new();
        let capability_id = db.seed_capability("payments");

        let result: Result<(), StoreError> = transactional(&db, |uow| {
            Box::pin(async move {
                let mut application = MembershipApplication::submit(
                    capability_id,
                    UserId::new("alice@acme.co"),
                    now(),
                    Duration::days(15),
                );
                uow.store().insert_application(&application).await?;
                uow.collect(&mut application);
                // The use case fails after staging - everything must roll
                // back.
                Err(StoreError::InvalidData("boom".to_string()))
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(db.applications_count(), 0);
        assert_eq!(db.outbox_entries().len(), 0);
    }

    #[tokio::test]
    async fn test_outbox_rows_match_recorded_events_across_aggregates() {
        let db = InMemoryDatabase::new();
        let capability_id = db.seed_capability("payments");

        let _: Result<(), StoreError> = transactional(&db, |uow| {
            Box::pin(async move {
                let mut application = MembershipApplication::submit(
                    capability_id,
                    UserId::new("alice@acme.co"),
                    now(),
                    Duration::days(15),
                );
                application.cancel(now(), CancelReason::Superseded);
                uow.store().insert_application(&application).await?;
                uow.collect(&mut application);

                let mut membership =
                    Membership::create_for(capability_id, UserId::new("alice@acme.co"), now());
                uow.store().insert_membership(&membership).await?;
                uow.collect(&mut membership);

                Ok(())
            })
        })
        .await;

        // Two aggregates, three events, three rows - in recording order.
        let entries = db.outbox_entries();
        let types: Vec<&str> = entries.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "membership-submitted",
                "membership-application-cancelled",
                "user-has-joined-capability",
            ]
        );
    }

    #[tokio::test]
    async fn test_drained_aggregate_has_no_events_left() {
        let db = InMemoryDatabase::new();
        let capability_id = db.seed_capability("payments");

        let _: Result<(), StoreError> = transactional(&db, |uow| {
            Box::pin(async move {
                let mut application = MembershipApplication::submit(
                    capability_id,
                    UserId::new("alice@acme.co"),
                    now(),
                    Duration::days(15),
                );
                uow.store().insert_application(&application).await?;
                uow.collect(&mut application);
                // A second collect stages nothing: ownership of the buffer
                // moved on the first drain.
                uow.collect(&mut application);
                Ok(())
            })
        })
        .await;

        assert_eq!(db.outbox_entries().len(), 1);
    }
}
