//! In-memory implementations of the persistence seams for tests.
//!
//! [`InMemoryDatabase`] honours the transactional contract: a transaction
//! works on a snapshot of the shared state, `commit` publishes the snapshot,
//! and dropping the handle discards it. That makes atomicity observable in
//! unit tests without a running PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::common::{ApplicationId, CapabilityId, UserId};
use crate::domains::capability::models::Capability;
use crate::domains::membership::events::EventSource;
use crate::domains::membership::models::{Membership, MembershipApplication};
use crate::kernel::clock::Clock;
use crate::kernel::outbox::{OutboxEntry, OutboxStore};
use crate::kernel::persistence::{Database, StoreError, StoreTx};

/// Clock pinned to a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Default, Clone)]
struct SharedState {
    capabilities: HashMap<CapabilityId, Capability>,
    memberships: Vec<Membership>,
    applications: BTreeMap<ApplicationId, MembershipApplication>,
    outbox: Vec<OutboxEntry>,
}

/// In-memory stand-in for the PostgreSQL database.
#[derive(Default, Clone)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<SharedState>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Seeding helpers
    // ------------------------------------------------------------------

    pub fn seed_capability(&self, name: &str) -> CapabilityId {
        let capability = Capability::new(name, Utc::now());
        let id = capability.id;
        self.lock().capabilities.insert(id, capability);
        id
    }

    /// Adds an active member directly, bypassing the application flow.
    pub fn seed_member(&self, capability_id: CapabilityId, user: &str) {
        let mut membership =
            Membership::create_for(capability_id, UserId::new(user), Utc::now());
        // Seeded state is history, not new facts.
        use crate::domains::membership::events::EventSource;
        let _ = membership.drain_events();
        self.lock().memberships.push(membership);
    }

    pub fn push_outbox(&self, entries: Vec<OutboxEntry>) {
        self.lock().outbox.extend(entries);
    }

    // ------------------------------------------------------------------
    // Inspection helpers
    // ------------------------------------------------------------------

    pub fn application(&self, id: ApplicationId) -> Option<MembershipApplication> {
        self.lock().applications.get(&id).cloned()
    }

    pub fn applications_count(&self) -> usize {
        self.lock().applications.len()
    }

    pub fn membership_exists(&self, capability_id: CapabilityId, user: &str) -> bool {
        let user = UserId::new(user);
        self.lock()
            .memberships
            .iter()
            .any(|m| m.capability_id() == capability_id && *m.user_id() == user)
    }

    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.lock().outbox.clone()
    }

    pub fn undispatched_count(&self) -> usize {
        self.lock()
            .outbox
            .iter()
            .filter(|e| e.dispatched_at.is_none())
            .count()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let working = self.lock().clone();
        Ok(InMemoryTx {
            shared: Arc::clone(&self.state),
            working,
        })
    }
}

/// A transaction over a snapshot of the shared state.
pub struct InMemoryTx {
    shared: Arc<Mutex<SharedState>>,
    working: SharedState,
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn capability_exists(&mut self, capability_id: CapabilityId) -> Result<bool, StoreError> {
        Ok(self.working.capabilities.contains_key(&capability_id))
    }

    async fn has_active_membership(
        &mut self,
        capability_id: CapabilityId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .working
            .memberships
            .iter()
            .any(|m| m.capability_id() == capability_id && m.user_id() == user_id))
    }

    async fn active_member_ids(
        &mut self,
        capability_id: CapabilityId,
    ) -> Result<HashSet<UserId>, StoreError> {
        Ok(self
            .working
            .memberships
            .iter()
            .filter(|m| m.capability_id() == capability_id)
            .map(|m| m.user_id().clone())
            .collect())
    }

    async fn insert_membership(&mut self, membership: &Membership) -> Result<(), StoreError> {
        // Persisted rows carry no pending events (the real store reconstructs
        // via `from_parts` with an empty event log); mirror that here.
        let mut stored = membership.clone();
        let _ = stored.drain_events();
        self.working.memberships.push(stored);
        Ok(())
    }

    async fn find_application(
        &mut self,
        id: ApplicationId,
    ) -> Result<Option<MembershipApplication>, StoreError> {
        Ok(self.working.applications.get(&id).cloned())
    }

    async fn pending_applications_for(
        &mut self,
        capability_id: CapabilityId,
        applicant: &UserId,
    ) -> Result<Vec<MembershipApplication>, StoreError> {
        Ok(self
            .working
            .applications
            .values()
            .filter(|a| {
                a.capability_id() == capability_id
                    && a.applicant() == applicant
                    && a.is_pending()
            })
            .cloned()
            .collect())
    }

    async fn expired_pending_applications(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MembershipApplication>, StoreError> {
        Ok(self
            .working
            .applications
            .values()
            .filter(|a| a.has_expired(now))
            .cloned()
            .collect())
    }

    async fn insert_application(
        &mut self,
        application: &MembershipApplication,
    ) -> Result<(), StoreError> {
        // Persisted rows carry no pending events (the real store reconstructs
        // via `from_parts` with an empty event log); mirror that here.
        let mut stored = application.clone();
        let _ = stored.drain_events();
        self.working.applications.insert(stored.id(), stored);
        Ok(())
    }

    async fn update_application(
        &mut self,
        application: &MembershipApplication,
    ) -> Result<(), StoreError> {
        let mut stored = application.clone();
        let _ = stored.drain_events();
        self.working.applications.insert(stored.id(), stored);
        Ok(())
    }

    async fn delete_application(&mut self, id: ApplicationId) -> Result<(), StoreError> {
        self.working.applications.remove(&id);
        Ok(())
    }

    async fn stage_outbox(&mut self, entries: &[OutboxEntry]) -> Result<(), StoreError> {
        self.working.outbox.extend(entries.iter().cloned());
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        *shared = self.working;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryDatabase {
    async fn fetch_undispatched(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut entries: Vec<OutboxEntry> = self
            .lock()
            .outbox
            .iter()
            .filter(|e| e.dispatched_at.is_none())
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(entry) = state.outbox.iter_mut().find(|e| e.id == id) {
            entry.dispatched_at = Some(Utc::now());
        }
        Ok(())
    }
}
