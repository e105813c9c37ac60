//! Capability model - the slice of the capability domain this crate sees.

use chrono::{DateTime, Utc};

use crate::common::CapabilityId;

#[derive(Debug, Clone)]
pub struct Capability {
    pub id: CapabilityId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Capability {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: CapabilityId::new(),
            name: name.into(),
            created_at: now,
        }
    }
}
