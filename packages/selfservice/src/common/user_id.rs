//! User identity as issued by the identity provider.
//!
//! Users are identified by their upn-style string identity, not a UUID, so
//! `UserId` is a validated string newtype rather than an `Id<T>` alias.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identity of a platform user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct UserId(String);

/// Error returned when parsing an invalid user id.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid user id: {0:?}")]
pub struct InvalidUserId(String);

impl UserId {
    /// Wraps an already-validated identity string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = InvalidUserId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(InvalidUserId(s.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}
