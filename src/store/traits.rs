//! `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;

/// Per-user usage and quota row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub email: String,
    pub name: String,
    pub chat_requests: u64,
    pub tokens_used: u64,
    pub tokens_limit: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which user rows a quota change applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserTarget {
    /// A single user by email.
    One(String),
    /// Every user row that currently exists.
    All,
}

impl UserTarget {
    /// The literal that selects every user in a command payload.
    pub const WILDCARD: &'static str = "*";

    /// Interpret a `user` field value.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == Self::WILDCARD {
            Self::All
        } else {
            Self::One(raw.to_string())
        }
    }
}

impl std::fmt::Display for UserTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::One(email) => f.write_str(email),
            Self::All => f.write_str(Self::WILDCARD),
        }
    }
}

/// Backend-agnostic database trait covering the config snapshot and users.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Config snapshot ─────────────────────────────────────────────

    /// Load the serialized config snapshot, if one was ever saved.
    async fn load_config_snapshot(&self) -> Result<Option<String>, DatabaseError>;

    /// Replace the serialized config snapshot.
    async fn save_config_snapshot(&self, snapshot: &str) -> Result<(), DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Look up a user by email.
    async fn get_user(&self, email: &str) -> Result<Option<UserRecord>, DatabaseError>;

    /// All users, ordered by email.
    async fn list_users(&self) -> Result<Vec<UserRecord>, DatabaseError>;

    /// Count one chat request and add `tokens_used` for a user, creating
    /// the row with `default_limit` if it does not exist yet.
    ///
    /// Implementations must do this as one atomic statement.
    async fn record_chat_usage(
        &self,
        email: &str,
        name: &str,
        tokens_used: u64,
        default_limit: u64,
    ) -> Result<(), DatabaseError>;

    /// Set the token limit for the targeted rows. Returns the number of
    /// rows changed.
    async fn set_tokens_limit(&self, target: &UserTarget, limit: u64)
    -> Result<u64, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_target_wildcard() {
        assert_eq!(UserTarget::parse("*"), UserTarget::All);
        assert_eq!(UserTarget::parse(" * "), UserTarget::All);
    }

    #[test]
    fn user_target_single() {
        assert_eq!(
            UserTarget::parse("alice@example.com"),
            UserTarget::One("alice@example.com".into())
        );
        assert_eq!(UserTarget::All.to_string(), "*");
    }
}
