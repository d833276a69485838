//! Token budget ledger: per-user usage counters and limits.

use std::sync::Arc;

use tracing::debug;

use crate::agent::settings::ConfigHandle;
use crate::error::DatabaseError;
use crate::store::{Database, UserRecord, UserTarget};

/// Tracks cumulative token usage per user against their limit.
///
/// Emails are normalized to lowercase so one mailbox maps to one row.
#[derive(Clone)]
pub struct TokenLedger {
    store: Arc<dyn Database>,
    config: ConfigHandle,
}

impl TokenLedger {
    pub fn new(store: Arc<dyn Database>, config: ConfigHandle) -> Self {
        Self { store, config }
    }

    /// True for unknown users, or while usage is below the limit.
    pub async fn within_limit(&self, email: &str) -> Result<bool, DatabaseError> {
        let within = match self.store.get_user(&normalize(email)).await? {
            Some(user) => user.tokens_used < user.tokens_limit,
            None => true,
        };
        Ok(within)
    }

    /// Count one chat request and its token usage.
    ///
    /// A user seen for the first time gets the current default limit.
    pub async fn record(&self, email: &str, name: &str, tokens: u64) -> Result<(), DatabaseError> {
        let default_limit = self.config.snapshot().await.default_tokens_limit;
        let email = normalize(email);
        self.store
            .record_chat_usage(&email, name, tokens, default_limit)
            .await?;
        debug!(user = %email, tokens, "Recorded chat usage");
        Ok(())
    }

    /// Look up one user.
    pub async fn user(&self, email: &str) -> Result<Option<UserRecord>, DatabaseError> {
        self.store.get_user(&normalize(email)).await
    }

    /// Set the token limit for one user or, with the wildcard, every
    /// existing user. Returns the number of rows changed.
    pub async fn set_limit(&self, target: &UserTarget, limit: u64) -> Result<u64, DatabaseError> {
        let target = match target {
            UserTarget::One(email) => UserTarget::One(normalize(email)),
            UserTarget::All => UserTarget::All,
        };
        self.store.set_tokens_limit(&target, limit).await
    }

    /// Every user record, ordered by email.
    pub async fn users(&self) -> Result<Vec<UserRecord>, DatabaseError> {
        self.store.list_users().await
    }
}

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}
