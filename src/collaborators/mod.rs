//! External collaborators consumed by the engine.
//!
//! The engine only talks to persistence, notifications and credential
//! storage through these traits. Bundled implementations:
//! - [`JsonFileStore`]: persistence + credentials in a data directory
//! - [`MemoryStore`]: in-process persistence for tests and paper runs
//! - [`EnvCredentialStore`]: a single account from environment variables
//! - [`TracingNotifier`]: notifications as structured log events

mod env_credentials;
mod json_store;
mod memory;
mod notifier;

pub use env_credentials::EnvCredentialStore;
pub use json_store::JsonFileStore;
pub use memory::MemoryStore;
pub use notifier::TracingNotifier;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;

use crate::trade::{PairTrade, TradeId, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Exchange API key pair.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Stable hash used to detect rotation without keeping a second copy of the secret.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let visible: String = self.api_key.chars().take(4).collect();
        f.debug_struct("Credentials")
            .field("api_key", &format!("{}***", visible))
            .field("api_secret", &"***")
            .finish()
    }
}

/// A user known to the engine. `credentials = None` means "not configured".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Active (and pending) trades of one user
    async fn load_active_trades(&self, user_id: &str) -> Result<Vec<PairTrade>, StoreError>;

    /// Insert or replace a trade in the active working set
    async fn save_trade(&self, trade: &PairTrade) -> Result<(), StoreError>;

    /// Append a closed or failed trade to history and drop it from the active set
    async fn archive_closed_trade(&self, trade: &PairTrade) -> Result<(), StoreError>;

    async fn load_user_accounts(&self) -> Result<Vec<UserAccount>, StoreError>;

    async fn load_trade(
        &self,
        user_id: &str,
        trade_id: &TradeId,
    ) -> Result<Option<PairTrade>, StoreError> {
        Ok(self
            .load_active_trades(user_id)
            .await?
            .into_iter()
            .find(|t| &t.id == trade_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Best-effort user notifications. Failures never affect trade state.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        severity: Severity,
    ) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when the user has not configured credentials.
    async fn credentials(&self, user_id: &str) -> Result<Option<Credentials>, StoreError>;

    async fn store_credentials(
        &self,
        user_id: &str,
        credentials: Credentials,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_masks_secret() {
        let creds = Credentials::new("abcdefgh", "topsecret");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("abcd***"));
        assert!(!debug.contains("topsecret"));
        assert!(!debug.contains("efgh"));
    }

    #[test]
    fn test_fingerprint_changes_on_rotation() {
        let a = Credentials::new("key", "secret");
        let b = Credentials::new("key", "secret2");
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
