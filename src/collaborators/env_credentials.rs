//! Single-account credentials from the environment.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CredentialStore, Credentials, StoreError};

pub const API_KEY_VAR: &str = "BINANCE_API_KEY";
pub const API_SECRET_VAR: &str = "BINANCE_API_SECRET";

/// Serves `BINANCE_API_KEY` / `BINANCE_API_SECRET` for one user id.
///
/// Missing or empty variables mean "not configured", not an error.
pub struct EnvCredentialStore {
    user_id: String,
    current: RwLock<Option<Credentials>>,
}

impl EnvCredentialStore {
    pub fn from_env(user_id: impl Into<String>) -> Self {
        Self::with_credentials(user_id, Self::read_env())
    }

    pub fn with_credentials(user_id: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            user_id: user_id.into(),
            current: RwLock::new(credentials),
        }
    }

    fn read_env() -> Option<Credentials> {
        let key = std::env::var(API_KEY_VAR).ok().filter(|v| !v.trim().is_empty())?;
        let secret = std::env::var(API_SECRET_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        Some(Credentials::new(key.trim(), secret.trim()))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn credentials(&self, user_id: &str) -> Result<Option<Credentials>, StoreError> {
        if user_id != self.user_id {
            return Ok(None);
        }
        Ok(self.current.read().await.clone())
    }

    async fn store_credentials(
        &self,
        user_id: &str,
        credentials: Credentials,
    ) -> Result<(), StoreError> {
        if user_id != self.user_id {
            return Err(StoreError::Unavailable(format!(
                "environment store only serves user '{}'",
                self.user_id
            )));
        }
        *self.current.write().await = Some(credentials);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_user_scope() {
        let store = EnvCredentialStore::with_credentials("default", Some(Credentials::new("k", "s")));
        assert!(store.credentials("default").await.unwrap().is_some());
        assert!(store.credentials("other").await.unwrap().is_none());
        assert!(store
            .store_credentials("other", Credentials::new("a", "b"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_absent_credentials_are_not_an_error() {
        let store = EnvCredentialStore::with_credentials("default", None);
        assert_eq!(store.credentials("default").await.unwrap(), None);
    }
}
