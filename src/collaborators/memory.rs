//! In-process persistence.

use async_trait::async_trait;
use std::sync::Mutex;

use super::{CredentialStore, Credentials, Persistence, StoreError, UserAccount};
use crate::trade::{PairTrade, TradeStatus};

#[derive(Default)]
struct Inner {
    active: Vec<PairTrade>,
    history: Vec<PairTrade>,
    accounts: Vec<UserAccount>,
}

/// Volatile store for tests and paper sessions.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: Vec<UserAccount>) -> Self {
        let store = Self::default();
        if let Ok(mut inner) = store.inner.lock() {
            inner.accounts = accounts;
        }
        store
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Archived trades, oldest first.
    pub fn history(&self) -> Vec<PairTrade> {
        self.lock().map(|i| i.history.clone()).unwrap_or_default()
    }

    /// Every trade in the active set, across users.
    pub fn active(&self) -> Vec<PairTrade> {
        self.lock().map(|i| i.active.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load_active_trades(&self, user_id: &str) -> Result<Vec<PairTrade>, StoreError> {
        Ok(self
            .lock()?
            .active
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| matches!(t.status, TradeStatus::Active | TradeStatus::Pending))
            .cloned()
            .collect())
    }

    async fn save_trade(&self, trade: &PairTrade) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        match inner.active.iter_mut().find(|t| t.id == trade.id) {
            Some(existing) => *existing = trade.clone(),
            None => inner.active.push(trade.clone()),
        }
        Ok(())
    }

    async fn archive_closed_trade(&self, trade: &PairTrade) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.active.retain(|t| t.id != trade.id);
        inner.history.push(trade.clone());
        Ok(())
    }

    async fn load_user_accounts(&self) -> Result<Vec<UserAccount>, StoreError> {
        Ok(self.lock()?.accounts.clone())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn credentials(&self, user_id: &str) -> Result<Option<Credentials>, StoreError> {
        Ok(self
            .lock()?
            .accounts
            .iter()
            .find(|a| a.user_id == user_id)
            .and_then(|a| a.credentials.clone()))
    }

    async fn store_credentials(
        &self,
        user_id: &str,
        credentials: Credentials,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let accounts: &mut Vec<UserAccount> = &mut inner.accounts;
        match accounts.iter_mut().find(|a| a.user_id == user_id) {
            Some(account) => account.credentials = Some(credentials),
            None => accounts.push(UserAccount {
                user_id: user_id.to_string(),
                credentials: Some(credentials),
            }),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_credentials_rotation() {
        let store = MemoryStore::with_accounts(vec![UserAccount {
            user_id: "alice".into(),
            credentials: None,
        }]);
        assert_eq!(store.credentials("alice").await.unwrap(), None);

        store
            .store_credentials("alice", Credentials::new("k1", "s1"))
            .await
            .unwrap();
        store
            .store_credentials("alice", Credentials::new("k2", "s2"))
            .await
            .unwrap();
        assert_eq!(
            store.credentials("alice").await.unwrap(),
            Some(Credentials::new("k2", "s2"))
        );
        assert_eq!(store.load_user_accounts().await.unwrap().len(), 1);
    }
}
