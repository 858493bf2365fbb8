//! File-backed persistence and credential storage.
//!
//! Layout of the data directory:
//! - `active_trades.json`: every non-archived trade, rewritten atomically
//!   (write temp file, fsync, rename) so a crash leaves either the old or the
//!   new file, never a partial one
//! - `trade_history.jsonl`: one archived trade per line, append-only
//! - `accounts.json`: user ids with optional API credentials

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CredentialStore, Credentials, Persistence, StoreError, UserAccount};
use crate::trade::{PairTrade, TradeStatus};

const ACTIVE_FILE: &str = "active_trades.json";
const HISTORY_FILE: &str = "trade_history.jsonl";
const ACCOUNTS_FILE: &str = "accounts.json";

pub struct JsonFileStore {
    dir: PathBuf,
    /// Serialises read-modify-write cycles on the files
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn read_json<T: serde::de::DeserializeOwned + Default>(
        &self,
        name: &str,
    ) -> Result<T, StoreError> {
        match fs::read_to_string(self.path(name)).await {
            Ok(data) if data.trim().is_empty() => Ok(T::default()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(value)?;
        let target = self.path(name);
        let temp = self.path(&format!("{}.tmp", name));

        let mut file = fs::File::create(&temp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &target).await?;
        Ok(())
    }

    async fn read_active(&self) -> Result<Vec<PairTrade>, StoreError> {
        self.read_json(ACTIVE_FILE).await
    }

    async fn read_accounts(&self) -> Result<Vec<UserAccount>, StoreError> {
        self.read_json(ACCOUNTS_FILE).await
    }

    /// Register a user (without credentials) if unknown.
    pub async fn ensure_account(&self, user_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut accounts = self.read_accounts().await?;
        if accounts.iter().any(|a| a.user_id == user_id) {
            return Ok(());
        }
        accounts.push(UserAccount {
            user_id: user_id.to_string(),
            credentials: None,
        });
        self.write_atomic(ACCOUNTS_FILE, &accounts).await
    }

    /// Every archived trade, oldest first. Unparseable lines are skipped.
    pub async fn load_history(&self) -> Result<Vec<PairTrade>, StoreError> {
        let data = match fs::read_to_string(self.path(HISTORY_FILE)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut trades = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(trade) => trades.push(trade),
                Err(e) => warn!(line = line_no + 1, error = %e, "Skipping corrupt history line"),
            }
        }
        Ok(trades)
    }
}

#[async_trait]
impl Persistence for JsonFileStore {
    async fn load_active_trades(&self, user_id: &str) -> Result<Vec<PairTrade>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read_active()
            .await?
            .into_iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| matches!(t.status, TradeStatus::Active | TradeStatus::Pending))
            .collect())
    }

    async fn save_trade(&self, trade: &PairTrade) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut trades = self.read_active().await?;
        match trades.iter_mut().find(|t| t.id == trade.id) {
            Some(existing) => *existing = trade.clone(),
            None => trades.push(trade.clone()),
        }
        self.write_atomic(ACTIVE_FILE, &trades).await?;
        debug!(trade_id = %trade.id, "Trade saved");
        Ok(())
    }

    async fn archive_closed_trade(&self, trade: &PairTrade) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;

        let mut line = serde_json::to_string(trade)?;
        line.push('\n');
        let mut history = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(HISTORY_FILE))
            .await?;
        history.write_all(line.as_bytes()).await?;
        history.sync_all().await?;

        let mut trades = self.read_active().await?;
        trades.retain(|t| t.id != trade.id);
        self.write_atomic(ACTIVE_FILE, &trades).await?;
        debug!(trade_id = %trade.id, status = %trade.status, "Trade archived");
        Ok(())
    }

    async fn load_user_accounts(&self) -> Result<Vec<UserAccount>, StoreError> {
        let _guard = self.lock.lock().await;
        self.read_accounts().await
    }
}

#[async_trait]
impl CredentialStore for JsonFileStore {
    async fn credentials(&self, user_id: &str) -> Result<Option<Credentials>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read_accounts()
            .await?
            .into_iter()
            .find(|a| a.user_id == user_id)
            .and_then(|a| a.credentials))
    }

    async fn store_credentials(
        &self,
        user_id: &str,
        credentials: Credentials,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut accounts = self.read_accounts().await?;
        match accounts.iter_mut().find(|a| a.user_id == user_id) {
            Some(account) => account.credentials = Some(credentials),
            None => accounts.push(UserAccount {
                user_id: user_id.to_string(),
                credentials: Some(credentials),
            }),
        }
        self.write_atomic(ACCOUNTS_FILE, &accounts).await
    }
}
