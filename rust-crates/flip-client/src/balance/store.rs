// Key-value persistence for fetched balances.
use crate::coins::Coins;
use serde::{
    Deserialize,
    Serialize,
};
use sled::{
    Config,
    Db,
    Tree,
};
use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        Mutex,
    },
};

const BALANCES_TREE: &str = "balances";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("balance record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("balance store lock poisoned")]
    Poisoned,
}

/// One persisted balance. Unknown fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBalance {
    pub address: String,
    pub value: Coins,
    pub fetched_at_ms: i64,
    #[serde(default)]
    pub ttl_ms: u64,
}

impl CachedBalance {
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.fetched_at_ms) < self.ttl_ms as i64
    }
}

/// Keyed by normalized address. Last write wins.
pub trait BalanceStore: Send + Sync {
    fn get(&self, address: &str) -> Result<Option<CachedBalance>, StoreError>;

    fn put(&self, record: CachedBalance) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryBalanceStore {
    balances: Arc<Mutex<HashMap<String, CachedBalance>>>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balances(&self) -> Arc<Mutex<HashMap<String, CachedBalance>>> {
        self.balances.clone()
    }
}

impl BalanceStore for InMemoryBalanceStore {
    fn get(&self, address: &str) -> Result<Option<CachedBalance>, StoreError> {
        let guard = self.balances.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(address).cloned())
    }

    fn put(&self, record: CachedBalance) -> Result<(), StoreError> {
        let mut guard = self.balances.lock().map_err(|_| StoreError::Poisoned)?;
        guard.insert(record.address.clone(), record);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.balances.lock().map_err(|_| StoreError::Poisoned)?;
        guard.clear();
        Ok(())
    }
}

#[derive(Clone)]
pub struct SledBalanceStore {
    tree: Tree,
}

impl SledBalanceStore {
    pub fn new(db: &Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(BALANCES_TREE)?;
        Ok(Self { tree })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Config::default().path(path).open()?;
        Self::new(&db)
    }
}

impl BalanceStore for SledBalanceStore {
    fn get(&self, address: &str) -> Result<Option<CachedBalance>, StoreError> {
        match self.tree.get(address.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, record: CachedBalance) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&record)?;
        self.tree.insert(record.address.as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.tree.clear()?;
        self.tree.flush()?;
        Ok(())
    }
}
