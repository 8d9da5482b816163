//! Time-windowed balance cache in front of the ledger.
//!
//! [`BalanceCache::get_balance`] never fails: when the ledger cannot be reached
//! it answers with the last known value, or with the configured fallback when
//! nothing was ever fetched for that account.

use crate::{
    address::Address,
    coins::Coins,
    rpc::LedgerApi,
};
use chrono::Utc;
use std::{
    sync::Arc,
    time::Duration,
};
use tracing::{
    debug,
    warn,
};

pub mod store;

#[cfg(test)]
mod tests;

pub use store::{
    BalanceStore,
    CachedBalance,
    InMemoryBalanceStore,
    SledBalanceStore,
    StoreError,
};

pub const DEFAULT_CONTRACT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_WALLET_WINDOW: Duration = Duration::from_secs(5);

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceKind {
    Contract,
    Wallet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheWindows {
    pub contract: Duration,
    pub wallet: Duration,
}

impl Default for CacheWindows {
    fn default() -> Self {
        Self {
            contract: DEFAULT_CONTRACT_WINDOW,
            wallet: DEFAULT_WALLET_WINDOW,
        }
    }
}

impl CacheWindows {
    pub fn for_kind(&self, kind: BalanceKind) -> Duration {
        match kind {
            BalanceKind::Contract => self.contract,
            BalanceKind::Wallet => self.wallet,
        }
    }
}

pub struct BalanceCache<L, S = InMemoryBalanceStore, C = SystemClock> {
    ledger: Arc<L>,
    store: S,
    clock: C,
    windows: CacheWindows,
    fallback: Coins,
}

impl<L: LedgerApi> BalanceCache<L> {
    pub fn in_memory(ledger: Arc<L>) -> Self {
        Self::new(ledger, InMemoryBalanceStore::new(), SystemClock)
    }
}

impl<L, S, C> BalanceCache<L, S, C>
where
    L: LedgerApi,
    S: BalanceStore,
    C: Clock,
{
    pub fn new(ledger: Arc<L>, store: S, clock: C) -> Self {
        Self {
            ledger,
            store,
            clock,
            windows: CacheWindows::default(),
            fallback: Coins::ZERO,
        }
    }

    pub fn with_windows(mut self, windows: CacheWindows) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_fallback(mut self, fallback: Coins) -> Self {
        self.fallback = fallback;
        self
    }

    pub async fn get_balance(&self, address: &str, kind: BalanceKind) -> Coins {
        let address = match Address::parse(address) {
            Ok(address) => address,
            Err(e) => {
                warn!("balance requested for unparsable address, using fallback: {e}");
                return self.fallback;
            }
        };
        let key = address.to_raw();
        let window = self.windows.for_kind(kind);
        let window_ms = window.as_millis() as i64;
        let cached = self.cached(&key);

        let now_ms = self.clock.now_ms();
        if let Some(record) = cached
            .as_ref()
            .filter(|record| now_ms.saturating_sub(record.fetched_at_ms) < window_ms)
        {
            debug!(address = %key, "balance served from cache");
            return record.value;
        }

        match self.ledger.balance(&address).await {
            Ok(value) => {
                let record = CachedBalance {
                    address: key.clone(),
                    value,
                    fetched_at_ms: self.clock.now_ms(),
                    ttl_ms: window_ms as u64,
                };
                if let Err(e) = self.store.put(record) {
                    warn!(address = %key, "failed to store fetched balance: {e}");
                }
                value
            }
            Err(e) => match cached {
                Some(stale) => {
                    warn!(address = %key, "balance fetch failed, serving stale value: {e}");
                    stale.value
                }
                None => {
                    warn!(address = %key, "balance fetch failed, using fallback: {e}");
                    self.fallback
                }
            },
        }
    }

    /// Peeks at the stored record without touching the ledger.
    pub fn cached(&self, address: &str) -> Option<CachedBalance> {
        let key = match Address::parse(address) {
            Ok(address) => address.to_raw(),
            Err(_) => return None,
        };
        self.store
            .get(&key)
            .inspect_err(|e| warn!(address = %key, "balance store read failed: {e}"))
            .ok()
            .flatten()
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.clear()
    }
}
