use crate::{
    address::Address,
    balance::Clock,
    coins::Coins,
    rpc::{
        LedgerApi,
        RpcError,
        types::Transaction,
    },
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicI64,
            AtomicUsize,
            Ordering,
        },
    },
};

#[derive(Clone, Default)]
pub struct FakeLedger {
    balances: Arc<Mutex<VecDeque<Result<Coins, RpcError>>>>,
    transactions: Arc<Mutex<Option<Result<Vec<Transaction>, RpcError>>>>,
    balance_calls: Arc<AtomicUsize>,
    transaction_calls: Arc<AtomicUsize>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_balance(&self, balance: Result<Coins, RpcError>) {
        self.balances.lock().unwrap().push_back(balance);
    }

    pub fn set_transactions(&self, transactions: Result<Vec<Transaction>, RpcError>) {
        *self.transactions.lock().unwrap() = Some(transactions);
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn transaction_calls(&self) -> usize {
        self.transaction_calls.load(Ordering::SeqCst)
    }
}

impl LedgerApi for FakeLedger {
    async fn balance(&self, _address: &Address) -> Result<Coins, RpcError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        self.balances
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RpcError::Transient("no scripted balance".to_string())))
    }

    async fn transactions(
        &self,
        _address: &Address,
        _limit: u32,
    ) -> Result<Vec<Transaction>, RpcError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        self.transactions
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn at(now_ms: i64) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(now_ms)),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
