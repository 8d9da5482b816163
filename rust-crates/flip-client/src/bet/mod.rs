//! Lifecycle of a single flip bet, driven by an external scheduler.
//!
//! `Building -> Submitted -> Won | Lost | Failed`. Each [`BetController::poll`]
//! is one step; the controller never loops or sleeps on its own.

use crate::{
    address::Address,
    balance::{
        Clock,
        SystemClock,
    },
    coins::Coins,
    reconciler::{
        BetRecord,
        BetStatus,
        FlipOperation,
        Resolution,
        reconcile_one,
    },
    rpc::{
        LedgerApi,
        RpcError,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};
use tracing::{
    info,
    warn,
};


pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TRANSACTIONS_PAGE: u32 = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentTransaction {
    pub id: String,
}

/// Signs and broadcasts a message carrying `value_nanos` to the flip contract.
pub trait TransactionSender: Send + Sync {
    fn send(
        &self,
        value_nanos: u64,
        body_boc_base64: String,
    ) -> impl Future<Output = anyhow::Result<SentTransaction>> + Send;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BetLimits {
    pub min: Coins,
    pub max: Coins,
}

impl BetLimits {
    pub fn check(&self, amount: Coins) -> Result<(), String> {
        if amount.is_zero() {
            return Err("bet amount must be positive".to_string());
        }
        if amount < self.min {
            return Err(format!("bet {amount} is below the minimum {}", self.min));
        }
        if amount > self.max {
            return Err(format!("bet {amount} is above the maximum {}", self.max));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBet {
    pub transaction_hash: String,
    pub amount: Coins,
    pub side: bool,
    pub submitted_at_ms: i64,
    /// Highest contract logical time seen before sending. Only later records settle this bet.
    pub baseline_lt: u64,
}

impl PendingBet {
    fn matches(&self, record: &BetRecord) -> bool {
        record.id > self.baseline_lt && record.amount == self.amount && record.side == self.side
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BetState {
    Building,
    Submitted(PendingBet),
    Won(BetRecord),
    Lost(BetRecord),
    Failed { reason: String },
}

impl BetState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BetState::Won(_) | BetState::Lost(_) | BetState::Failed { .. }
        )
    }

    fn label(&self) -> &'static str {
        match self {
            BetState::Building => "building",
            BetState::Submitted(_) => "submitted",
            BetState::Won(_) => "won",
            BetState::Lost(_) => "lost",
            BetState::Failed { .. } => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BetSettings {
    pub contract: Address,
    pub bettor: Address,
    pub transactions_page: u32,
    pub settle_timeout: Duration,
}

impl BetSettings {
    pub fn new(contract: Address, bettor: Address) -> Self {
        Self {
            contract,
            bettor,
            transactions_page: DEFAULT_TRANSACTIONS_PAGE,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }
}

pub struct BetController<L, C = SystemClock> {
    ledger: Arc<L>,
    clock: C,
    settings: BetSettings,
    state: BetState,
}

impl<L: LedgerApi> BetController<L> {
    pub fn with_system_clock(ledger: Arc<L>, settings: BetSettings) -> Self {
        Self::new(ledger, settings, SystemClock)
    }
}

impl<L, C> BetController<L, C>
where
    L: LedgerApi,
    C: Clock,
{
    pub fn new(ledger: Arc<L>, settings: BetSettings, clock: C) -> Self {
        Self {
            ledger,
            clock,
            settings,
            state: BetState::Building,
        }
    }

    pub fn state(&self) -> &BetState {
        &self.state
    }

    pub async fn submit<S: TransactionSender>(
        &mut self,
        sender: &S,
        side: bool,
        amount: Coins,
        limits: BetLimits,
    ) -> &BetState {
        if self.state != BetState::Building {
            warn!(state = self.state.label(), "bet already submitted, ignoring submit");
            return &self.state;
        }
        if let Err(reason) = limits.check(amount) {
            return self.fail(reason);
        }
        let body = match FlipOperation::new(side).body() {
            Ok(body) => body,
            Err(e) => return self.fail(format!("failed to build flip body: {e}")),
        };
        let baseline_lt = match self.latest_logical_time().await {
            Ok(lt) => lt,
            Err(e) => return self.fail(format!("failed to read contract history: {e}")),
        };
        match sender.send(amount.nanos(), body.to_boc_base64()).await {
            Ok(sent) => {
                let pending = PendingBet {
                    transaction_hash: sent.id,
                    amount,
                    side,
                    submitted_at_ms: self.clock.now_ms(),
                    baseline_lt,
                };
                self.transition(BetState::Submitted(pending))
            }
            Err(e) => self.fail(format!("failed to send bet: {e:#}")),
        }
    }

    /// One reconciliation step. A no-op outside `Submitted`.
    pub async fn poll(&mut self) -> &BetState {
        let BetState::Submitted(pending) = &self.state else {
            return &self.state;
        };
        let pending = pending.clone();
        if pending.transaction_hash.is_empty() {
            return self.fail("sender returned an empty transaction handle".to_string());
        }

        let transactions = match self
            .ledger
            .transactions(&self.settings.contract, self.settings.transactions_page)
            .await
        {
            Ok(transactions) => transactions,
            Err(e) if e.is_irrecoverable() => {
                return self.fail(format!("failed to fetch transactions: {e}"));
            }
            Err(e) => {
                warn!("transaction fetch failed, will retry on next poll: {e}");
                return self.check_timeout(&pending);
            }
        };

        let settled: Vec<BetRecord> = transactions
            .iter()
            .filter_map(|tx| match reconcile_one(tx, &self.settings.bettor) {
                Resolution::Settled(record) => Some(record),
                Resolution::Unresolved { .. } | Resolution::NotOurs => None,
            })
            .collect();
        let found = settled
            .iter()
            .find(|record| {
                record
                    .tx_hash
                    .eq_ignore_ascii_case(&pending.transaction_hash)
            })
            .or_else(|| settled.iter().find(|record| pending.matches(record)));

        match found {
            Some(record) => {
                let next = match record.status {
                    BetStatus::Win => BetState::Won(record.clone()),
                    BetStatus::Lost => BetState::Lost(record.clone()),
                };
                self.transition(next)
            }
            None => self.check_timeout(&pending),
        }
    }

    /// Gives up on a bet that has not settled. Terminal states are kept.
    pub fn cancel(&mut self) -> &BetState {
        if self.state.is_terminal() {
            return &self.state;
        }
        self.fail("cancelled".to_string())
    }

    async fn latest_logical_time(&self) -> Result<u64, RpcError> {
        let transactions = self
            .ledger
            .transactions(&self.settings.contract, self.settings.transactions_page)
            .await?;
        Ok(transactions
            .iter()
            .map(|tx| tx.logical_time)
            .max()
            .unwrap_or(0))
    }

    fn check_timeout(&mut self, pending: &PendingBet) -> &BetState {
        let waited_ms = self.clock.now_ms().saturating_sub(pending.submitted_at_ms);
        if waited_ms >= self.settings.settle_timeout.as_millis() as i64 {
            return self.fail(format!(
                "bet not settled within {}s",
                self.settings.settle_timeout.as_secs()
            ));
        }
        &self.state
    }

    fn fail(&mut self, reason: String) -> &BetState {
        self.transition(BetState::Failed { reason })
    }

    fn transition(&mut self, next: BetState) -> &BetState {
        match &next {
            BetState::Failed { reason } => {
                info!(from = self.state.label(), %reason, "bet failed")
            }
            other => info!(from = self.state.label(), to = other.label(), "bet state changed"),
        }
        self.state = next;
        &self.state
    }
}
