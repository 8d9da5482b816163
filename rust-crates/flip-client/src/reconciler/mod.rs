//! Rebuilds flip bets and their outcomes from an account's raw transactions.
//!
//! A transaction counts as a bet when its inbound internal message comes from
//! the bettor and carries a flip body. The outcome is read from the first
//! internal message the same transaction sends back to the bettor. Nothing
//! here fails a batch: transactions that don't fit are skipped.

use crate::{
    address::Address,
    cell::{
        Cell,
        CellBuilder,
        CellError,
    },
    coins::Coins,
    rpc::types::{
        Message,
        Transaction,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use tracing::trace;

pub mod history;


pub use history::BetHistory;

pub const FLIP_OPCODE: u32 = 0x66b9a3fb;
pub const COMMENT_OPCODE: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlipOperation {
    pub opcode: u32,
    pub side: bool,
}

impl FlipOperation {
    pub fn new(side: bool) -> Self {
        Self {
            opcode: FLIP_OPCODE,
            side,
        }
    }

    /// `None` when the body is too short or starts with another opcode.
    pub fn decode(body: &Cell) -> Option<Self> {
        let mut slice = body.parse();
        if slice.remaining_bits() < 33 {
            return None;
        }
        let opcode = slice.load_uint(32).ok()? as u32;
        if opcode != FLIP_OPCODE {
            return None;
        }
        let side = slice.load_bit().ok()?;
        Some(Self { opcode, side })
    }

    pub fn encode(&self, builder: &mut CellBuilder) -> Result<(), CellError> {
        builder
            .store_uint(u64::from(self.opcode), 32)?
            .store_bit(self.side)?;
        Ok(())
    }

    pub fn body(&self) -> Result<Cell, CellError> {
        let mut builder = Cell::builder();
        self.encode(&mut builder)?;
        Ok(builder.build())
    }
}

/// Text comment carried by a message body: either `0x00000000` followed by a
/// string tail, or a bare optional string tail.
pub fn decode_comment(body: &Cell) -> Option<String> {
    let mut slice = body.parse();
    if slice.remaining_bits() >= 32
        && slice.preload_uint(32).ok()? == u64::from(COMMENT_OPCODE)
    {
        slice.skip_bits(32).ok()?;
        return slice.load_string_tail().ok();
    }
    let mut slice = body.parse();
    slice.load_maybe_string_tail().ok().flatten()
}

pub fn comment_body(text: &str) -> Result<Cell, CellError> {
    let mut builder = Cell::builder();
    builder
        .store_uint(u64::from(COMMENT_OPCODE), 32)?
        .store_string_tail(text)?;
    Ok(builder.build())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetStatus {
    Win,
    Lost,
}

/// Outcome of a payout message. The comment decides when it names the
/// outcome; otherwise any positive value counts as a win.
pub fn classify_outcome(comment: Option<&str>, value: Coins) -> BetStatus {
    if let Some(comment) = comment {
        let lower = comment.to_lowercase();
        if lower.contains("win") {
            return BetStatus::Win;
        }
        if lower.contains("lost") {
            return BetStatus::Lost;
        }
    }
    if value.is_zero() {
        BetStatus::Lost
    } else {
        BetStatus::Win
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetRecord {
    /// Logical time of the settling transaction.
    pub id: u64,
    pub timestamp_ms: i64,
    pub amount: Coins,
    pub side: bool,
    pub status: BetStatus,
    pub win_amount: Option<Coins>,
    pub tx_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Settled(BetRecord),
    /// A flip from the bettor with no payout message yet.
    Unresolved {
        tx_hash: String,
        amount: Coins,
        side: bool,
    },
    NotOurs,
}

fn is_bettor(address: Option<&Address>, bettor: &Address) -> bool {
    address.is_some_and(|address| address == bettor)
}

fn payout_to<'a>(transaction: &'a Transaction, bettor: &Address) -> Option<&'a Message> {
    transaction.out_messages.iter().find(|message| {
        message.is_internal() && is_bettor(message.info.dest.as_ref(), bettor)
    })
}

pub fn reconcile_one(transaction: &Transaction, bettor: &Address) -> Resolution {
    let Some(inbound) = transaction.in_message.as_ref().filter(|m| m.is_internal()) else {
        return Resolution::NotOurs;
    };
    if !is_bettor(inbound.info.src.as_ref(), bettor) {
        return Resolution::NotOurs;
    }
    let Some(flip) = FlipOperation::decode(&inbound.body) else {
        return Resolution::NotOurs;
    };
    let tx_hash = transaction.hash_hex();
    let amount = inbound.info.value;

    let Some(payout) = payout_to(transaction, bettor) else {
        trace!(%tx_hash, "flip without payout message yet");
        return Resolution::Unresolved {
            tx_hash,
            amount,
            side: flip.side,
        };
    };
    let comment = decode_comment(&payout.body);
    let status = classify_outcome(comment.as_deref(), payout.info.value);
    let win_amount = match status {
        BetStatus::Win => payout.info.value,
        BetStatus::Lost => Coins::ZERO,
    };
    Resolution::Settled(BetRecord {
        id: transaction.logical_time,
        timestamp_ms: i64::from(transaction.timestamp_sec) * 1000,
        amount,
        side: flip.side,
        status,
        win_amount: Some(win_amount),
        tx_hash,
    })
}

/// Settled bets in feed order.
pub fn reconcile(bettor: &Address, transactions: &[Transaction]) -> Vec<BetRecord> {
    transactions
        .iter()
        .filter_map(|transaction| match reconcile_one(transaction, bettor) {
            Resolution::Settled(record) => Some(record),
            Resolution::Unresolved { .. } | Resolution::NotOurs => None,
        })
        .collect()
}
