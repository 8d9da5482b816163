use super::BetRecord;
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Capped window of settled bets, newest first. A record is stored once per
/// transaction hash; when full, the oldest records are evicted.
#[derive(Clone, Debug)]
pub struct BetHistory {
    limit: usize,
    records: VecDeque<BetRecord>,
}

impl Default for BetHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl BetHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            records: VecDeque::with_capacity(limit),
        }
    }

    /// Returns how many records were new.
    pub fn extend(&mut self, records: impl IntoIterator<Item = BetRecord>) -> usize {
        let mut added = 0;
        for record in records {
            if self.contains(&record.tx_hash) {
                continue;
            }
            self.records.push_back(record);
            added += 1;
        }
        if added > 0 {
            self.records
                .make_contiguous()
                .sort_by(|a, b| (b.timestamp_ms, b.id).cmp(&(a.timestamp_ms, a.id)));
            self.records.truncate(self.limit);
        }
        added
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.records.iter().any(|record| record.tx_hash == tx_hash)
    }

    pub fn latest(&self) -> Option<&BetRecord> {
        self.records.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BetRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
