use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};

pub const NANOS_PER_COIN: u64 = 1_000_000_000;

/// Amount of the native currency, stored in nanocoins.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Coins(u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid coin amount {0:?}")]
pub struct ParseCoinsError(String);

impl Coins {
    pub const ZERO: Coins = Coins(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Coins(nanos)
    }

    pub const fn nanos(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Coins) -> Option<Coins> {
        self.0.checked_add(other.0).map(Coins)
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / NANOS_PER_COIN;
        let frac = self.0 % NANOS_PER_COIN;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:09}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for Coins {
    type Err = ParseCoinsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCoinsError(s.to_string());
        let text = s.trim();
        let (whole, frac) = text.split_once('.').unwrap_or((text, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if frac.len() > 9
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| err())?
        };
        let frac_nanos: u64 = if frac.is_empty() {
            0
        } else {
            format!("{frac:0<9}").parse().map_err(|_| err())?
        };
        whole
            .checked_mul(NANOS_PER_COIN)
            .and_then(|n| n.checked_add(frac_nanos))
            .map(Coins)
            .ok_or_else(err)
    }
}

impl TryFrom<String> for Coins {
    type Error = ParseCoinsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Coins> for String {
    fn from(value: Coins) -> Self {
        value.to_string()
    }
}
