use base64::{
    Engine as _,
    engine::general_purpose::{
        STANDARD,
        URL_SAFE,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};

const FRIENDLY_LEN: usize = 48;
const FRIENDLY_BYTES: usize = 36;
const TAG_BOUNCEABLE: u8 = 0x11;
const TAG_NON_BOUNCEABLE: u8 = 0x51;
const TAG_TESTNET: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },
}

/// Canonical account identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub workchain: i8,
    pub hash: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStyle {
    /// `workchain:hex`
    Raw,
    Friendly {
        bounceable: bool,
        testnet: bool,
        url_safe: bool,
    },
}

impl AddressStyle {
    pub const MAINNET_BOUNCEABLE: Self = AddressStyle::Friendly {
        bounceable: true,
        testnet: false,
        url_safe: true,
    };
}

/// A user-friendly address together with the flags it was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendlyAddress {
    pub address: Address,
    pub bounceable: bool,
    pub testnet: bool,
}

type ParseStrategy = fn(&str) -> Result<Address, String>;

// Tried in order; the first success wins.
const PARSE_STRATEGIES: [(&str, ParseStrategy); 3] = [
    ("raw", parse_raw),
    ("friendly/base64url", parse_friendly_url_safe),
    ("friendly/base64", parse_friendly_standard),
];

impl Address {
    pub fn new(workchain: i8, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let trimmed = text.trim();
        let mut reasons = Vec::with_capacity(PARSE_STRATEGIES.len());
        for (name, strategy) in PARSE_STRATEGIES {
            match strategy(trimmed) {
                Ok(address) => return Ok(address),
                Err(reason) => reasons.push(format!("{name}: {reason}")),
            }
        }
        Err(AddressError::InvalidAddress {
            input: text.to_string(),
            reason: reasons.join("; "),
        })
    }

    pub fn format(&self, style: AddressStyle) -> String {
        match style {
            AddressStyle::Raw => format!("{}:{}", self.workchain, hex::encode(self.hash)),
            AddressStyle::Friendly {
                bounceable,
                testnet,
                url_safe,
            } => {
                let mut tag = if bounceable {
                    TAG_BOUNCEABLE
                } else {
                    TAG_NON_BOUNCEABLE
                };
                if testnet {
                    tag |= TAG_TESTNET;
                }
                let mut bytes = Vec::with_capacity(FRIENDLY_BYTES);
                bytes.push(tag);
                bytes.push(self.workchain as u8);
                bytes.extend_from_slice(&self.hash);
                bytes.extend_from_slice(&crc16(&bytes).to_be_bytes());
                if url_safe {
                    URL_SAFE.encode(bytes)
                } else {
                    STANDARD.encode(bytes)
                }
            }
        }
    }

    /// `workchain:hex`, lowercase.
    pub fn to_raw(&self) -> String {
        self.format(AddressStyle::Raw)
    }
}

impl FriendlyAddress {
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let trimmed = text.trim();
        parse_friendly(trimmed, true)
            .or_else(|_| parse_friendly(trimmed, false))
            .map_err(|reason| AddressError::InvalidAddress {
                input: text.to_string(),
                reason,
            })
    }
}

/// Canonical text used for equality checks and cache keys.
pub fn normalize(text: &str) -> Result<String, AddressError> {
    Address::parse(text).map(|address| address.to_raw())
}

fn parse_raw(text: &str) -> Result<Address, String> {
    let (workchain, hash_hex) = text
        .split_once(':')
        .ok_or_else(|| "missing ':' separator".to_string())?;
    let digits = workchain.strip_prefix('-').unwrap_or(workchain);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("bad workchain {workchain:?}"));
    }
    let workchain: i8 = workchain
        .parse()
        .map_err(|_| format!("bad workchain {workchain:?}"))?;
    if hash_hex.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hash_hex.len()));
    }
    let mut hash = [0u8; 32];
    hex::decode_to_slice(hash_hex, &mut hash).map_err(|e| e.to_string())?;
    Ok(Address::new(workchain, hash))
}

fn parse_friendly_url_safe(text: &str) -> Result<Address, String> {
    parse_friendly(text, true).map(|friendly| friendly.address)
}

fn parse_friendly_standard(text: &str) -> Result<Address, String> {
    parse_friendly(text, false).map(|friendly| friendly.address)
}

fn parse_friendly(text: &str, url_safe: bool) -> Result<FriendlyAddress, String> {
    if text.len() != FRIENDLY_LEN {
        return Err(format!("expected {FRIENDLY_LEN} chars, got {}", text.len()));
    }
    let bytes = if url_safe {
        URL_SAFE.decode(text)
    } else {
        STANDARD.decode(text)
    }
    .map_err(|e| e.to_string())?;
    if bytes.len() != FRIENDLY_BYTES {
        return Err(format!("decoded to {} bytes", bytes.len()));
    }
    let expected = crc16(&bytes[..34]);
    let stored = u16::from_be_bytes([bytes[34], bytes[35]]);
    if expected != stored {
        return Err(format!("checksum {stored:04x} != {expected:04x}"));
    }
    let tag = bytes[0];
    let testnet = tag & TAG_TESTNET != 0;
    let bounceable = match tag & !TAG_TESTNET {
        TAG_BOUNCEABLE => true,
        TAG_NON_BOUNCEABLE => false,
        other => return Err(format!("unknown flags byte {other:#04x}")),
    };
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[2..34]);
    Ok(FriendlyAddress {
        address: Address::new(bytes[1] as i8, hash),
        bounceable,
        testnet,
    })
}

/// CRC-16/XMODEM.
fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = 0u16;
    for byte in bytes {
        crc ^= u16::from(*byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_raw())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_raw())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_raw()
    }
}
