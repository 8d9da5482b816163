use crate::{
    address::Address,
    cell::Cell,
    coins::Coins,
};
use base64::{
    Engine as _,
    engine::general_purpose::STANDARD,
};
use serde::{
    Deserialize,
    Deserializer,
};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Internal,
    External,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageInfo {
    pub kind: MessageKind,
    pub src: Option<Address>,
    pub dest: Option<Address>,
    pub value: Coins,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub info: MessageInfo,
    pub body: Cell,
}

impl Message {
    pub fn is_internal(&self) -> bool {
        self.info.kind == MessageKind::Internal
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub hash: [u8; 32],
    pub logical_time: u64,
    pub timestamp_sec: u32,
    pub in_message: Option<Message>,
    pub out_messages: Vec<Message>,
}

impl Transaction {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressInformation {
    pub balance: Coins,
    pub state: String,
    pub last_transaction_lt: Option<u64>,
    pub last_transaction_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEntry(pub String);

impl fmt::Display for InvalidEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Indexer numbers arrive as either JSON strings or numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

fn de_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(text) if text.is_empty() => Ok(0),
        NumberOrString::Text(text) => text.parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    de_u64(deserializer).map(Some)
}

#[derive(Deserialize)]
pub(crate) struct AddressInformationDto {
    #[serde(deserialize_with = "de_u64")]
    balance: u64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    last_transaction_id: Option<TransactionIdDto>,
}

#[derive(Deserialize)]
pub(crate) struct TransactionDto {
    utime: u32,
    #[serde(default)]
    data: Option<String>,
    transaction_id: TransactionIdDto,
    #[serde(default)]
    in_msg: Option<MessageDto>,
    #[serde(default)]
    out_msgs: Vec<MessageDto>,
}

#[derive(Deserialize)]
struct TransactionIdDto {
    #[serde(default, deserialize_with = "de_opt_u64")]
    lt: Option<u64>,
    #[serde(default)]
    hash: Option<String>,
}

#[derive(Deserialize)]
struct MessageDto {
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
    #[serde(default, deserialize_with = "de_u64")]
    value: u64,
    #[serde(default)]
    msg_data: Option<MessageDataDto>,
}

#[derive(Deserialize)]
#[serde(tag = "@type")]
enum MessageDataDto {
    #[serde(rename = "msg.dataRaw")]
    Raw {
        #[serde(default)]
        body: String,
    },
    #[serde(rename = "msg.dataText")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Unsupported,
}

impl From<AddressInformationDto> for AddressInformation {
    fn from(dto: AddressInformationDto) -> Self {
        let (last_transaction_lt, last_transaction_hash) = dto
            .last_transaction_id
            .map(|id| (id.lt, id.hash))
            .unwrap_or((None, None));
        AddressInformation {
            balance: Coins::from_nanos(dto.balance),
            state: dto.state,
            last_transaction_lt,
            last_transaction_hash,
        }
    }
}

impl TryFrom<TransactionDto> for Transaction {
    type Error = InvalidEntry;

    fn try_from(dto: TransactionDto) -> Result<Self, Self::Error> {
        let logical_time = dto
            .transaction_id
            .lt
            .ok_or_else(|| InvalidEntry("transaction without logical time".to_string()))?;
        let hash = transaction_hash(dto.data.as_deref(), dto.transaction_id.hash.as_deref())?;
        Ok(Transaction {
            hash,
            logical_time,
            timestamp_sec: dto.utime,
            in_message: dto.in_msg.map(Into::into),
            out_messages: dto.out_msgs.into_iter().map(Into::into).collect(),
        })
    }
}

/// Prefer the root hash of the raw transaction cell; fall back to the indexer's id.
fn transaction_hash(data: Option<&str>, id_hash: Option<&str>) -> Result<[u8; 32], InvalidEntry> {
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        match Cell::from_boc_base64(data) {
            Ok(cell) => return Ok(cell.hash()),
            Err(e) => tracing::debug!("transaction data not decodable, using id hash: {e}"),
        }
    }
    let id_hash = id_hash.ok_or_else(|| InvalidEntry("transaction without hash".to_string()))?;
    let bytes = STANDARD
        .decode(id_hash)
        .map_err(|e| InvalidEntry(format!("bad transaction hash {id_hash:?}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| InvalidEntry(format!("transaction hash {id_hash:?} is not 32 bytes")))
}

fn parse_optional_address(text: &str) -> Option<Address> {
    if text.is_empty() {
        return None;
    }
    Address::parse(text)
        .inspect_err(|e| tracing::debug!("ignoring unparsable message address: {e}"))
        .ok()
}

fn comment_cell(text: &str) -> Option<Cell> {
    let mut builder = Cell::builder();
    builder.store_uint(0, 32).ok()?;
    builder.store_string_tail(text).ok()?;
    Some(builder.build())
}

fn message_body(data: Option<MessageDataDto>) -> Cell {
    let decoded = match data {
        Some(MessageDataDto::Raw { body }) if !body.is_empty() => {
            Cell::from_boc_base64(&body)
                .inspect_err(|e| tracing::debug!("undecodable message body: {e}"))
                .ok()
        }
        Some(MessageDataDto::Text { text }) if !text.is_empty() => STANDARD
            .decode(&text)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|text| comment_cell(&text)),
        _ => None,
    };
    decoded.unwrap_or_else(Cell::empty)
}

impl From<MessageDto> for Message {
    fn from(dto: MessageDto) -> Self {
        let src = parse_optional_address(&dto.source);
        let dest = parse_optional_address(&dto.destination);
        let kind = if dto.source.is_empty() || dto.destination.is_empty() {
            MessageKind::External
        } else {
            MessageKind::Internal
        };
        Message {
            info: MessageInfo {
                kind,
                src,
                dest,
                value: Coins::from_nanos(dto.value),
            },
            body: message_body(dto.msg_data),
        }
    }
}
