//! JSON-RPC client for the ledger indexer.
//!
//! Every request goes through [`RpcClient::call`], which retries transport
//! failures, HTTP 429 and HTTP 503 with exponential backoff plus jitter and
//! honours `Retry-After`. Anything else the server says "no" to comes back as
//! [`RpcError::Rejected`] on the first attempt.

use crate::{
    address::{
        self,
        Address,
    },
    coins::Coins,
};
use rand::Rng;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    Value,
    json,
};
use std::{
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{
    debug,
    warn,
};

pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use transport::{
    HttpReply,
    HttpTransport,
    MAX_RETRY_AFTER,
    Transport,
    TransportError,
};
use types::{
    AddressInformation,
    AddressInformationDto,
    Transaction,
    TransactionDto,
};

pub const METHOD_ADDRESS_INFORMATION: &str = "getAddressInformation";
pub const METHOD_ADDRESS_BALANCE: &str = "getAddressBalance";
pub const METHOD_TRANSACTIONS: &str = "getTransactions";

const MIN_BASE_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Retryable; only escapes the client wrapped in `Exhausted`.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rejected by server (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("unexpected {method} result: {reason}")]
    InvalidResult { method: String, reason: String },
    #[error(transparent)]
    Address(#[from] address::AddressError),
}

impl RpcError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, RpcError::Rejected { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RpcError::Exhausted { .. })
    }

    /// Errors that end a pending bet instead of waiting for the next poll.
    pub fn is_irrecoverable(&self) -> bool {
        matches!(
            self,
            RpcError::Exhausted { .. } | RpcError::Rejected { .. } | RpcError::Address(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            max_jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Applies the floors: base delay at least 100ms, max delay at least the base.
    pub fn normalized(mut self) -> Self {
        self.base_delay_ms = self.base_delay_ms.max(MIN_BASE_DELAY_MS);
        self.max_delay_ms = self.max_delay_ms.max(self.base_delay_ms);
        self
    }

    /// `min(max_delay, base_delay * 2^attempt)`, attempt being 0-indexed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn wait_before_retry(
        &self,
        attempt: u32,
        jitter: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let exponential = self.backoff(attempt).saturating_add(jitter);
        match retry_after {
            Some(server_wait) => exponential.max(server_wait.min(MAX_RETRY_AFTER)),
            None => exponential,
        }
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..self.max_jitter_ms))
    }
}

enum AttemptOutcome {
    Success(Value),
    Retry {
        reason: String,
        retry_after: Option<Duration>,
    },
    Fail(RpcError),
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
    #[serde(default)]
    code: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RpcErrorBody {
    Structured {
        #[serde(default)]
        code: Option<i64>,
        #[serde(default)]
        message: String,
    },
    Text(String),
}

impl RpcErrorBody {
    fn into_rejection(self, fallback_code: i64) -> RpcError {
        match self {
            RpcErrorBody::Structured { code, message } => RpcError::Rejected {
                code: code.unwrap_or(fallback_code),
                message,
            },
            RpcErrorBody::Text(message) => RpcError::Rejected {
                code: fallback_code,
                message,
            },
        }
    }
}

fn classify(reply: HttpReply) -> AttemptOutcome {
    if reply.status == 429 || reply.status == 503 {
        return AttemptOutcome::Retry {
            reason: format!("HTTP {}", reply.status),
            retry_after: reply.retry_after,
        };
    }
    let parsed = serde_json::from_slice::<RpcResponse>(&reply.body);
    if !(200..300).contains(&reply.status) {
        let fallback = i64::from(reply.status);
        let rejection = match parsed {
            Ok(RpcResponse {
                error: Some(body), ..
            }) => body.into_rejection(fallback),
            _ => RpcError::Rejected {
                code: fallback,
                message: String::from_utf8_lossy(&reply.body).into_owned(),
            },
        };
        return AttemptOutcome::Fail(rejection);
    }
    match parsed {
        Ok(RpcResponse {
            error: Some(body),
            code,
            ..
        }) => AttemptOutcome::Fail(body.into_rejection(code.unwrap_or(-1))),
        Ok(RpcResponse {
            result: Some(result),
            ..
        }) => AttemptOutcome::Success(result),
        Ok(_) => AttemptOutcome::Retry {
            reason: "response carried neither result nor error".to_string(),
            retry_after: None,
        },
        Err(e) => AttemptOutcome::Retry {
            reason: format!("malformed response body: {e}"),
            retry_after: None,
        },
    }
}

/// Explicitly constructed and shared by reference; there is no global instance.
pub struct RpcClient<T = HttpTransport> {
    transport: T,
    policy: RetryPolicy,
    next_id: AtomicU64,
}

impl<T: Transport> RpcClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy: policy.normalized(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_until(method, params, None).await
    }

    /// Like [`Self::call`], but gives up at the first retry boundary whose wait
    /// would end past `deadline`.
    pub async fn call_with_deadline(
        &self,
        method: &str,
        params: Value,
        deadline: Instant,
    ) -> Result<Value, RpcError> {
        self.call_until(method, params, Some(deadline)).await
    }

    async fn call_until(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Instant>,
    ) -> Result<Value, RpcError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params: &params,
        };
        let body = serde_json::to_vec(&request).map_err(|e| RpcError::InvalidResult {
            method: method.to_string(),
            reason: format!("failed to encode request: {e}"),
        })?;

        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            debug!(method, attempt = attempts, "sending rpc request");
            let (reason, retry_after) = match self.transport.post(body.clone()).await {
                Ok(reply) => match classify(reply) {
                    AttemptOutcome::Success(result) => return Ok(result),
                    AttemptOutcome::Fail(error) => {
                        debug!(method, %error, "rpc request rejected");
                        return Err(error);
                    }
                    AttemptOutcome::Retry {
                        reason,
                        retry_after,
                    } => (reason, retry_after),
                },
                Err(e) => (e.to_string(), None),
            };

            if attempts >= max_attempts {
                warn!(method, attempts, %reason, "rpc retries exhausted");
                return Err(RpcError::Exhausted {
                    attempts,
                    last_error: reason,
                });
            }
            let wait =
                self.policy
                    .wait_before_retry(attempts - 1, self.policy.jitter(), retry_after);
            let past_deadline = deadline.is_some_and(|deadline| {
                Instant::now()
                    .checked_add(wait)
                    .is_none_or(|resume_at| resume_at > deadline)
            });
            if past_deadline {
                warn!(method, attempts, %reason, "rpc deadline reached before next retry");
                return Err(RpcError::Exhausted {
                    attempts,
                    last_error: reason,
                });
            }
            warn!(
                method,
                attempt = attempts,
                wait_ms = wait.as_millis() as u64,
                %reason,
                "transient rpc failure, retrying"
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn call_typed<R>(&self, method: &str, params: Value) -> Result<R, RpcError>
    where
        R: for<'de> Deserialize<'de>,
    {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| RpcError::InvalidResult {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn get_address_information(
        &self,
        address: &str,
    ) -> Result<AddressInformation, RpcError> {
        let address = address::normalize(address)?;
        let dto: AddressInformationDto = self
            .call_typed(METHOD_ADDRESS_INFORMATION, json!({ "address": address }))
            .await?;
        Ok(dto.into())
    }

    pub async fn get_address_balance(&self, address: &str) -> Result<Coins, RpcError> {
        let address = address::normalize(address)?;
        let result = self
            .call(METHOD_ADDRESS_BALANCE, json!({ "address": address }))
            .await?;
        let nanos = match &result {
            Value::String(text) => text.parse::<u64>().ok(),
            Value::Number(number) => number.as_u64(),
            _ => None,
        };
        nanos
            .map(Coins::from_nanos)
            .ok_or_else(|| RpcError::InvalidResult {
                method: METHOD_ADDRESS_BALANCE.to_string(),
                reason: format!("balance {result} is not an unsigned integer"),
            })
    }

    /// Newest first, as the indexer returns them. Entries that fail validation
    /// are dropped rather than failing the page.
    pub async fn get_transactions(
        &self,
        address: &str,
        limit: u32,
        archival: bool,
    ) -> Result<Vec<Transaction>, RpcError> {
        let address = address::normalize(address)?;
        let entries: Vec<Value> = self
            .call_typed(
                METHOD_TRANSACTIONS,
                json!({ "address": address, "limit": limit, "archival": archival }),
            )
            .await?;
        let transactions = entries
            .into_iter()
            .filter_map(|entry| {
                serde_json::from_value::<TransactionDto>(entry)
                    .map_err(|e| e.to_string())
                    .and_then(|dto| Transaction::try_from(dto).map_err(|e| e.to_string()))
                    .inspect_err(|e| warn!(%address, "dropping malformed transaction: {e}"))
                    .ok()
            })
            .collect();
        Ok(transactions)
    }
}

/// The ledger reads the rest of the crate depends on.
pub trait LedgerApi: Send + Sync {
    fn balance(&self, address: &Address)
    -> impl Future<Output = Result<Coins, RpcError>> + Send;

    fn transactions(
        &self,
        address: &Address,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Transaction>, RpcError>> + Send;
}

impl<T: Transport> LedgerApi for RpcClient<T> {
    async fn balance(&self, address: &Address) -> Result<Coins, RpcError> {
        self.get_address_balance(&address.to_raw()).await
    }

    async fn transactions(
        &self,
        address: &Address,
        limit: u32,
    ) -> Result<Vec<Transaction>, RpcError> {
        self.get_transactions(&address.to_raw(), limit, false).await
    }
}
