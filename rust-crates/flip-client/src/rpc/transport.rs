use chrono::{
    DateTime,
    Utc,
};
use reqwest::header::{
    CONTENT_TYPE,
    RETRY_AFTER,
};
use std::{
    fmt,
    time::Duration,
};

pub const API_KEY_HEADER: &str = "X-API-Key";
/// Upper bound on a server-requested wait.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Raw HTTP answer handed to the retry logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: Vec::new(),
        }
    }
}

/// Connection-level failure: nothing usable came back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

pub trait Transport: Send + Sync {
    fn post(
        &self,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<HttpReply, TransportError>> + Send;
}

#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            http,
        })
    }
}

impl Transport for HttpTransport {
    async fn post(&self, body: Vec<u8>) -> Result<HttpReply, TransportError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let res = request
            .send()
            .await
            .map_err(|e| TransportError(format!("request to {} failed: {e}", self.endpoint)))?;
        let status = res.status().as_u16();
        let retry_after = res
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, Utc::now()));
        let body = res
            .bytes()
            .await
            .map_err(|e| TransportError(format!("failed to read response body: {e}")))?;
        Ok(HttpReply {
            status,
            retry_after,
            body: body.to_vec(),
        })
    }
}

impl fmt::Display for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}

/// `Retry-After` is either delta-seconds or an HTTP-date. Dates in the past mean "now";
/// anything longer than [`MAX_RETRY_AFTER`] is clamped to it.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    let wait = match value.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => DateTime::parse_from_rfc2822(value)
            .ok()?
            .with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    };
    Some(wait.min(MAX_RETRY_AFTER))
}
