use crate::{
    Error,
    Result,
    address::Address,
    balance::CacheWindows,
    bet::BetSettings,
    coins::Coins,
    reconciler::history::DEFAULT_HISTORY_LIMIT,
    rpc::{
        HttpTransport,
        RetryPolicy,
        RpcClient,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    fs,
    path::PathBuf,
    time::Duration,
};
use url::Url;

pub const API_KEY_ENV: &str = "FLIP_RPC_API_KEY";
pub const MAINNET_ENDPOINT: &str = "https://toncenter.com/api/v2/jsonRPC";
pub const TESTNET_ENDPOINT: &str = "https://testnet.toncenter.com/api/v2/jsonRPC";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn default_endpoint(self) -> &'static str {
        match self {
            Network::Mainnet => MAINNET_ENDPOINT,
            Network::Testnet => TESTNET_ENDPOINT,
        }
    }

    pub fn is_testnet(self) -> bool {
        self == Network::Testnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        };
        write!(f, "{name}")
    }
}

/// Client settings read from a JSON file. Every field is optional; unknown
/// fields are ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub network: Network,
    /// Overrides the network's default endpoint.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub contract_address: Option<String>,
    pub contract_cache_window_ms: u64,
    pub wallet_cache_window_ms: u64,
    pub fallback_balance: Coins,
    pub history_limit: usize,
    pub transactions_page: u32,
    pub settle_timeout_ms: u64,
    /// Sled directory for persisted balances; in-memory when unset.
    pub balance_store: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            endpoint: None,
            api_key: None,
            request_timeout_ms: 15_000,
            retry: RetryPolicy::default(),
            contract_address: None,
            contract_cache_window_ms: 60_000,
            wallet_cache_window_ms: 5_000,
            fallback_balance: Coins::ZERO,
            history_limit: DEFAULT_HISTORY_LIMIT,
            transactions_page: 20,
            settle_timeout_ms: 300_000,
            balance_store: None,
        }
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

impl ClientConfig {
    /// Reads the file at `path` (`~` expanded), then applies `FLIP_RPC_API_KEY`.
    pub fn load(path: &str) -> Result<Self> {
        let path = expand_path(path);
        let data = fs::read(&path).map_err(|e| {
            Error::Config(format!("failed to read config {}: {e}", path.display()))
        })?;
        let mut config = Self::from_json(&data)?;
        config.apply_api_key_override(std::env::var(API_KEY_ENV).ok());
        Ok(config)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(data)
            .map_err(|e| Error::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_api_key_override(&mut self, api_key: Option<String>) {
        if let Some(key) = api_key.filter(|key| !key.trim().is_empty()) {
            self.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint_url()?;
        if let Some(contract) = &self.contract_address {
            Address::parse(contract)?;
        }
        if self.history_limit == 0 {
            return Err(Error::Config("history_limit must be positive".to_string()));
        }
        if self.transactions_page == 0 {
            return Err(Error::Config(
                "transactions_page must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn endpoint_url(&self) -> Result<Url> {
        let raw = self
            .endpoint
            .as_deref()
            .unwrap_or_else(|| self.network.default_endpoint());
        let url = Url::parse(raw)
            .map_err(|e| Error::Config(format!("invalid endpoint {raw:?}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::Config(format!(
                "endpoint {raw:?} uses unsupported scheme {other:?}"
            ))),
        }
    }

    pub fn contract(&self) -> Result<Address> {
        let raw = self
            .contract_address
            .as_deref()
            .ok_or_else(|| Error::Config("contract_address is not configured".to_string()))?;
        Ok(Address::parse(raw)?)
    }

    pub fn cache_windows(&self) -> CacheWindows {
        CacheWindows {
            contract: Duration::from_millis(self.contract_cache_window_ms),
            wallet: Duration::from_millis(self.wallet_cache_window_ms),
        }
    }

    pub fn bet_settings(&self, bettor: Address) -> Result<BetSettings> {
        Ok(BetSettings {
            transactions_page: self.transactions_page,
            settle_timeout: Duration::from_millis(self.settle_timeout_ms),
            ..BetSettings::new(self.contract()?, bettor)
        })
    }

    pub fn balance_store_path(&self) -> Option<PathBuf> {
        self.balance_store.as_deref().map(expand_path)
    }

    pub fn build_client(&self) -> Result<RpcClient<HttpTransport>> {
        let url = self.endpoint_url()?;
        let transport = HttpTransport::new(
            url.as_str(),
            self.api_key.clone(),
            Duration::from_millis(self.request_timeout_ms),
        )
        .map_err(|e| Error::Config(e.to_string()))?;
        Ok(RpcClient::new(transport, self.retry.clone()))
    }
}
