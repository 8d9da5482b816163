use anyhow::Context;
use clap::{
    ArgGroup,
    Parser,
    Subcommand,
    ValueEnum,
};
use flip_client::{
    Address,
    AddressStyle,
    Cell,
    RpcClient,
    address::normalize,
    balance::{
        BalanceCache,
        BalanceKind,
        BalanceStore,
        InMemoryBalanceStore,
        SledBalanceStore,
        SystemClock,
    },
    config::{
        API_KEY_ENV,
        ClientConfig,
        Network,
    },
    reconciler::{
        BetHistory,
        FlipOperation,
        decode_comment,
        reconcile,
    },
    rpc::LedgerApi,
};
use futures::future::join_all;
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = None,
    group(
        ArgGroup::new("network")
            .args(["mainnet", "testnet"])
            .required(false)
    )
)]
struct Args {
    /// JSON client config; `~` is expanded.
    #[arg(short, long)]
    config: Option<String>,

    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    mainnet: bool,

    #[arg(long)]
    testnet: bool,

    /// Also write daily-rotated logs into this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the raw `workchain:hex` form of an address.
    Normalize { address: String },
    /// Print the user-friendly form of an address.
    Format {
        address: String,
        #[arg(long, conflicts_with = "non_bounceable")]
        bounceable: bool,
        #[arg(long)]
        non_bounceable: bool,
        /// Standard base64 instead of base64url.
        #[arg(long)]
        standard: bool,
    },
    Balance {
        #[arg(required = true)]
        addresses: Vec<String>,
        /// Use the short wallet cache window instead of the contract one.
        #[arg(long)]
        wallet: bool,
    },
    /// Settled flips of a bettor against the configured contract, newest first.
    History {
        bettor: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Print the base64 BOC of a flip message body.
    FlipBody { side: Side },
    /// Interpret a base64 BOC message body.
    DecodeBody { boc: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Side {
    Heads,
    Tails,
}

impl From<Side> for bool {
    fn from(side: Side) -> Self {
        matches!(side, Side::Heads)
    }
}

fn side_label(side: bool) -> &'static str {
    if side { "heads" } else { "tails" }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "flip-cli.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading client config from {path}"))?,
        None => {
            let mut config = ClientConfig::default();
            config.apply_api_key_override(std::env::var(API_KEY_ENV).ok());
            config
        }
    };
    if args.mainnet {
        config.network = Network::Mainnet;
    } else if args.testnet {
        config.network = Network::Testnet;
    }
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = Some(endpoint.clone());
    }
    if let Some(key) = &args.api_key {
        config.api_key = Some(key.clone());
    }
    config.validate().context("validating client config")?;
    Ok(config)
}

async fn print_balances<S: BalanceStore>(
    cache: BalanceCache<RpcClient, S, SystemClock>,
    addresses: &[String],
    kind: BalanceKind,
) {
    let balances = join_all(
        addresses
            .iter()
            .map(|address| cache.get_balance(address, kind)),
    )
    .await;
    for (address, balance) in addresses.iter().zip(balances) {
        println!("{address}\t{balance}");
    }
}

async fn balance(
    config: &ClientConfig,
    addresses: &[String],
    wallet: bool,
) -> anyhow::Result<()> {
    let client = Arc::new(config.build_client()?);
    let kind = if wallet {
        BalanceKind::Wallet
    } else {
        BalanceKind::Contract
    };
    match config.balance_store_path() {
        Some(path) => {
            let store = SledBalanceStore::open(&path)
                .with_context(|| format!("opening balance store {}", path.display()))?;
            let cache = BalanceCache::new(client, store, SystemClock)
                .with_windows(config.cache_windows())
                .with_fallback(config.fallback_balance);
            print_balances(cache, addresses, kind).await;
        }
        None => {
            let cache = BalanceCache::new(client, InMemoryBalanceStore::new(), SystemClock)
                .with_windows(config.cache_windows())
                .with_fallback(config.fallback_balance);
            print_balances(cache, addresses, kind).await;
        }
    }
    Ok(())
}

async fn history(config: &ClientConfig, bettor: &str, limit: u32) -> anyhow::Result<()> {
    let contract = config.contract()?;
    let bettor = Address::parse(bettor).context("parsing bettor address")?;
    let client = config.build_client()?;
    let transactions = client
        .transactions(&contract, limit)
        .await
        .with_context(|| format!("fetching transactions of {contract}"))?;
    tracing::info!(
        "Fetched {} transactions of {}",
        transactions.len(),
        contract
    );
    let mut history = BetHistory::new(config.history_limit);
    history.extend(reconcile(&bettor, &transactions));
    for record in history.iter() {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

fn decode_body(boc: &str) -> anyhow::Result<()> {
    let cell = Cell::from_boc_base64(boc.trim()).context("decoding BOC")?;
    if let Some(flip) = FlipOperation::decode(&cell) {
        println!("flip side={}", side_label(flip.side));
    } else if let Some(comment) = decode_comment(&cell) {
        println!("comment {comment:?}");
    } else {
        println!("unrecognised body {}\n{cell}", cell.hash_hex());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_tracing(args.log_dir.as_deref());

    match &args.command {
        Command::Normalize { address } => {
            println!("{}", normalize(address)?);
        }
        Command::Format {
            address,
            bounceable,
            non_bounceable,
            standard,
        } => {
            let parsed = Address::parse(address)?;
            let style = AddressStyle::Friendly {
                bounceable: *bounceable || !*non_bounceable,
                testnet: args.testnet,
                url_safe: !*standard,
            };
            println!("{}", parsed.format(style));
        }
        Command::Balance { addresses, wallet } => {
            let config = load_config(&args)?;
            balance(&config, addresses, *wallet).await?;
        }
        Command::History { bettor, limit } => {
            let config = load_config(&args)?;
            history(&config, bettor, *limit).await?;
        }
        Command::FlipBody { side } => {
            let body = FlipOperation::new((*side).into())
                .body()
                .context("building flip body")?;
            println!("{}", body.to_boc_base64());
        }
        Command::DecodeBody { boc } => decode_body(boc)?,
    }
    Ok(())
}
