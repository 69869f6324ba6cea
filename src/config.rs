use crate::error::ConfigError;
use clap::Parser;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "leapchain-dispatcher",
    version,
    about = "Multi-account transaction dispatcher for the LeapChain game contract"
)]
pub struct Args {
    /// Target game contract address.
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: String,

    /// Chain RPC endpoint.
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: String,

    /// Expected chain id. When set, the RPC must report the same id or the
    /// dispatcher refuses to start; when unset, the remote value is adopted.
    #[arg(long, env = "CHAIN_ID")]
    pub chain_id: Option<u64>,

    /// Comma-separated signing keys for the live pool. Pool size = key count.
    #[arg(long, env = "ACCOUNT_KEYS", value_delimiter = ',', hide_env_values = true)]
    pub account_keys: Vec<String>,

    /// Comma-separated signing keys for the recovery pool. Must be disjoint
    /// from the live pool or nonce tracking would be corrupted.
    #[arg(
        long,
        env = "RECOVERY_ACCOUNT_KEYS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub recovery_account_keys: Vec<String>,

    /// Scheduler tick in milliseconds.
    #[arg(long, env = "QUEUE_PROCESS_INTERVAL_MS", default_value_t = 200)]
    pub queue_process_interval_ms: u64,

    /// Per-account spacing between submissions, in milliseconds.
    #[arg(long, env = "TRANSACTION_COOLDOWN_MS", default_value_t = 100)]
    pub transaction_cooldown_ms: u64,

    /// Consecutive errors before an account is quarantined.
    #[arg(long, env = "FAULT_THRESHOLD", default_value_t = 5)]
    pub fault_threshold: u32,

    /// Recovery dispatcher cadence in milliseconds.
    #[arg(long, env = "RECOVERY_INTERVAL_MS", default_value_t = 300_000)]
    pub recovery_interval_ms: u64,

    /// Failed rows picked up per recovery cycle.
    #[arg(long, env = "RECOVERY_BATCH", default_value_t = 5)]
    pub recovery_batch: u32,

    /// Retry budget per intent across recovery passes.
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Failed rows older than this are abandoned by recovery.
    #[arg(long, env = "TX_AGE_LIMIT_HOURS", default_value_t = 48)]
    pub tx_age_limit_hours: u64,

    /// Housekeeping converts `pending` rows to `failed` after this age.
    #[arg(long, env = "PENDING_STALE_MS", default_value_t = 3_600_000)]
    pub pending_stale_ms: u64,

    /// Housekeeping hands `sent` rows with no receipt to recovery after this age.
    #[arg(long, env = "SENT_STALE_MS", default_value_t = 3_600_000)]
    pub sent_stale_ms: u64,

    /// Terminal rows older than this are deleted by housekeeping.
    #[arg(long, env = "RETENTION_MS", default_value_t = 86_400_000)]
    pub retention_ms: u64,

    /// Durable queue connection string (Postgres).
    #[arg(long, env = "STORE_URL")]
    pub store_url: String,

    /// Max connections in the live store pool.
    #[arg(long, env = "STORE_POOL_MAX", default_value_t = 20)]
    pub store_pool_max: u32,

    /// New-block poll interval for the confirmation watcher, in milliseconds.
    #[arg(long, env = "BLOCK_POLL_MS", default_value_t = 1_000)]
    pub block_poll_ms: u64,

    /// Max `sent` rows inspected per new block.
    #[arg(long, env = "WATCHER_PAGE", default_value_t = 50)]
    pub watcher_page: u32,

    /// Shutdown grace period for in-flight submissions, in milliseconds.
    #[arg(long, env = "SHUTDOWN_GRACE_MS", default_value_t = 10_000)]
    pub shutdown_grace_ms: u64,

    /// Single-instance lock file. Two dispatchers sharing keys would corrupt
    /// per-account nonce tracking.
    #[arg(long, env = "LOCK_FILE", default_value = "leapchain-dispatcher.lock")]
    pub lock_file: PathBuf,

    /// Admit and schedule but never submit; queue rows stay pending.
    #[arg(long)]
    pub dry_run: bool,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub contract_address: Address,
    pub rpc_url: String,
    pub chain_id: Option<u64>,

    pub account_keys: Vec<LocalWallet>,
    pub recovery_account_keys: Vec<LocalWallet>,

    pub queue_process_interval: Duration,
    pub transaction_cooldown: Duration,
    pub fault_threshold: u32,

    pub recovery_interval: Duration,
    pub recovery_batch: u32,
    pub max_retries: u32,
    pub tx_age_limit: Duration,

    pub pending_stale: Duration,
    pub sent_stale: Duration,
    pub retention: Duration,

    pub store_url: String,
    pub store_pool_max: u32,

    pub block_poll: Duration,
    pub watcher_page: u32,
    pub shutdown_grace: Duration,

    pub lock_file: PathBuf,
    pub dry_run: bool,
}

impl DispatcherConfig {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let contract_address = Address::from_str(args.contract_address.trim())
            .map_err(|e| ConfigError(format!("invalid CONTRACT_ADDRESS '{}': {e}", args.contract_address)))?;

        if args.rpc_url.trim().is_empty() {
            return Err(ConfigError("RPC_URL is empty".into()));
        }

        let account_keys = parse_keys(&args.account_keys, "ACCOUNT_KEYS")?;
        if account_keys.is_empty() {
            return Err(ConfigError("ACCOUNT_KEYS is empty; pool size is the key count".into()));
        }
        let recovery_account_keys = parse_keys(&args.recovery_account_keys, "RECOVERY_ACCOUNT_KEYS")?;

        let live: HashSet<Address> = account_keys.iter().map(|w| w.address()).collect();
        if live.len() != account_keys.len() {
            return Err(ConfigError("ACCOUNT_KEYS contains duplicate keys".into()));
        }
        for w in &recovery_account_keys {
            if live.contains(&w.address()) {
                return Err(ConfigError(format!(
                    "recovery key for {:?} is also in the live pool; pools must be disjoint",
                    w.address()
                )));
            }
        }

        if args.watcher_page == 0 {
            return Err(ConfigError("WATCHER_PAGE must be > 0".into()));
        }
        if args.recovery_batch == 0 {
            return Err(ConfigError("RECOVERY_BATCH must be > 0".into()));
        }
        if args.store_pool_max == 0 {
            return Err(ConfigError("STORE_POOL_MAX must be > 0".into()));
        }
        if args.fault_threshold == 0 {
            return Err(ConfigError("FAULT_THRESHOLD must be > 0".into()));
        }

        Ok(Self {
            contract_address,
            rpc_url: args.rpc_url,
            chain_id: args.chain_id,
            account_keys,
            recovery_account_keys,
            queue_process_interval: Duration::from_millis(args.queue_process_interval_ms.max(10)),
            transaction_cooldown: Duration::from_millis(args.transaction_cooldown_ms),
            fault_threshold: args.fault_threshold,
            recovery_interval: Duration::from_millis(args.recovery_interval_ms.max(1_000)),
            recovery_batch: args.recovery_batch,
            max_retries: args.max_retries,
            tx_age_limit: Duration::from_secs(args.tx_age_limit_hours.saturating_mul(3_600)),
            pending_stale: Duration::from_millis(args.pending_stale_ms.max(1_000)),
            sent_stale: Duration::from_millis(args.sent_stale_ms.max(1_000)),
            retention: Duration::from_millis(args.retention_ms.max(1_000)),
            store_url: args.store_url,
            store_pool_max: args.store_pool_max,
            block_poll: Duration::from_millis(args.block_poll_ms.max(100)),
            watcher_page: args.watcher_page,
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms.max(1_000)),
            lock_file: args.lock_file,
            dry_run: args.dry_run,
        })
    }

    /// Store pool cap for the recovery dispatcher's own connections.
    pub fn recovery_store_pool_max(&self) -> u32 {
        self.store_pool_max.min(10)
    }
}

fn parse_keys(raw: &[String], var: &str) -> Result<Vec<LocalWallet>, ConfigError> {
    let mut out = Vec::with_capacity(raw.len());
    for (i, key) in raw.iter().enumerate() {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| ConfigError(format!("invalid key at {var}[{i}]: {e}")))?;
        out.push(wallet);
    }
    Ok(out)
}
