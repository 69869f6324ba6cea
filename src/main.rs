use clap::Parser;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::Address;
use eyre::eyre;
use fs2::FileExt;
use leapchain_dispatcher::account::AccountPool;
use leapchain_dispatcher::chain::{Chain, EthersChain};
use leapchain_dispatcher::config::{Args, DispatcherConfig};
use leapchain_dispatcher::dispatcher::Dispatcher;
use leapchain_dispatcher::notifier::FanoutNotifier;
use leapchain_dispatcher::recovery::{Recovery, RecoveryConfig};
use leapchain_dispatcher::scheduler::{run_pickup, Scheduler};
use leapchain_dispatcher::sender::{run_ticker, Sender, SenderConfig};
use leapchain_dispatcher::store::{PgStore, Store};
use leapchain_dispatcher::watcher::Watcher;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_ACCOUNTS: i32 = 3;

struct Fatal {
    code: i32,
    report: eyre::Report,
}

fn fatal(code: i32, report: eyre::Report) -> Fatal {
    Fatal { code, report }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap's own message covers missing mandatory configuration.
            eprintln!("{e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err(err) = run(args).await {
        tracing::error!(code = err.code, "{:#}", err.report);
        std::process::exit(err.code);
    }
}

async fn run(args: Args) -> Result<(), Fatal> {
    let cfg = DispatcherConfig::from_args(args).map_err(|e| fatal(EXIT_CONFIG, eyre!(e)))?;

    // Single-instance guard: two dispatchers sharing keys would corrupt
    // per-account nonce tracking.
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&cfg.lock_file)
        .map_err(|e| {
            fatal(
                EXIT_CONFIG,
                eyre!("failed to open lock file {}: {e}", cfg.lock_file.display()),
            )
        })?;
    lock_file.try_lock_exclusive().map_err(|e| {
        fatal(
            EXIT_CONFIG,
            eyre!(
                "dispatcher already running or lock unavailable ({}): {e}",
                cfg.lock_file.display()
            ),
        )
    })?;
    let _lock_guard = lock_file;

    // The store is the system of record; refuse to start without it.
    let store = PgStore::connect(&cfg.store_url, cfg.store_pool_max)
        .await
        .map_err(|e| fatal(EXIT_STORE, eyre!("store unreachable: {e}")))?;
    store
        .migrate()
        .await
        .map_err(|e| fatal(EXIT_STORE, eyre!("store migration failed: {e}")))?;
    let store: Arc<dyn Store> = Arc::new(store);

    let recovery_store: Arc<dyn Store> = Arc::new(
        PgStore::connect(&cfg.store_url, cfg.recovery_store_pool_max())
            .await
            .map_err(|e| fatal(EXIT_STORE, eyre!("recovery store unreachable: {e}")))?,
    );

    let provider = Provider::<Http>::try_from(cfg.rpc_url.as_str())
        .map_err(|e| fatal(EXIT_CONFIG, eyre!("invalid RPC_URL: {e}")))?
        .interval(Duration::from_millis(800));

    let remote_chain_id = provider
        .get_chainid()
        .await
        .map_err(|e| fatal(EXIT_ACCOUNTS, eyre!("chain unreachable, cannot initialize accounts: {e}")))?
        .as_u64();
    let chain_id = match cfg.chain_id {
        Some(expected) if expected != remote_chain_id => {
            return Err(fatal(
                EXIT_CONFIG,
                eyre!(
                    "RPC chainId mismatch: configuration expects {expected}, RPC reports {remote_chain_id}"
                ),
            ));
        }
        Some(expected) => expected,
        None => remote_chain_id,
    };

    // The contract must actually live at the configured address.
    let code = provider
        .get_code(cfg.contract_address, None)
        .await
        .map_err(|e| fatal(EXIT_ACCOUNTS, eyre!("contract code check failed: {e}")))?;
    if code.0.is_empty() {
        return Err(fatal(
            EXIT_CONFIG,
            eyre!(
                "no contract code at {:?}; check CONTRACT_ADDRESS and RPC_URL",
                cfg.contract_address
            ),
        ));
    }

    let live_chain = Arc::new(EthersChain::new(
        provider.clone(),
        cfg.contract_address,
        chain_id,
        cfg.account_keys.clone(),
    ));
    let recovery_chain = Arc::new(EthersChain::new(
        provider,
        cfg.contract_address,
        chain_id,
        cfg.recovery_account_keys.clone(),
    ));

    if live_chain.accounts() == 0 {
        return Err(fatal(EXIT_ACCOUNTS, eyre!("no usable accounts could be initialized")));
    }

    tracing::info!(
        chain_id,
        contract = ?cfg.contract_address,
        accounts = live_chain.accounts(),
        recovery_accounts = recovery_chain.accounts(),
        dry_run = cfg.dry_run,
        "dispatcher starting"
    );

    // Pools mirror their chain clients account-for-account.
    let live_pool = Arc::new(AccountPool::new(
        pool_addresses(live_chain.as_ref()),
        cfg.fault_threshold,
    ));
    let recovery_pool = Arc::new(AccountPool::new(
        pool_addresses(recovery_chain.as_ref()),
        cfg.fault_threshold,
    ));

    let notifier = Arc::new(FanoutNotifier::new());
    let scheduler = Scheduler::new(live_pool.clone());
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), scheduler.clone()));

    let backlog = store
        .count_pending()
        .await
        .map_err(|e| fatal(EXIT_STORE, eyre!("pending count failed: {e}")))?;
    if backlog > 0 {
        tracing::info!(backlog, "pending rows left by a previous run; pickup tick will drain them");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    for account in live_pool.accounts() {
        let sender = Sender::new(
            account.clone(),
            live_pool.clone(),
            live_chain.clone(),
            store.clone(),
            notifier.clone(),
            SenderConfig::live(cfg.transaction_cooldown, cfg.dry_run),
        );
        tasks.push(tokio::spawn(sender.run(shutdown_tx.subscribe())));
    }

    // One activation timer per pool, not one per account.
    tasks.push(tokio::spawn(run_ticker(
        live_pool.clone(),
        cfg.queue_process_interval,
        shutdown_tx.subscribe(),
    )));

    tasks.push(tokio::spawn(run_pickup(
        scheduler,
        store.clone(),
        cfg.queue_process_interval,
        shutdown_tx.subscribe(),
    )));

    let watcher = Watcher::new(
        live_chain.clone(),
        store.clone(),
        notifier.clone(),
        cfg.watcher_page,
    );
    tasks.push(tokio::spawn(
        watcher.run(cfg.block_poll, shutdown_tx.subscribe()),
    ));

    if recovery_pool.is_empty() {
        tracing::warn!("RECOVERY_ACCOUNT_KEYS is empty; failed intents will not be retried");
    } else {
        for account in recovery_pool.accounts() {
            let sender = Sender::new(
                account.clone(),
                recovery_pool.clone(),
                recovery_chain.clone(),
                recovery_store.clone(),
                notifier.clone(),
                SenderConfig::recovery(cfg.transaction_cooldown, cfg.dry_run),
            );
            tasks.push(tokio::spawn(sender.run(shutdown_tx.subscribe())));
        }

        tasks.push(tokio::spawn(run_ticker(
            recovery_pool.clone(),
            cfg.queue_process_interval,
            shutdown_tx.subscribe(),
        )));

        let recovery = Recovery::new(
            Scheduler::new(recovery_pool.clone()),
            recovery_store.clone(),
            RecoveryConfig {
                interval: cfg.recovery_interval,
                batch: cfg.recovery_batch,
                max_retries: cfg.max_retries,
                age_limit: cfg.tx_age_limit,
                pending_stale: cfg.pending_stale,
                sent_stale: cfg.sent_stale,
                retention: cfg.retention,
            },
        );
        tasks.push(tokio::spawn(recovery.run(shutdown_tx.subscribe())));
    }

    tasks.push(tokio::spawn(status_loop(
        dispatcher.clone(),
        shutdown_tx.subscribe(),
    )));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| fatal(EXIT_CONFIG, eyre!("signal handler failed: {e}")))?;

    tracing::info!("shutdown requested; draining in-flight submissions");
    dispatcher.stop_accepting();
    // Every task holds a receiver; a send can only fail if they are all gone.
    let _ = shutdown_tx.send(());

    if tokio::time::timeout(cfg.shutdown_grace, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!(
            grace_ms = cfg.shutdown_grace.as_millis() as u64,
            "grace period elapsed with tasks still running"
        );
    }

    tracing::info!("dispatcher stopped");
    Ok(())
}

/// One pool slot per chain signer, in the chain's own index order.
fn pool_addresses(chain: &dyn Chain) -> Vec<Address> {
    (0..chain.accounts() as u32).map(|i| chain.address(i)).collect()
}

/// Low-cadence operational heartbeat over the admission surface.
async fn status_loop(dispatcher: Arc<Dispatcher>, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => break,
        }
        let pending = match dispatcher.pending_count().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "pending count failed");
                continue;
            }
        };
        let statuses = dispatcher.account_status();
        let queued: usize = statuses.iter().map(|s| s.queue_length).sum();
        let processed: u64 = statuses.iter().map(|s| s.processed).sum();
        let quarantined = statuses.iter().filter(|s| s.quarantined).count();
        tracing::info!(pending, queued, processed, quarantined, "queue status");
        if let Ok(detail) = serde_json::to_string(&statuses) {
            tracing::debug!(accounts = %detail, "account detail");
        }
    }
}
