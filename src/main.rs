mod api;
mod batcher;
mod bounded_cache;
mod chain;
mod config;
mod crypto;
mod errors;
mod indexer;
mod ledger;
mod metrics;
mod models;
mod money;
mod notify;
mod retry;
mod store;
mod types;

use std::sync::Arc;

use eyre::{eyre, WrapErr};

use batcher::{BatchProcessor, BatcherSecrets};
use chain::evm::EvmChainAdapter;
use config::Config;
use indexer::{Indexer, IndexerSecrets};
use ledger::Ledger;
use notify::NotificationBus;
use store::sled_store::SledStore;
use types::EvmAddress;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

/// Everything one running chain needs alive for the lifetime of the
/// process: the indexer drives its own `run()` loop; the batch processor
/// has no top-level loop of its own (its only async work is the per-bucket
/// settlement timers it spawns), so it's kept around only so a future
/// business-API layer can call `request_withdrawal` against it.
struct ChainHandle<S: store::Store, C: chain::ChainAdapter> {
    #[allow(dead_code)]
    indexer: Arc<Indexer<S, C>>,
    #[allow(dead_code)]
    batcher: Arc<BatchProcessor<S, C>>,
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("starting custody engine");

    let config = Config::load()?;
    tracing::info!(chains = ?config.chains.keys().collect::<Vec<_>>(), "configuration loaded");

    let store = Arc::new(
        SledStore::open(&config.engine.store_path)
            .wrap_err("failed to open persistent store")?,
    );
    let ledger = Arc::new(Ledger::new(store.clone()));
    let notify = NotificationBus::new();

    let hot_wallet_signing_key = parse_signing_key(&config.secrets.hot_wallet_private_key_hex)
        .wrap_err("HOT_WALLET_PRIVATE_KEY_HEX is not a valid 32-byte hex key")?;
    let hot_wallet_address = EvmAddress::from_hex(&config.secrets.hot_wallet_address)
        .map_err(|e| eyre!("HOT_WALLET_ADDRESS is invalid: {e}"))?;
    let signing_master_seed = hex::decode(&config.secrets.signing_master_seed_hex)
        .wrap_err("SIGNING_MASTER_SEED_HEX is not valid hex")?;

    let mut run_handles = Vec::new();
    // Kept alive for the whole process even though nothing reads it yet:
    // dropping it would drop every `BatchProcessor`, whose only other
    // owner is the settlement-timer tasks it itself spawns, which don't
    // exist until a withdrawal is requested.
    let mut chain_handles = Vec::new();
    let chain_names: Vec<String> = config.chains.keys().cloned().collect();

    for (chain_name, chain_config) in config.chains.clone() {
        tracing::info!(chain = %chain_name, "connecting chain adapter");
        let adapter = Arc::new(
            EvmChainAdapter::connect(
                chain_name.clone(),
                chain_config.http_rpc_url.clone(),
                Some(chain_config.rpc_url.clone()),
                chain_config.chain_id,
            )
            .await
            .wrap_err_with(|| format!("chain {chain_name}: failed to connect adapter"))?,
        );

        let indexer = Indexer::new(
            chain_name.clone(),
            chain_config.clone(),
            store.clone(),
            adapter.clone(),
            ledger.clone(),
            notify.clone(),
            IndexerSecrets {
                signing_master_seed: signing_master_seed.clone(),
                hot_wallet_address: hot_wallet_address.clone(),
                hot_wallet_signing_key,
            },
            config.engine.max_retries,
        )
        .await
        .wrap_err_with(|| format!("chain {chain_name}: failed to start indexer"))?;

        let batcher = BatchProcessor::new(
            chain_name.clone(),
            chain_config.clone(),
            store.clone(),
            adapter.clone(),
            ledger.clone(),
            notify.clone(),
            BatcherSecrets {
                hot_wallet_signing_key,
                hot_wallet_address: hot_wallet_address.clone(),
            },
            config.engine.max_retries,
        )
        .await
        .wrap_err_with(|| format!("chain {chain_name}: failed to start batch processor"))?;

        let chain_name_for_task = chain_name.clone();
        let indexer_for_task = indexer.clone();
        let run_handle = tokio::spawn(async move {
            if let Err(e) = indexer_for_task.run().await {
                tracing::error!(chain = %chain_name_for_task, error = %e, "indexer stopped");
            }
        });

        run_handles.push(run_handle);
        chain_handles.push(ChainHandle { indexer, batcher });
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    let api_addr = config.engine.health_addr.clone();
    let api_chains = chain_names.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(&api_addr, api_chains).await {
            tracing::error!(error = %e, "health/metrics server error");
        }
    });

    tracing::info!("custody engine running");

    tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutdown signal received");
        }
        _ = futures::future::join_all(run_handles) => {
            tracing::warn!("all chain indexers stopped on their own");
        }
    }

    drop(chain_handles);
    tracing::info!("custody engine stopped");
    Ok(())
}

fn parse_signing_key(hex_str: &str) -> eyre::Result<[u8; 32]> {
    let bytes = hex::decode(hex_str.trim_start_matches("0x"))?;
    bytes
        .try_into()
        .map_err(|_| eyre!("signing key must be exactly 32 bytes"))
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,custody_engine=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received ctrl+c, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received sigterm, initiating shutdown");
        }
    }
}
