//! Intent settlement engine - settles solver-filled intents as cross-chain
//! HTLC atomic swaps.
//!
//! Pass `--simulate` to run against in-memory chains instead of RPC endpoints.

use anyhow::Result;
use chrono::Utc;
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use intent_settlement::api::{self, AppState};
use intent_settlement::chain::finality::recommended_confirmations;
use intent_settlement::chain::{
    ChainClient, ChainProvider, EvmChainClient, FinalityTracker, RetryPolicy, RetryingClient,
    SimulatedChain,
};
use intent_settlement::config::{ChainConfig, Settings, WalletConfig};
use intent_settlement::coordination::SettlementEngine;
use intent_settlement::htlc::HtlcManager;
use intent_settlement::intent::IntentEngine;
use intent_settlement::metrics::{self, MetricsServer};
use intent_settlement::state::{MemoryStore, SettlementStore, StateManager};
use intent_settlement::swap::{SwapConfig, SwapCoordinator};
use intent_settlement::tx::TransactionSender;
use intent_settlement::{SettlementError, SettlementResult};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting intent settlement engine v{}", env!("CARGO_PKG_VERSION"));

    let simulate = std::env::args().any(|arg| arg == "--simulate");

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Persistence
    let store: Arc<dyn SettlementStore> = match &settings.database {
        Some(database) if !simulate => {
            let state_manager = StateManager::new(database).await?;
            state_manager.run_migrations().await?;
            info!("Database connection established");
            Arc::new(state_manager)
        }
        _ => {
            warn!("No database in use, settlement state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    // One HTLC manager per enabled chain
    let algorithm = settings.engine.hash_algorithm;
    let policy = RetryPolicy::from(settings.retry.clone());
    let mut managers = HashMap::new();
    for (name, chain) in settings.enabled_chains() {
        let client: Arc<dyn ChainClient> = if simulate {
            let start = Utc::now().timestamp().max(0) as u64;
            Arc::new(SimulatedChain::new(chain.chain_id, algorithm, start))
        } else {
            if chain.htlc_contract_address.is_empty() {
                continue;
            }
            match connect_chain(chain, &settings.wallet, policy).await {
                Ok(client) => client,
                Err(e) => {
                    error!("Failed to connect chain {} ({}): {}", name, chain.chain_id, e);
                    metrics::record_chain_health(chain.chain_id, false);
                    continue;
                }
            }
        };
        metrics::record_chain_health(chain.chain_id, true);
        managers.insert(
            chain.chain_id,
            Arc::new(HtlcManager::new(
                client,
                store.clone(),
                algorithm,
                settings.engine.min_confirmations,
            )),
        );
        info!("Chain {} ({}) ready", name, chain.chain_id);
    }
    if managers.is_empty() {
        anyhow::bail!("No chain could be connected");
    }

    let swaps = Arc::new(SwapCoordinator::new(
        managers,
        store.clone(),
        SwapConfig::from(&settings.engine),
    )?);
    let intents = Arc::new(IntentEngine::new(store.clone()));
    let engine = Arc::new(SettlementEngine::new(
        intents,
        swaps,
        settings.engine.clone(),
    ));
    info!("Settlement engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            store: store.clone(),
            engine: engine.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start recovery loop
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Settlement engine error: {}", e);
            }
        }
    });

    info!("Intent settlement engine is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    engine.stop().await;
    api_handle.abort();
    engine_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Intent settlement engine stopped");
    Ok(())
}

/// RPC-backed client for one chain, wrapped in the retry policy
async fn connect_chain(
    config: &ChainConfig,
    wallet: &WalletConfig,
    policy: RetryPolicy,
) -> SettlementResult<Arc<dyn ChainClient>> {
    let escrow: Address = config.htlc_contract_address.parse().map_err(|_| {
        SettlementError::Config(format!(
            "invalid HTLC contract address for chain {}: {}",
            config.chain_id, config.htlc_contract_address
        ))
    })?;

    let provider = Arc::new(ChainProvider::new(config.clone()).await?);
    let mut senders = Vec::new();
    for wallet in TransactionSender::load_wallets(wallet)? {
        senders.push(TransactionSender::new(provider.clone(), wallet, escrow).await?);
    }

    let confirmations = if config.confirmation_blocks == 0 {
        recommended_confirmations(config.chain_id)
    } else {
        config.confirmation_blocks
    };
    let finality = FinalityTracker::new(
        config.chain_id,
        confirmations,
        provider.clone(),
        Duration::from_secs(2),
        Duration::from_secs(600),
    );

    let client = EvmChainClient::new(provider, escrow, senders, finality);
    if !client.health_check().await {
        warn!("Chain {} failed its first health check", config.chain_id);
    }
    Ok(Arc::new(RetryingClient::new(client, policy)))
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,intent_settlement=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
