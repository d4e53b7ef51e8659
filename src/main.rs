use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rxd_stratum_proxy::config::{Cli, Config};
use rxd_stratum_proxy::events::EventBus;
use rxd_stratum_proxy::hashrate::HashrateTracker;
use rxd_stratum_proxy::rpc::NodeRpcClient;
use rxd_stratum_proxy::stratum::server::start_server;
use rxd_stratum_proxy::stratum::session::SharedContext;
use rxd_stratum_proxy::template::TemplateStore;
use rxd_stratum_proxy::vardiff::VarDiffController;
use rxd_stratum_proxy::{tracing_setup, updater, zmq_listener};

const HASHRATE_WINDOW_SECS: f64 = 300.0;
const HASHRATE_EMA_HALF_LIFE_SECS: f64 = 120.0;
const VARDIFF_TICK_INTERVAL: Duration = Duration::from_secs(30);
const NODE_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_setup::init_journald_or_stdout(&config.log_level);

    tracing::info!(
        network_ip = %config.network.ip,
        network_port = config.network.port,
        testnet = config.node.testnet,
        vardiff_enabled = config.vardiff.enabled,
        "rxd-stratum-proxy starting"
    );

    let rpc = match NodeRpcClient::new(config.node.rpc_url(), NODE_RPC_TIMEOUT) {
        Ok(rpc) => rpc,
        Err(e) => {
            tracing::error!(error = %e, "failed to build node RPC client");
            std::process::exit(1);
        }
    };

    let store = TemplateStore::new();
    let events = Arc::new(EventBus::new());
    let hashrate = Arc::new(HashrateTracker::new(HASHRATE_WINDOW_SECS, HASHRATE_EMA_HALF_LIFE_SECS));

    let vardiff = if config.vardiff.enabled {
        let controller = Arc::new(VarDiffController::new(config.vardiff.clone()));
        controller.load_from_disk();
        Some(controller)
    } else {
        None
    };

    let ctx = Arc::new(SharedContext {
        template_store: store.clone(),
        vardiff: vardiff.clone(),
        hashrate,
        events,
        rpc: rpc.clone(),
        testnet: config.node.testnet,
        static_share_difficulty: config.difficulty.static_share_difficulty,
    });

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Shared across the poller and the ZMQ listener so a forced refresh
    // never races an in-flight one.
    let refresh_lock: updater::RefreshLock = Arc::new(tokio::sync::Mutex::new(()));

    tracker.spawn(updater::state_updater_loop(
        store.clone(),
        config.clone(),
        rpc.clone(),
        vardiff.clone(),
        refresh_lock.clone(),
        running.clone(),
    ));

    if config.zmq.enabled {
        let endpoint = config.zmq.resolved_endpoint(config.node.testnet);
        tracker.spawn(zmq_listener::run(
            endpoint,
            store.clone(),
            config.clone(),
            rpc.clone(),
            vardiff.clone(),
            refresh_lock.clone(),
            running.clone(),
        ));
    }

    if let Some(controller) = vardiff.clone() {
        let cancel = running.clone();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(VARDIFF_TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => controller.tick().await,
                }
            }
        });
    }

    let bind_addr = format!("{}:{}", config.network.ip, config.network.port);
    let server_cancel = running.clone();
    let server_tracker = tracker.clone();
    tracker.spawn(async move {
        if let Err(e) = start_server(&bind_addr, ctx, server_cancel, server_tracker).await {
            tracing::error!(error = %e, "stratum server exited with error");
        }
    });

    tracker.close();

    let mut sigint = unix::signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = unix::signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    tracing::info!("shutting down");
    running.cancel();
    tracker.wait().await;
    tracing::info!("exited");
}
