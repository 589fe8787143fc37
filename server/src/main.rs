#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # encctl
//!
//! Network reconciliation and cloud relay control daemon for streaming
//! encoder appliances.
//!
//! encctl keeps an in-process model of the device's network interfaces, WiFi
//! adapters (client and hotspot mode) and cellular modems in sync with
//! NetworkManager and ModemManager, pushes every change to connected UI
//! sessions, and holds a persistent control connection to a cloud relay.
//!
//! ## Subcommands
//!
//! - `encctl serve` (default): run the daemon
//!
//! ## API surface
//!
//! | Method | Path          | Auth | Description                              |
//! |--------|---------------|------|------------------------------------------|
//! | GET    | `/api/health` | No   | Liveness probe, relay connection stats   |
//! | GET    | `/api/status` | Yes  | Full status snapshot                     |
//! | GET    | `/api/ws`     | Yes* | WebSocket for UI sessions                |
//!
//! *WebSocket auth is via `?token=<key>` query param (no `Authorization` header
//! available during the upgrade handshake).
//!
//! ## Background tasks
//!
//! - interface poller: `ip -j addr show` every `netif_interval_ms`; a change
//!   triggers a full WiFi re-sync, which also runs every `wifi_resync_secs`
//! - modem poller: `mmcli` every `modem_interval_secs`
//! - relay client: when `[remote]` is configured

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use encctl::config::Config;
use encctl::status::envelope;
use encctl::tool::{SharedRunner, SystemRunner};
use encctl::{modems, netif, remote, routes, AppState};

/// Network reconciliation and cloud relay control daemon.
#[derive(Parser)]
#[command(name = "encctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    if let Err(e) = run_server(config_path.as_deref()).await {
        eprintln!("encctl: {e}");
        std::process::exit(1);
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path)?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("encctl v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Data dir: {}", config.data_dir().display());
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set ENCCTL_API_KEY or update config");
    }

    let runner: SharedRunner = Arc::new(SystemRunner::new(Duration::from_millis(
        config.tools.timeout_ms,
    )));
    let state = AppState::new(config, runner).await?;
    let shutdown = CancellationToken::new();

    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .map_err(|e| format!("Failed to bind {}: {e}", state.config.server.listen))?;

    // Initial sync before anyone connects.
    if let Err(e) =
        netif::poll_interfaces(&state.runner, &state.config.tools.ip, &state.netif).await
    {
        warn!("Initial interface poll failed: {e}");
    }
    state.wifi.refresh_all().await;

    let network_task = spawn_network_poller(state.clone());
    let modem_task = modems::spawn_modem_poller(
        state.modems.clone(),
        Duration::from_secs(state.config.poll.modem_interval_secs),
    );
    let remote_task = state.config.remote.clone().map(|rc| {
        info!("Remote relay enabled, will connect to {}", rc.url());
        remote::client::spawn(state.clone(), rc, shutdown.clone())
    });

    info!("Server ready");

    let signal = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Failed to register SIGTERM: {e}");
                    ctrl_c.await.ok();
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    let serve_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            serve_shutdown.cancel();
        })
        .await
        .map_err(|e| format!("Server error: {e}"));

    // Cleanup
    info!("Shutting down...");
    shutdown.cancel();
    network_task.abort();
    modem_task.abort();
    if let Some(task) = remote_task {
        if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
            warn!("Remote client did not stop in time");
        }
    }
    info!("Goodbye");
    served
}

/// Interface poller plus periodic WiFi re-sync.
///
/// NetworkManager is only queried when the interface set changed or the
/// re-sync period elapsed.
fn spawn_network_poller(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut netif_tick =
            tokio::time::interval(Duration::from_millis(state.config.poll.netif_interval_ms));
        netif_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut resync_tick =
            tokio::time::interval(Duration::from_secs(state.config.poll.wifi_resync_secs));
        resync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = netif_tick.tick() => {
                    match netif::poll_interfaces(&state.runner, &state.config.tools.ip, &state.netif).await {
                        Ok(true) => {
                            debug!("Interface set changed, re-syncing WiFi");
                            let view = state.netif.lock().await.build_status_message();
                            let _ = state.events.send(envelope("netif", view));
                            if state.wifi.refresh_all().await {
                                state.wifi.broadcast().await;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => debug!("Interface poll failed: {e}"),
                    }
                }
                _ = resync_tick.tick() => {
                    if state.wifi.refresh_all().await {
                        state.wifi.broadcast().await;
                    }
                }
            }
        }
    })
}
