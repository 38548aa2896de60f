mod api;
mod config;
mod discovery;
mod engine;
mod registry;
mod registry_manager;
mod store;

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::composition::IoTApp;
use shared::registry::CapabilityModel;
use crate::config::Config;
use crate::engine::console::StdioConsole;
use crate::engine::executor;
use crate::engine::runs::{RunLocks, RunManager};
use crate::engine::transport::TcpCaller;
use crate::registry_manager::RegistryHandle;
use crate::store::db::AppStore;

const DEFAULT_CONFIG_PATH: &str = "/etc/thing-coordinator/coordinatord.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("thing_coordinatord=info,shared=info"))
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        Command::Run { app_path, config_path } => {
            run_once(&app_path, &load_config(&config_path)?).await?;
            // the stdin reader may still be parked on a read nobody will answer
            std::process::exit(0);
        }
        Command::Serve { config_path } => serve(load_config(&config_path)?).await,
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    /// `[config]`
    Serve { config_path: String },
    /// `run <app.json> [config]`
    Run { app_path: String, config_path: String },
}

fn parse_args(args: &[String]) -> Result<Command> {
    let config_at = |i: usize| {
        args.get(i)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    };

    match args.first().map(String::as_str) {
        Some("run") => {
            let app_path = args
                .get(1)
                .cloned()
                .context("usage: thing-coordinatord run <app.json> [config]")?;
            Ok(Command::Run { app_path, config_path: config_at(2) })
        }
        _ => Ok(Command::Serve { config_path: config_at(0) }),
    }
}

fn load_config(path: &str) -> Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("Failed to load config from {}", path))?;
    tracing::info!("Loaded config from {}", path);
    Ok(config)
}

/// Execute one composition file against the live Things
async fn run_once(app_path: &str, config: &Config) -> Result<()> {
    let body = std::fs::read_to_string(app_path)
        .with_context(|| format!("Failed to read app file: {}", app_path))?;
    let app = IoTApp::from_json(&body)
        .with_context(|| format!("Failed to load app from {}", app_path))?;

    print!("{app}");
    for problem in app.validate() {
        tracing::info!("{}", problem);
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Cancelling run");
            ctrl_c_cancel.cancel();
        }
    });

    let caller = TcpCaller::new(config.engine.control_port, config.engine.call_timeout());
    let mut console = StdioConsole::default();
    let summary = executor::run_app(&app, &caller, &mut console, &cancel).await;

    println!("Summary for {}:", summary.app_name);
    for line in summary.lines() {
        println!("  {line}");
    }
    Ok(())
}

/// Long-running coordinator: discovery, registry, store and API
async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting thing-coordinatord");

    // Bind discovery first; without it there is nothing to coordinate
    let socket = discovery::listener::bind(&config.discovery)?;

    let model = CapabilityModel::new();
    let initial_hash = registry::hash::compute_hash(model.things(), model.relationships());
    let (hash_tx, hash_rx) = watch::channel(initial_hash);

    let policy = registry::staleness::from_secs(config.registry.stale_after_secs);
    let registry_handle = RegistryHandle::spawn(model, policy, hash_tx);

    let store = AppStore::open(&config.store.db_path)?;
    tracing::info!("Opened app store at {:?}", config.store.db_path);

    let cancel = CancellationToken::new();

    let (listener_tx, listener_rx) = mpsc::channel(256);
    let listener_cancel = cancel.clone();
    let buffer_size = config.discovery.buffer_size;
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = discovery::listener::run_listener(socket, buffer_size, listener_tx, listener_cancel).await {
            tracing::error!("Announcement listener error: {}", e);
        }
    });

    let mgr_cancel = cancel.clone();
    let mgr_config = config.registry.clone();
    let mgr_registry = registry_handle.clone();
    let mgr_handle = tokio::spawn(async move {
        if let Err(e) = registry_manager::run(mgr_registry, listener_rx, mgr_config, mgr_cancel).await {
            tracing::error!("Registry manager error: {}", e);
        }
    });

    let caller = Arc::new(TcpCaller::new(config.engine.control_port, config.engine.call_timeout()));
    let app_state = api::routes::AppState {
        registry: registry_handle.clone(),
        hash_rx,
        store: Arc::new(Mutex::new(store)),
        runs: RunManager::new(caller, RunLocks::default(), config.engine.run_retention()),
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    cancel.cancel();

    let _ = tokio::join!(listener_handle, mgr_handle, server_handle);

    if let Err(e) = registry_handle.shutdown().await {
        tracing::error!("Failed to shutdown registry: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
