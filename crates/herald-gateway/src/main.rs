use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use herald_core::config::HeraldConfig;
use herald_scheduler::{
    db, DispatchOptions, Dispatcher, MessageSender, MessageStore, ScheduleService, StuckSweeper,
    SweepOptions, UnavailableSender,
};
use tracing::{info, warn};

mod app;
mod auth;
mod delivery;
mod http;

/// Herald: deferred message dispatch service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to herald.toml (falls back to $HERALD_CONFIG, then ~/.herald/herald.toml).
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "herald_gateway=info,herald_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    // load config: --config > HERALD_CONFIG env > ~/.herald/herald.toml
    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("HERALD_CONFIG").ok());
    let config = HeraldConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        HeraldConfig::default()
    });
    for w in config.warnings() {
        warn!("config: {w}");
    }

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    // one connection per component; the database arbitrates claims
    let api_store = Arc::new(MessageStore::new(db::open(&db_path)?)?);
    let dispatch_store = Arc::new(MessageStore::new(db::open(&db_path)?)?);
    let sweep_store = Arc::new(MessageStore::new(db::open(&db_path)?)?);

    let sender = build_sender(&config);
    info!(sender = sender.name(), "delivery sender ready");

    let dispatch_opts = DispatchOptions::from(&config.dispatcher);
    let schedule = ScheduleService::new(
        api_store,
        Arc::clone(&sender),
        dispatch_opts.send_timeout,
    );
    let dispatcher = Dispatcher::new(dispatch_store, sender, dispatch_opts);
    let sweeper = StuckSweeper::new(sweep_store, SweepOptions::from(&config.sweep));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatch_task = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    let sweep_task = tokio::spawn(sweeper.run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    if config.gateway.auth.token.is_none() {
        warn!("gateway.auth.token is not set; the schedule API is unauthenticated");
    }
    let state = Arc::new(app::AppState::new(config, schedule));
    let router = app::build_router(state);

    info!("Herald gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop background loops; in-flight sends finish first
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(dispatch_task, sweep_task);
    info!("Herald gateway stopped");
    Ok(())
}

/// Pick the delivery provider from config.
fn build_sender(config: &HeraldConfig) -> Arc<dyn MessageSender> {
    match config.sender.webhook {
        Some(ref webhook) => Arc::new(delivery::WebhookSender::new(webhook)),
        None => Arc::new(UnavailableSender),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
