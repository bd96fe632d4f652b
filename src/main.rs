//! Skiff engine entry point.
//!
//! Startup order matters: database (fatal), migrations (fatal), Docker
//! client (fatal), shared browser container (fatal), then the dispatcher
//! and the engine facade. The process runs until SIGINT/SIGTERM, then
//! cleans up within a bounded window: workers stop, sandbox containers
//! are reclaimed, in-progress flows are finished.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use skiff::app::{Engine, SHUTDOWN_TIMEOUT};
use skiff::browser::{BrowserService, init_browser_container};
use skiff::config::Config;
use skiff::db::{Storage, Store};
use skiff::dispatcher::{Deps, Dispatcher};
use skiff::hub::Hub;
use skiff::sandbox::{SandboxManager, connect_docker};

#[derive(Parser, Debug)]
#[command(name = "skiff")]
#[command(about = "LLM-driven flow execution engine with per-flow sandbox containers")]
#[command(version)]
struct Args {
    /// Skip spawning the shared browser container (browser tasks will fail)
    #[arg(long)]
    no_browser: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skiff=info")),
        )
        .init();

    let config = Config::from_env()?;

    let store = Store::new(&config.database).await?;
    store.run_migrations().await?;
    let store: Arc<dyn Storage> = Arc::new(store);
    tracing::info!("database connected and migrations applied");

    let docker = connect_docker()?;
    let version = docker.version().await?;
    tracing::info!(
        server_version = version.version.as_deref().unwrap_or("unknown"),
        api_version = version.api_version.as_deref().unwrap_or("unknown"),
        "docker client initialized"
    );

    let hub = Arc::new(Hub::new());
    let sandbox = Arc::new(SandboxManager::new(
        docker,
        Arc::clone(&store),
        Arc::clone(&hub),
    ));

    if args.no_browser {
        tracing::warn!("running without the shared browser container");
    } else {
        init_browser_container(&sandbox).await?;
        tracing::info!("browser container initialized");
    }
    let browser = Arc::new(BrowserService::new(config.browser.clone()));

    let dispatcher = Dispatcher::new(Deps {
        store: Arc::clone(&store),
        hub: Arc::clone(&hub),
        sandbox: Arc::clone(&sandbox),
        browser: Arc::clone(&browser),
        providers: config.providers.clone(),
        allow_any_image: config.safety.allow_any_image,
        base_url: config.server.base_url.clone(),
    });

    let engine = Engine::new(store, hub, sandbox, browser, dispatcher);
    tracing::info!(port = config.server.port, "engine ready; transport layer attaches here");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, engine.shutdown())
        .await
        .is_err()
    {
        tracing::error!(timeout = ?SHUTDOWN_TIMEOUT, "cleanup deadline exceeded");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler installs");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
