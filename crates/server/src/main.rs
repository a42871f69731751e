use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use doorman_gateway::GatewayContext;
use doorman_gateway::pipeline::Gateway;
use doorman_server::app::{AppState, build_router};
use doorman_server::config::Settings;
use doorman_server::lifecycle;
use doorman_server::state_factory;
use doorman_store::MemoryConfigStore;

/// Doorman gateway HTTP server.
#[derive(Parser, Debug)]
#[command(name = "doorman-server", about = "Standalone HTTP server for Doorman")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "doorman.toml")]
    config: PathBuf,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    lifecycle::init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = Settings::load(&cli.config)?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    // Startup validation gates everything, including the port bind.
    if let Err(errors) = settings.validate() {
        for message in &errors {
            error!("startup validation: {message}");
        }
        return Err(format!("{} startup validation failure(s)", errors.len()).into());
    }

    let master_key = doorman_crypto::parse_master_key(
        settings
            .crypto
            .mem_encryption_key
            .as_deref()
            .unwrap_or("doorman-development-key"),
    )?;

    // Open the config store, then the shared counter/cache backend.
    let store = Arc::new(MemoryConfigStore::with_standard_indexes().await);
    let shared = state_factory::create_shared_store(&settings)?;

    // Initialize auth keys and the rest of the application context.
    let ctx = Arc::new(GatewayContext::new(
        store,
        shared,
        master_key.clone(),
        &settings.jwt_secret(),
        settings.auth.access_token_expires_minutes,
        settings.auth.refresh_token_expires_days,
        settings.gateway.metrics_pct_samples,
        settings.gateway_config(),
    ));

    // Embedded mode: restore the last snapshot before accepting traffic.
    lifecycle::restore_snapshot(&ctx, &settings, &master_key).await?;
    lifecycle::seed_defaults(&ctx, &settings).await?;

    let settings = Arc::new(settings);
    let gateway = Arc::new(Gateway::new(ctx.clone()));
    let state = AppState {
        gateway,
        settings: settings.clone(),
    };

    // Background tasks: blacklist purge, metric rollup, snapshot autosave,
    // SIGHUP hot reload.
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    lifecycle::spawn_background(
        ctx.clone(),
        settings.clone(),
        master_key.clone(),
        &tracker,
        cancel.clone(),
    );
    lifecycle::spawn_reload_handler(ctx.clone(), cli.config.clone(), &tracker, cancel.clone());

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        %addr,
        workers = settings.server.threads,
        backend = ?settings.backend.mode,
        "doorman listening"
    );

    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(lifecycle::shutdown_signal())
    .await?;

    // Drain complete: stop background tasks and write the final snapshot.
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    lifecycle::write_snapshot(&ctx, &settings, &master_key).await?;
    info!("shutdown complete");

    Ok(())
}
