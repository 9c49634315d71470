//! msb-hub service binary
//!
//! Long-running service that ingests plays from many sources and forwards
//! them to many scrobble clients.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use msb_common::events::EventBus;
use msb_common::time::system_clock;
use msb_hub::creds::CredentialsStore;
use msb_hub::server::{self, AppState};
use msb_hub::supervisor::Supervisor;

/// msb - multi-source, multi-client scrobble bus
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration directory (overrides the CONFIG_DIR environment
    /// variable)
    #[arg(short, long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Port to bind to (overrides the PORT environment variable and the
    /// config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            // LOG_LEVEL is the documented knob; RUST_LOG still wins when set
            std::env::var("LOG_LEVEL")
                .map(|level| tracing_subscriber::EnvFilter::new(level))
                .map_err(|_| ())
        })
        .unwrap_or_else(|_| {
            format!("msb_hub={0},msb_common={0}", default_level).into()
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    info!("msb-hub starting...");

    // Resolve config dir and load configuration
    let config_dir = msb_common::config::resolve_config_dir(args.config_dir.as_deref());
    std::fs::create_dir_all(&config_dir)?;
    info!("Config dir: {}", config_dir.display());

    let config = msb_common::config::load(&config_dir)?;
    let port = msb_common::config::resolve_port(args.port, &config);

    // Wire up the bus and every configured component
    let bus = EventBus::new(1024);
    let clock = system_clock();
    let supervisor = Arc::new(Supervisor::from_config(&config, bus, clock.clone())?);
    supervisor.start().await;

    let state = Arc::new(AppState {
        supervisor: supervisor.clone(),
        creds: Arc::new(CredentialsStore::new(&config_dir)),
        clock,
    });

    let bind_addr = format!("0.0.0.0:{}", port);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    };
    server::start(&bind_addr, state, shutdown).await?;

    // Server returned: cooperative stop for every worker
    supervisor.shutdown().await;
    info!("msb-hub stopped");
    Ok(())
}
