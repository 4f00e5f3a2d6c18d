//! syncstore server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use syncstore::config::Settings;
use syncstore::server::{self, AppState, InsecureAuthenticator};
use syncstore::storage::SyncStorage;

#[derive(Debug, Parser)]
#[command(name = "syncstore", about = "BSO sync storage server", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "syncstore.toml")]
    config: PathBuf,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut settings = Settings::load_or_default(&args.config)?;
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
    }
    let validation = settings.validate()?;
    for warning in &validation.warnings {
        tracing::warn!("{warning}");
    }

    let storage = SyncStorage::open(&settings)?;
    let state = AppState::new(storage, settings, Arc::new(InsecureAuthenticator));
    server::serve(state).await
}
