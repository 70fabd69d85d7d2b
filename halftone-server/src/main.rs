mod blur;
mod cache;
mod codec;
mod config;
mod dither;
mod error;
mod http;
mod pipeline;
mod processor;
mod resample;
mod scheduler;
mod sources;
mod tone;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os("HALFTONE_CONFIG").map(PathBuf::from);
    // Load config first so we can honor logging.filter directive.
    let shared = config::ConfigManager::load(config_path).await?;
    let cfg_snapshot = config::ConfigManager::to_struct(&shared)
        .await
        .context("reading typed config")?;
    let filter_directive = cfg_snapshot
        .logging
        .as_ref()
        .and_then(|l| l.filter.clone())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info,halftone_server=debug".to_string());
    fmt()
        .with_env_filter(EnvFilter::new(filter_directive))
        .init();

    let processor = Arc::new(processor::Processor::from_config(&cfg_snapshot));
    let bind = cfg_snapshot.server.as_ref().and_then(|s| s.bind_address.clone());
    let state = http::AppState {
        cfg: shared,
        processor,
    };
    let app = http::router(state);
    http::serve(app, bind).await?;
    Ok(())
}
