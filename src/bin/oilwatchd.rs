//! oilwatchd - live detection feed daemon
//!
//! Loads `FeedConfig`, creates the feed service and serves the control API on
//! loopback until Ctrl-C. Models and cameras are selected over the API.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use oilwatch::api::{ApiConfig, ApiServer};
use oilwatch::{FeedConfig, FeedService};

#[derive(Parser, Debug)]
#[command(name = "oilwatchd", version, about = "Live object-detection feed daemon")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "OILWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the API listen address.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = FeedConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }
    log::info!(
        "oilwatchd {} starting (backend: {:?}, models: {})",
        env!("CARGO_PKG_VERSION"),
        config.models.backend,
        config.models.dir.display()
    );

    let service = Arc::new(FeedService::new(&config));
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, Arc::clone(&service)).spawn()?;
    log::info!("control api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("oilwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    service.shutdown();
    Ok(())
}
