#![forbid(unsafe_code)]

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tsrelay::config::Config;
use tsrelay::relay::Service;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Relays line protocol and Prometheus remote writes to a set of backends"
)]
struct Cli {
    /// Configuration file to use
    #[arg(short, long)]
    config: PathBuf,

    /// Log HTTP requests
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime")
        .block_on(async_main(cli));
}

async fn async_main(cli: Cli) {
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    };

    let service = match Service::new(&config, cli.verbose) {
        Ok(service) => Arc::new(service),
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    };

    let stopper = Arc::clone(&service);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install shutdown CTRL+C signal handler");
        stopper.stop();
    });

    info!("starting relays...");
    service.run().await;
}
