use crate::config::Config;
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

pub mod http;
pub mod udp;

/// An HTTP or UDP listening endpoint.
#[async_trait]
pub trait Relay: Send + Sync {
    fn name(&self) -> String;
    async fn run(&self) -> Result<()>;
    fn stop(&self);
}

/// All the relays of one process, built from the configuration file.
pub struct Service {
    relays: Vec<Arc<dyn Relay>>,
}

impl Service {
    pub fn new(config: &Config, verbose: bool) -> Result<Service> {
        let filters = crate::config::compile_filters(&config.filters)?;

        let mut relays: Vec<Arc<dyn Relay>> = Vec::new();
        let mut names = HashSet::new();

        for cfg in &config.http_relays {
            let relay = http::HttpRelay::new(cfg, verbose, &filters)?;
            if !names.insert(relay.name()) {
                bail!("duplicate relay: {:?}", relay.name());
            }
            relays.push(relay);
        }

        for cfg in &config.udp_relays {
            let relay = Arc::new(udp::UdpRelay::new(cfg)?);
            if !names.insert(relay.name()) {
                bail!("duplicate relay: {:?}", relay.name());
            }
            relays.push(relay);
        }

        Ok(Service { relays })
    }

    /// Runs every relay until all of them stopped. A relay failing to bind
    /// does not take the others down.
    pub async fn run(&self) {
        join_all(self.relays.iter().map(|relay| async move {
            if let Err(err) = relay.run().await {
                error!(relay = %relay.name(), error = %err, "error running relay");
            }
        }))
        .await;
    }

    pub fn stop(&self) {
        for relay in &self.relays {
            info!(relay = %relay.name(), "stopping relay");
            relay.stop();
        }
    }
}
