//! Manifest Controller
//!
//! Reconciles Manifest CRDs: each installation is rendered, stale resources
//! are pruned, the rest is server-side applied to the target cluster and the
//! instance is reported Ready once every resource is.

mod backoff;
mod config;
mod controller;
mod error;
mod watcher;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    info!("Starting Manifest Controller");

    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Field owner: {}", config.field_owner);
    info!("  Strategy: {:?}", config.strategy);
    info!("  Ready check: {:?}", config.ready_check);
    info!("  Manifest root: {}", config.manifest_root.display());

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
