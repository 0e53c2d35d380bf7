//! Gatekeeper
//!
//! An L4 firewall in front of a reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────┐
//!                        │                  GATEKEEPER                  │
//!                        │                                              │
//!   Client connection    │  ┌──────────┐   ┌───────────┐   ┌─────────┐  │
//!   ─────────────────────┼─▶│   net    │──▶│ admission │──▶│  proxy  │──┼──▶ Upstream
//!                        │  │ listener │   │ (flood,   │   │ header  │  │
//!                        │  └──────────┘   │  rules,   │   │ + relay │  │
//!                        │                 │  rates)   │   └─────────┘  │
//!                        │                 └─────┬─────┘                │
//!                        │                       │                      │
//!                        │  ┌────────────┐  ┌────▼──────┐  ┌──────────┐  │
//!                        │  │   config   │◀─│ persister │  │lifecycle │  │
//!                        │  │ rules.json │  └───────────┘  │ signals  │  │
//!                        │  └────────────┘                 └──────────┘  │
//!                        └──────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;

use gatekeeper::config::schema::ObservabilityConfig;
use gatekeeper::config::{ConfigError, GatekeeperConfig};
use gatekeeper::lifecycle::signals::wait_for_signal;
use gatekeeper::observability::{logging, metrics};
use gatekeeper::Gatekeeper;

#[tokio::main]
async fn main() {
    let config = match GatekeeperConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            logging::init(&ObservabilityConfig::default());
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    let log_guard = logging::init(&config.observability);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gatekeeper starting");

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Gatekeeper failed");
        // exit skips destructors; flush the file writer first.
        drop(log_guard);
        std::process::exit(1);
    }
}

async fn run(config: GatekeeperConfig) -> gatekeeper::Result<()> {
    if let Some(addr) = &config.observability.metrics_address {
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                var: "METRICS_ADDRESS",
                reason: format!("{}: {}", addr, e),
            })?;
        metrics::init_metrics(addr)?;
    }

    let gatekeeper = Gatekeeper::build(config).await?;

    let shutdown = gatekeeper.shutdown_handle();
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        tracing::info!(signal, "Shutdown signal received");
        shutdown.trigger();
    });

    gatekeeper.run().await
}
