//! Startup error types.
//!
//! Everything here is fatal: the process logs it and exits. Runtime failures
//! (rule parse errors, dial failures, relay errors) have their own types and
//! never reach this enum.

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum GatekeeperError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to install metrics exporter: {0}")]
    Metrics(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatekeeperError>;
