//! Connection forwarding.
//!
//! # Data Flow
//! ```text
//! Accepted socket (holding a global slot)
//!     → server.rs: flood precheck
//!     → header.rs: read request head, extract port
//!     → server.rs: admission verdict
//!     → dial upstream, replay captured bytes
//!     → relay.rs: two copy loops until both sides finish
//! ```
//!
//! # Design Decisions
//! - Bytes are forwarded verbatim; the head is read only to learn the port
//! - Forwarding failures close the connection and are never fatal

pub mod header;
pub mod relay;
pub mod server;

use std::io;

use thiserror::Error;

use crate::proxy::header::HeaderError;

pub use server::{ConnectionStage, ProxyServer};

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("upstream {addr} unreachable: {source}")]
    Upstream { addr: String, source: io::Error },

    #[error("failed to replay request to upstream: {0}")]
    Replay(#[source] io::Error),
}
