//! Gatekeeper: an L4 firewall and reverse-proxy front door.
//!
//! Admits or drops TCP connections by IP and requested port, rate limits
//! per IP, auto-blocks abusive clients and forwards admitted traffic to a
//! single upstream without rewriting it.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod resilience;
pub mod security;

pub use config::schema::GatekeeperConfig;
pub use error::{GatekeeperError, Result};
pub use lifecycle::startup::Gatekeeper;
pub use lifecycle::Shutdown;
