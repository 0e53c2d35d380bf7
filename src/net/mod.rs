//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, global connection cap)
//!     → connection.rs (lifecycle tracking for graceful shutdown)
//!     → Hand off to the proxy layer
//! ```
//!
//! # Design Decisions
//! - Over-capacity connections are dropped, not queued
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;
