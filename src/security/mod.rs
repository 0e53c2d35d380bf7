//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted socket:
//!     → flood.rs (SYN window, per-IP connection cap)
//!     → request head read (proxy)
//!     → access_control.rs (whitelist, block list, ports)
//!     → auto_block.rs (live time-limited blocks)
//!     → rate_limit.rs (minute and hour windows)
//!     → admission.rs (verdict)
//! ```
//!
//! # Design Decisions
//! - Defense in depth: multiple layers of protection
//! - Fail closed: reject on any security check failure
//! - Rule state and counters are independent; only admission.rs composes them

pub mod access_control;
pub mod admission;
pub mod auto_block;
pub mod flood;
pub mod rate_limit;
pub mod window;

pub use admission::{AdmissionController, AllowReason, Rejection, Severity, Verdict};
pub use auto_block::AutoBlockEvent;
