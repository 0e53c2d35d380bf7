//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Every blocking network operation:
//!     → timeouts.rs (deadline per call, benign disconnect classification)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Client or upstream hanging up is normal teardown, not an error

pub mod timeouts;
