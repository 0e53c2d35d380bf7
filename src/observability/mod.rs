//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, security target)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Security events go to their own target so they can be filtered separately
//! - Repeated warnings are throttled per key
//! - Metrics are cheap (atomic increments) and safe to record with no exporter

pub mod logging;
pub mod metrics;
