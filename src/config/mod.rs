//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! environment / .env
//!     → env.rs (parse)
//!     → validation.rs (semantic checks)
//!     → GatekeeperConfig (immutable for the process lifetime)
//!
//! rules.json (operator-edited, hot-reloaded)
//!     → loader.rs (read & deserialize)
//!     → validation.rs (backfill defaults)
//!     → watcher.rs (RuleStore: atomic swap of Arc<RuleSnapshot>)
//!     → admission checks observe the new snapshot on their next load
//! ```
//!
//! # Design Decisions
//! - A bad rules file never takes the gatekeeper down; the last good rules stay
//! - All rule fields have defaults so a partial file is valid
//! - Validation separates syntactic (serde) from semantic checks

pub mod env;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use env::ConfigError;
pub use loader::RulesError;
pub use schema::{GatekeeperConfig, RuleSet};
pub use watcher::{ReloadOutcome, RuleSnapshot, RuleStore};
