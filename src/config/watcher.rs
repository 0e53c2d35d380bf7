//! Hot-reloaded rule store.
//!
//! The rules file is polled (see `lifecycle::startup`) and compared by
//! fingerprint. Readers load the current [`RuleSnapshot`] without locking;
//! reloads and writes are serialised by one writer mutex.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;

use crate::config::loader::{self, Fingerprint, RulesError};
use crate::config::schema::RuleSet;
use crate::config::validation::normalize_rules;
use crate::observability::logging::LogThrottle;
use crate::observability::metrics;
use crate::security::access_control::ParsedRules;

/// One published version of the rules.
#[derive(Debug)]
pub struct RuleSnapshot {
    pub version: u64,
    pub rules: RuleSet,
    pub parsed: ParsedRules,
}

impl RuleSnapshot {
    fn new(version: u64, rules: RuleSet) -> Self {
        let parsed = ParsedRules::from_rules(&rules);
        Self {
            version,
            rules,
            parsed,
        }
    }
}

/// Result of a reload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// File fingerprint matches the last successful load.
    Unchanged,
    /// A new snapshot was published.
    Reloaded,
    /// No file has ever been loaded; built-in defaults are in effect.
    Defaulted,
    /// The file is missing or unreadable; the previous rules stay in effect.
    Retained,
}

impl ReloadOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Reloaded => "reloaded",
            Self::Defaulted => "defaulted",
            Self::Retained => "retained",
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    fingerprint: Option<Fingerprint>,
    loaded: bool,
    missing: bool,
}

pub struct RuleStore {
    path: PathBuf,
    current: ArcSwap<RuleSnapshot>,
    writer: Mutex<WriterState>,
    throttle: LogThrottle,
}

impl RuleStore {
    /// Open the store and perform the initial load. Never fails: a missing
    /// or broken file leaves the defaults in effect.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: path.into(),
            current: ArcSwap::from_pointee(RuleSnapshot::new(0, RuleSet::default())),
            writer: Mutex::new(WriterState::default()),
            throttle: LogThrottle::per_minute(),
        };
        store.reload();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.load_full()
    }

    /// Re-read the file if it changed since the last successful load.
    pub fn reload(&self) -> ReloadOutcome {
        let mut state = self.lock_writer();
        let outcome = match self.reload_locked(&mut state) {
            Ok(outcome) => outcome,
            Err(e) => {
                if self.throttle.should_log(error_key(&e)) {
                    tracing::warn!(error = %e, "Keeping previous rules");
                }
                ReloadOutcome::Retained
            }
        };
        if outcome != ReloadOutcome::Unchanged {
            metrics::record_rule_reload(outcome.as_str());
        }
        outcome
    }

    /// Replace the rules and write them to disk.
    pub fn persist(&self, mut rules: RuleSet) -> Result<(), RulesError> {
        let mut state = self.lock_writer();
        normalize_rules(&mut rules);
        self.write_locked(&mut state, rules)
    }

    /// Read-modify-write. The file is re-read first so a newer operator edit
    /// is never overwritten. `f` returns whether it changed anything; nothing
    /// is written when it did not.
    pub fn update<F>(&self, f: F) -> Result<bool, RulesError>
    where
        F: FnOnce(&mut RuleSet) -> bool,
    {
        let mut state = self.lock_writer();
        match self.reload_locked(&mut state) {
            Ok(_) => {}
            Err(RulesError::Parse { path, .. }) => return Err(RulesError::Corrupt { path }),
            Err(e) => return Err(e),
        }

        let mut rules = self.current.load().rules.clone();
        if !f(&mut rules) {
            return Ok(false);
        }
        normalize_rules(&mut rules);
        self.write_locked(&mut state, rules)?;
        Ok(true)
    }

    fn reload_locked(&self, state: &mut WriterState) -> Result<ReloadOutcome, RulesError> {
        let Some(fingerprint) = loader::fingerprint(&self.path)? else {
            return Ok(self.handle_missing(state));
        };
        if state.fingerprint == Some(fingerprint) {
            return Ok(ReloadOutcome::Unchanged);
        }

        let Some(loaded) = loader::load_rules(&self.path)? else {
            return Ok(self.handle_missing(state));
        };

        for backfill in &loaded.backfilled {
            tracing::warn!(field = backfill.field, reason = %backfill.reason, "Rule field backfilled with default");
        }

        state.fingerprint = Some(loaded.fingerprint);
        state.loaded = true;
        state.missing = false;
        self.throttle.reset("missing");
        self.publish(loaded.rules);
        Ok(ReloadOutcome::Reloaded)
    }

    fn handle_missing(&self, state: &mut WriterState) -> ReloadOutcome {
        let first = !state.missing;
        state.missing = true;
        state.fingerprint = None;

        if !state.loaded {
            if first {
                tracing::warn!(
                    path = %self.path.display(),
                    "Rules file not found; using built-in defaults (file will not be created)"
                );
                return ReloadOutcome::Defaulted;
            }
            return ReloadOutcome::Unchanged;
        }

        if self.throttle.should_log("missing") {
            tracing::warn!(path = %self.path.display(), "Rules file disappeared; keeping previous rules");
        }
        if first {
            ReloadOutcome::Retained
        } else {
            ReloadOutcome::Unchanged
        }
    }

    fn write_locked(&self, state: &mut WriterState, rules: RuleSet) -> Result<(), RulesError> {
        let fingerprint = loader::save_rules(&self.path, &rules)?;
        state.fingerprint = Some(fingerprint);
        state.loaded = true;
        state.missing = false;
        self.publish(rules);
        Ok(())
    }

    fn publish(&self, rules: RuleSet) {
        let version = self.current.load().version + 1;
        let snapshot = RuleSnapshot::new(version, rules);

        if !snapshot.parsed.invalid.is_empty() {
            tracing::warn!(entries = ?snapshot.parsed.invalid, "Ignoring unparseable IP entries");
        }
        tracing::info!(
            version,
            blocked = snapshot.parsed.blocked_count(),
            auto_blocked = snapshot.rules.auto_block_expiry.len(),
            whitelisted = snapshot.parsed.whitelist_count(),
            ports = ?snapshot.rules.allowed_ports,
            per_minute = snapshot.rules.max_attempts_per_minute,
            per_hour = snapshot.rules.max_attempts_per_hour,
            auto_block = snapshot.rules.auto_block_enabled,
            "Rules loaded"
        );

        self.current.store(Arc::new(snapshot));
    }

    fn lock_writer(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn error_key(error: &RulesError) -> &'static str {
    match error {
        RulesError::Io { .. } => "io",
        RulesError::Parse { .. } => "parse",
        RulesError::Serialize(_) => "serialize",
        RulesError::Corrupt { .. } => "corrupt",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn missing_file_uses_defaults_without_creating_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let store = RuleStore::open(&path);
        assert_eq!(store.snapshot().rules, RuleSet::default());
        assert!(!path.exists());
        assert_eq!(store.reload(), ReloadOutcome::Unchanged);
        assert!(!path.exists());
    }

    #[test]
    fn reload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, r#"{"blocked_ips": ["10.0.0.1"]}"#).unwrap();

        let store = RuleStore::open(&path);
        let first = store.snapshot();
        assert_eq!(store.reload(), ReloadOutcome::Unchanged);
        assert_eq!(store.reload(), ReloadOutcome::Unchanged);

        let second = store.snapshot();
        assert_eq!(first.version, second.version);
        assert_eq!(first.rules, second.rules);
    }

    #[test]
    fn malformed_file_keeps_previous_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, r#"{"blocked_ips": ["10.0.0.1"], "allowed_ports": [80]}"#).unwrap();

        let store = RuleStore::open(&path);
        assert!(store.snapshot().parsed.is_blocked(ip("10.0.0.1")));

        fs::write(&path, "{ \"blocked_ips\": [").unwrap();
        assert_eq!(store.reload(), ReloadOutcome::Retained);

        let snapshot = store.snapshot();
        assert!(snapshot.parsed.is_blocked(ip("10.0.0.1")));
        assert_eq!(snapshot.rules.allowed_ports, vec![80]);
    }

    #[test]
    fn update_refuses_to_overwrite_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, "garbage").unwrap();

        let store = RuleStore::open(&path);
        let err = store.update(|rules| rules.block("10.0.0.1")).unwrap_err();
        assert!(matches!(err, RulesError::Corrupt { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "garbage");
    }

    #[test]
    fn update_creates_file_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let store = RuleStore::open(&path);
        let before = store.snapshot().version;
        assert!(store.update(|rules| rules.block("198.51.100.4")).unwrap());
        assert!(path.exists());

        let snapshot = store.snapshot();
        assert!(snapshot.version > before);
        assert!(snapshot.parsed.is_blocked(ip("198.51.100.4")));

        // Our own write does not trigger another reload.
        assert_eq!(store.reload(), ReloadOutcome::Unchanged);
        assert!(!store.update(|rules| rules.block("198.51.100.4")).unwrap());
    }

    #[test]
    fn round_trip_gives_identical_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let mut rules = RuleSet::default();
        rules.block("203.0.113.0/24");
        rules.block("10.1.1.1");
        rules.whitelist.push("192.168.1.10".into());
        rules.allowed_ports = vec![80, 443, 8080];

        let writer = RuleStore::open(&path);
        writer.persist(rules).unwrap();
        let reader = RuleStore::open(&path);

        let a = writer.snapshot();
        let b = reader.snapshot();
        assert_eq!(a.rules, b.rules);
        for addr in ["203.0.113.9", "10.1.1.1", "10.1.1.2", "192.168.1.10", "::1"] {
            let addr = ip(addr);
            assert_eq!(a.parsed.is_blocked(addr), b.parsed.is_blocked(addr));
            assert_eq!(a.parsed.is_whitelisted(addr), b.parsed.is_whitelisted(addr));
        }
        for port in [22, 80, 443, 8080, 9000] {
            assert_eq!(a.parsed.is_port_allowed(port), b.parsed.is_port_allowed(port));
        }
    }
}
