//! Rules file loading and persistence.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

use crate::config::schema::RuleSet;
use crate::config::validation::{normalize_rules, Backfill};

#[derive(Error, Debug)]
pub enum RulesError {
    #[error("failed to access rules file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to parse rules file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize rules: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("refusing to overwrite unparseable rules file {path}")]
    Corrupt { path: PathBuf },
}

/// Cheap change detector for the rules file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

/// A successfully parsed and normalised rules file.
#[derive(Debug)]
pub struct LoadedRules {
    pub rules: RuleSet,
    pub fingerprint: Fingerprint,
    pub backfilled: Vec<Backfill>,
}

/// Stat the rules file. `Ok(None)` when it does not exist.
pub fn fingerprint(path: &Path) -> Result<Option<Fingerprint>, RulesError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(Fingerprint {
            modified: meta.modified().ok(),
            len: meta.len(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RulesError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Read, parse and normalise the rules file. `Ok(None)` when it does not exist.
pub fn load_rules(path: &Path) -> Result<Option<LoadedRules>, RulesError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RulesError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut rules: RuleSet = serde_json::from_str(&content).map_err(|source| RulesError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let backfilled = normalize_rules(&mut rules);

    // Stat after reading: a write racing the read shows up as a changed
    // fingerprint on the next poll.
    let fingerprint = fingerprint(path)?.unwrap_or(Fingerprint {
        modified: None,
        len: content.len() as u64,
    });

    Ok(Some(LoadedRules {
        rules,
        fingerprint,
        backfilled,
    }))
}

/// Write `rules` as pretty JSON via a sibling temp file and rename.
pub fn save_rules(path: &Path, rules: &RuleSet) -> Result<Fingerprint, RulesError> {
    let io_err = |source| RulesError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut body = serde_json::to_vec_pretty(rules).map_err(RulesError::Serialize)?;
    body.push(b'\n');

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp = temp_path(path);
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(&body).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(io_err)?;

    fingerprint(path)?.ok_or_else(|| RulesError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::NotFound, "rules file vanished after write"),
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "rules.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}
