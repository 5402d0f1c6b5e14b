//! Persistence layer.
//!
//! Keeps the dedup keys this worker has delivered, per match, in a JSON
//! ledger file so a restart does not re-submit events the store already
//! has. The commentary store itself stays the system of record.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Default ledger file path.
pub const DEFAULT_LEDGER_FILE: &str = "touchline_ledger.json";

/// Published dedup keys by match id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub matches: BTreeMap<String, BTreeSet<String>>,
}

impl Ledger {
    pub fn key_count(&self) -> usize {
        self.matches.values().map(BTreeSet::len).sum()
    }
}

/// Save the ledger to a JSON file. Writes a sibling temp file and renames
/// it over the target so a crash never leaves a truncated ledger.
pub fn save_ledger(ledger: &Ledger, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_LEDGER_FILE);
    let json = serde_json::to_string_pretty(ledger).context("Failed to serialise ledger")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).context(format!("Failed to write ledger to {tmp}"))?;
    std::fs::rename(&tmp, path).context(format!("Failed to move ledger into {path}"))?;

    debug!(path, matches = ledger.matches.len(), keys = ledger.key_count(), "Ledger saved");
    Ok(())
}

/// Load the ledger from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_ledger(path: Option<&str>) -> Result<Option<Ledger>> {
    let path = path.unwrap_or(DEFAULT_LEDGER_FILE);

    if !Path::new(path).exists() {
        info!(path, "No ledger found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).context(format!("Failed to read ledger from {path}"))?;
    let ledger: Ledger =
        serde_json::from_str(&json).context(format!("Failed to parse ledger from {path}"))?;

    info!(
        path,
        matches = ledger.matches.len(),
        keys = ledger.key_count(),
        "Ledger loaded from disk"
    );
    Ok(Some(ledger))
}

/// Delete the ledger file (for testing or reset).
pub fn delete_ledger(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_LEDGER_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete ledger file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// The ledger file plus its in-memory copy, shared by all match workers.
/// Each worker only touches its own match's entry.
pub struct LedgerStore {
    path: PathBuf,
    ledger: Mutex<Ledger>,
}

impl LedgerStore {
    pub fn open(path: &str) -> Result<Self> {
        let ledger = load_ledger(Some(path))?.unwrap_or_default();
        Ok(Self {
            path: PathBuf::from(path),
            ledger: Mutex::new(ledger),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn path_str(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    pub fn keys_for(&self, match_id: &str) -> Vec<String> {
        self.lock()
            .matches
            .get(match_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Add delivered keys and persist.
    pub fn record(&self, match_id: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut ledger = self.lock();
        ledger
            .matches
            .entry(match_id.to_string())
            .or_default()
            .extend(keys.iter().cloned());
        save_ledger(&ledger, Some(&self.path_str()))
    }

    /// Drop a match's keys once it has been evicted.
    pub fn forget(&self, match_id: &str) -> Result<()> {
        let mut ledger = self.lock();
        if ledger.matches.remove(match_id).is_some() {
            save_ledger(&ledger, Some(&self.path_str()))?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Ledger {
        self.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
