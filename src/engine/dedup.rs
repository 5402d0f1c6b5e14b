//! Deduplicator: stable identity keys and the per-match seen-set.
//!
//! Keys are derived from source-native identifiers whenever the source
//! has them, so the same underlying observation maps to the same key
//! across retries and process restarts. Audio-extracted events have no
//! such identifier; their key is a content heuristic (minute, type and a
//! normalized text prefix) which can miss the same action described
//! differently in adjacent chunks.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use uuid::Uuid;

use crate::types::{EventType, SourceKind};

/// Hex characters kept from the digest.
const KEY_HEX_LEN: usize = 24;

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(KEY_HEX_LEN);
    hex
}

/// Key from `(matchId, sourceId, sourceSequence)`.
pub fn source_key(match_id: &str, source: SourceKind, sequence: &str) -> String {
    format!(
        "{}:{}",
        source.as_str(),
        digest(&[match_id, source.as_str(), sequence.trim()])
    )
}

/// Key for synthetic lifecycle events ("prematch", "kickoff").
pub fn lifecycle_key(match_id: &str, name: &str) -> String {
    source_key(match_id, SourceKind::Lifecycle, name)
}

/// Heuristic key from `(matchId, minuteLabel, type, normalizedTextPrefix)`.
pub fn content_key(
    match_id: &str,
    minute_label: &str,
    event_type: EventType,
    text: &str,
    prefix_chars: usize,
) -> String {
    let prefix: String = normalize_text(text).chars().take(prefix_chars).collect();
    format!(
        "heur:{}",
        digest(&[match_id, minute_label.trim(), event_type.wire_name(), &prefix])
    )
}

/// Lowercase, alphanumerics only, single-spaced.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pipeline-assigned event id, stable for a given `(matchId, dedupKey)`.
pub fn event_id(match_id: &str, dedup_key: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("touchline/{match_id}/{dedup_key}").as_bytes(),
    )
}

/// Seen-set for one match. Owned by that match's worker only.
#[derive(Debug, Default)]
pub struct Deduplicator {
    match_id: String,
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn new(match_id: &str) -> Self {
        Self {
            match_id: match_id.to_string(),
            seen: HashSet::new(),
        }
    }

    /// Seed from keys published before a restart.
    pub fn with_keys(match_id: &str, keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            match_id: match_id.to_string(),
            seen: keys.into_iter().collect(),
        }
    }

    /// Claim a key. True only the first time the key is offered.
    pub fn is_new(&mut self, dedup_key: &str) -> bool {
        self.seen.insert(dedup_key.to_string())
    }

    /// Non-claiming check, used to skip generation for known events.
    pub fn contains(&self, dedup_key: &str) -> bool {
        self.seen.contains(dedup_key)
    }

    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
