//! Match lifecycle tracker.
//!
//! Maps the feed's raw status string to a `Phase`, enforces forward-only
//! transitions and decides which source adapters run in each phase.
//! Once Finished is observed it is reported permanently, even if the
//! feed flaps back to "in".

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use tracing::{info, warn};

use crate::types::{Phase, SourceKind, WorkerState};

/// Map a raw feed status to a phase. `None` for unknown values.
pub fn phase_from_status(status: &str) -> Option<Phase> {
    match status.trim().to_ascii_lowercase().as_str() {
        "pre" | "scheduled" | "status_scheduled" | "not_started" | "ns" => Some(Phase::Scheduled),
        "in" | "live" | "status_in_progress" | "status_halftime" | "halftime" | "1h" | "2h"
        | "ht" => Some(Phase::Live),
        "post" | "final" | "completed" | "status_full_time" | "status_final" | "ft" => {
            Some(Phase::Finished)
        }
        _ => None,
    }
}

/// A phase change worth acting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Option<Phase>,
    pub to: Phase,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.from {
            Some(from) => write!(f, "{from} -> {}", self.to),
            None => write!(f, "IDLE -> {}", self.to),
        }
    }
}

/// Tunables for adapter activation around the final whistle.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleWindows {
    /// Adapters keep running this long after Finished.
    pub drain: Duration,
    /// State is evicted this long after Finished.
    pub retention: Duration,
}

impl Default for LifecycleWindows {
    fn default() -> Self {
        Self {
            drain: Duration::minutes(5),
            retention: Duration::hours(1),
        }
    }
}

/// Per-match phase tracker. Owned by that match's worker.
#[derive(Debug)]
pub struct LifecycleTracker {
    match_id: String,
    phase: Option<Phase>,
    finished_at: Option<DateTime<Utc>>,
    windows: LifecycleWindows,
}

impl LifecycleTracker {
    pub fn new(match_id: &str, windows: LifecycleWindows) -> Self {
        Self {
            match_id: match_id.to_string(),
            phase: None,
            finished_at: None,
            windows,
        }
    }

    /// Current phase; `None` until a known status has been observed.
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    /// Feed one status observation. Returns the transition, if any.
    pub fn observe(&mut self, status: &str, now: DateTime<Utc>) -> Option<Transition> {
        let Some(observed) = phase_from_status(status) else {
            warn!(
                match_id = %self.match_id,
                status,
                phase = ?self.phase,
                "Unknown match status, keeping previous phase"
            );
            return None;
        };

        let next = match self.phase {
            Some(current) if observed < current => {
                warn!(
                    match_id = %self.match_id,
                    status,
                    current = %current,
                    "Ignoring phase regression"
                );
                current
            }
            _ => observed,
        };

        if Some(next) == self.phase {
            return None;
        }

        let transition = Transition {
            from: self.phase,
            to: next,
        };
        self.phase = Some(next);
        if next == Phase::Finished {
            self.finished_at = Some(now);
        }
        info!(match_id = %self.match_id, transition = %transition, "Phase transition");
        Some(transition)
    }

    /// Orchestration state, including drain and eviction after Finished.
    pub fn state(&self, now: DateTime<Utc>) -> WorkerState {
        match (self.phase, self.finished_at) {
            (None, _) => WorkerState::Idle,
            (Some(Phase::Scheduled), _) => WorkerState::Scheduled,
            (Some(Phase::Live), _) => WorkerState::Live,
            (Some(Phase::Finished), Some(at)) if now - at >= self.windows.retention => {
                WorkerState::Evicted
            }
            (Some(Phase::Finished), _) => WorkerState::Finished,
        }
    }

    /// Which adapters should run right now.
    pub fn active_sources(&self, now: DateTime<Utc>) -> Vec<SourceKind> {
        const LIVE: [SourceKind; 3] = [SourceKind::Feed, SourceKind::Chat, SourceKind::Audio];
        match self.phase {
            None => Vec::new(),
            Some(Phase::Scheduled) => vec![SourceKind::Feed],
            Some(Phase::Live) => LIVE.to_vec(),
            Some(Phase::Finished) => match self.finished_at {
                Some(at) if now - at < self.windows.drain => LIVE.to_vec(),
                _ => Vec::new(),
            },
        }
    }

    pub fn is_evictable(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == WorkerState::Evicted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
