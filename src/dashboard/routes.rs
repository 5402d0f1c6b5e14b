//! Status API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`
//! and only ever written by the supervisor from pass reports.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::generator::{CommentaryGenerator, GenerationUsage};
use crate::types::{PassReport, Score, WorkerState};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Running totals across every pass of every match.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Totals {
    pub passes: u64,
    pub raw_events: u64,
    pub generation_calls: u64,
    pub published: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub errors: u64,
}

impl Totals {
    fn add(&mut self, report: &PassReport) {
        self.passes += 1;
        self.raw_events += report.raw_events as u64;
        self.generation_calls += report.generation_calls as u64;
        self.published += report.published as u64;
        self.duplicates += report.duplicates as u64;
        self.failed += report.failed as u64;
        self.rejected += report.rejected as u64;
        self.dropped += report.dropped as u64;
        self.errors += report.errors as u64;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchStatus {
    pub match_id: String,
    pub state: Option<WorkerState>,
    pub score: Score,
    pub passes: u64,
    pub published: u64,
    pub last_report: Option<PassReport>,
    pub updated_at: DateTime<Utc>,
}

impl MatchStatus {
    fn new(match_id: &str) -> Self {
        Self {
            match_id: match_id.to_string(),
            state: None,
            score: Score::default(),
            passes: 0,
            published: 0,
            last_report: None,
            updated_at: Utc::now(),
        }
    }
}

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub worker_name: String,
    pub start_time: DateTime<Utc>,
    pub matches: RwLock<BTreeMap<String, MatchStatus>>,
    pub evicted: RwLock<Vec<String>>,
    pub totals: RwLock<Totals>,
    generator: Option<Arc<CommentaryGenerator>>,
}

impl DashboardState {
    pub fn new(worker_name: &str) -> Self {
        Self {
            worker_name: worker_name.to_string(),
            start_time: Utc::now(),
            matches: RwLock::new(BTreeMap::new()),
            evicted: RwLock::new(Vec::new()),
            totals: RwLock::new(Totals::default()),
            generator: None,
        }
    }

    /// Report the shared generator's usage alongside the pass totals.
    pub fn with_generator(mut self, generator: Arc<CommentaryGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// A worker was started for `match_id`.
    pub async fn track(&self, match_id: &str) {
        self.matches
            .write()
            .await
            .entry(match_id.to_string())
            .or_insert_with(|| MatchStatus::new(match_id));
    }

    pub async fn record(&self, report: &PassReport) {
        self.totals.write().await.add(report);

        let mut matches = self.matches.write().await;
        let status = matches
            .entry(report.match_id.clone())
            .or_insert_with(|| MatchStatus::new(&report.match_id));
        status.state = report.state;
        status.score = report.score;
        status.passes += 1;
        status.published += report.published as u64;
        status.updated_at = report.finished_at.unwrap_or_else(Utc::now);
        status.last_report = Some(report.clone());
    }

    pub async fn evict(&self, match_id: &str) {
        self.matches.write().await.remove(match_id);
        self.evicted.write().await.push(match_id.to_string());
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub worker: String,
    pub uptime_secs: i64,
    pub tracked_matches: usize,
    pub live_matches: usize,
    pub evicted_matches: usize,
    pub totals: Totals,
    pub generation: Option<GenerationUsage>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let matches = state.matches.read().await;
    let live = matches
        .values()
        .filter(|m| m.state == Some(WorkerState::Live))
        .count();

    Json(StatusResponse {
        worker: state.worker_name.clone(),
        uptime_secs: (Utc::now() - state.start_time).num_seconds(),
        tracked_matches: matches.len(),
        live_matches: live,
        evicted_matches: state.evicted.read().await.len(),
        totals: state.totals.read().await.clone(),
        generation: state.generator.as_ref().map(|g| g.usage()),
    })
}

/// GET /api/matches
pub async fn get_matches(State(state): State<AppState>) -> Json<Vec<MatchStatus>> {
    let matches = state.matches.read().await;
    Json(matches.values().cloned().collect())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
