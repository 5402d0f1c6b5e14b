//! Source adapters.
//!
//! Each adapter translates one external source's polling model into
//! `RawEvent`s. Adapters report failures as `PipelineError`s, and
//! `poll_guarded` is the boundary where those failures (and timeouts)
//! are logged and turned into an empty result, so one failing source
//! never blocks the others in the same pass.

pub mod audio;
pub mod chat;
pub mod feed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{MatchContext, RawEvent, SourceKind, Team};

/// Abstraction over one polled event source for one match.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Upper bound for one `poll`. Enforced by `poll_guarded`.
    fn timeout(&self) -> Duration;

    /// Fetch whatever is new (or currently visible) for the match.
    async fn poll(&self, ctx: &MatchContext) -> PipelineResult<Vec<RawEvent>>;
}

/// Result of one guarded poll: events in source order, plus the error
/// that was swallowed, if any.
#[derive(Debug)]
pub struct PollOutcome {
    pub kind: SourceKind,
    pub events: Vec<RawEvent>,
    pub error: Option<PipelineError>,
}

/// Poll with the adapter's timeout. Never returns an error.
pub async fn poll_guarded(adapter: &dyn SourceAdapter, ctx: &MatchContext) -> PollOutcome {
    let kind = adapter.kind();
    let limit = adapter.timeout();

    let result = match tokio::time::timeout(limit, adapter.poll(ctx)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::unavailable(
            kind,
            format!("timed out after {}s", limit.as_secs_f32()),
        )),
    };

    match result {
        Ok(mut events) => {
            events.sort_by_key(|e| e.order);
            debug!(match_id = %ctx.match_id, source = %kind, count = events.len(), "Source polled");
            PollOutcome {
                kind,
                events,
                error: None,
            }
        }
        Err(e) => {
            warn!(
                match_id = %ctx.match_id,
                source = %kind,
                category = e.category(),
                error = %e,
                "Source poll failed, contributing no events"
            );
            PollOutcome {
                kind,
                events: Vec::new(),
                error: Some(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Match state source
// ---------------------------------------------------------------------------

/// One play from the structured feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPlay {
    /// Play id, `c{sequence}` for commentary lines, empty when the feed gave neither.
    pub id: String,
    pub index: usize,
    pub label: String,
    pub text: String,
    pub clock: Option<String>,
    pub team: Option<String>,
    pub players: Vec<String>,
    pub scoring: Option<bool>,
}

/// Point-in-time view of a match as reported by the feed.
#[derive(Debug, Clone)]
pub struct MatchSnapshot {
    pub match_id: String,
    /// Raw status string ("pre", "in", "post", ...).
    pub status: String,
    pub home: Team,
    pub away: Team,
    pub home_score: Option<u32>,
    pub away_score: Option<u32>,
    pub clock: Option<String>,
    pub kickoff: Option<DateTime<Utc>>,
    pub plays: Vec<FeedPlay>,
}

/// A match listed on the scoreboard, used for discovery.
#[derive(Debug, Clone)]
pub struct ScheduledMatch {
    pub match_id: String,
    pub status: String,
    pub kickoff: Option<DateTime<Utc>>,
    pub name: String,
}

/// The consumed "match state" service.
#[async_trait]
pub trait MatchStateSource: Send + Sync {
    async fn snapshot(&self, match_id: &str) -> PipelineResult<MatchSnapshot>;

    async fn schedule(&self) -> PipelineResult<Vec<ScheduledMatch>>;
}
