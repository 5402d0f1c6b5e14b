//! Structured sports-data feed (ESPN site API).
//!
//! `EspnClient` is the match state source: `/summary?event=<id>` gives
//! status, clock, score, rosters, key plays and the running commentary;
//! `/scoreboard` lists the competition's matches for discovery.
//! `FeedAdapter` turns both into `RawEvent`s with the play id (or the
//! commentary sequence) as source sequence. Plays carrying neither get an
//! empty sequence and are keyed on their content downstream.
//!
//! The feed is eventually consistent and occasionally malformed; every
//! field is optional on the wire and parsed defensively.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{FeedPlay, MatchSnapshot, MatchStateSource, ScheduledMatch, SourceAdapter};
use crate::engine::normalizer::first_integer;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{team_key, MatchContext, RawEvent, SourceKind, Team};

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct SummaryResponse {
    #[serde(default)]
    header: Option<Header>,
    #[serde(default, rename = "keyEvents")]
    key_events: Vec<KeyEvent>,
    #[serde(default)]
    commentary: Vec<CommentaryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct Header {
    #[serde(default)]
    competitions: Vec<Competition>,
    #[serde(default)]
    status: Option<Status>,
}

#[derive(Debug, Deserialize, Default)]
struct Competition {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    status: Option<Status>,
    #[serde(default)]
    competitors: Vec<Competitor>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct Status {
    #[serde(default, rename = "displayClock")]
    display_clock: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<StatusType>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct StatusType {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Competitor {
    #[serde(default, rename = "homeAway")]
    home_away: Option<String>,
    #[serde(default)]
    score: Option<Value>,
    #[serde(default)]
    team: Option<TeamRef>,
}

#[derive(Debug, Deserialize, Default)]
struct TeamRef {
    #[serde(default, rename = "displayName")]
    display_name: Option<String>,
    #[serde(default)]
    abbreviation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct KeyEvent {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<TextField>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    clock: Option<ClockField>,
    #[serde(default)]
    team: Option<TeamRef>,
    #[serde(default)]
    participants: Vec<Participant>,
    #[serde(default, rename = "scoringPlay")]
    scoring_play: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CommentaryItem {
    #[serde(default)]
    sequence: Option<Value>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    time: Option<ClockField>,
    #[serde(default)]
    play: Option<CommentaryPlay>,
}

#[derive(Debug, Deserialize, Default)]
struct CommentaryPlay {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<TextField>,
    #[serde(default)]
    team: Option<TeamRef>,
    #[serde(default)]
    participants: Vec<Participant>,
    #[serde(default, rename = "scoringPlay")]
    scoring_play: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TextField {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ClockField {
    #[serde(default, rename = "displayValue")]
    display_value: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Participant {
    #[serde(default)]
    athlete: Option<Athlete>,
}

#[derive(Debug, Deserialize, Default)]
struct Athlete {
    #[serde(default, rename = "displayName")]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ScoreboardResponse {
    #[serde(default)]
    events: Vec<ScoreboardEvent>,
}

#[derive(Debug, Deserialize, Default)]
struct ScoreboardEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<Status>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_kickoff(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%MZ")
                .ok()
                .map(|n| n.and_utc())
        })
}

fn parse_score(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => first_integer(s),
        _ => None,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn athletes(participants: Vec<Participant>) -> Vec<String> {
    participants
        .into_iter()
        .filter_map(|p| p.athlete.and_then(|a| a.display_name))
        .collect()
}

/// Parse a `/summary` body into a snapshot.
pub fn parse_summary(match_id: &str, body: &str) -> PipelineResult<MatchSnapshot> {
    let summary: SummaryResponse = serde_json::from_str(body)
        .map_err(|e| PipelineError::MalformedData(format!("feed summary for {match_id}: {e}")))?;

    let header = summary
        .header
        .ok_or_else(|| PipelineError::MalformedData(format!("feed summary for {match_id} has no header")))?;
    let competition = header.competitions.into_iter().next().unwrap_or_default();
    let status = competition.status.or(header.status).unwrap_or_default();

    let mut snapshot = MatchSnapshot {
        match_id: match_id.to_string(),
        status: status
            .kind
            .and_then(|k| k.state)
            .unwrap_or_default(),
        home: Team::default(),
        away: Team::default(),
        home_score: None,
        away_score: None,
        clock: status.display_clock.filter(|c| !c.trim().is_empty()),
        kickoff: competition.date.as_deref().and_then(parse_kickoff),
        plays: Vec::new(),
    };

    for competitor in competition.competitors {
        let team_ref = competitor.team.unwrap_or_default();
        let name = team_ref.display_name.unwrap_or_default();
        let team = Team {
            key: team_key(&name),
            name,
            abbreviation: team_ref.abbreviation,
        };
        let score = competitor.score.as_ref().and_then(parse_score);
        match competitor.home_away.as_deref() {
            Some("home") => {
                snapshot.home = team;
                snapshot.home_score = score;
            }
            Some("away") => {
                snapshot.away = team;
                snapshot.away_score = score;
            }
            _ => debug!(match_id, "Competitor without home/away side ignored"),
        }
    }

    let mut plays: Vec<FeedPlay> = summary
        .key_events
        .into_iter()
        .enumerate()
        .map(|(index, ev)| FeedPlay {
            id: ev.id.as_ref().and_then(id_string).unwrap_or_default(),
            index,
            label: ev.kind.and_then(|k| k.text).unwrap_or_default(),
            text: ev.text.unwrap_or_default(),
            clock: ev.clock.and_then(|c| c.display_value),
            team: ev.team.and_then(|t| t.display_name),
            players: athletes(ev.participants),
            scoring: ev.scoring_play,
        })
        .collect();

    // Commentary lines restating a key play are already covered by it.
    let key_ids: HashSet<String> = plays
        .iter()
        .filter(|p| !p.id.is_empty())
        .map(|p| p.id.clone())
        .collect();
    for item in summary.commentary {
        let play = item.play.unwrap_or_default();
        if play
            .id
            .as_ref()
            .and_then(id_string)
            .is_some_and(|id| key_ids.contains(&id))
        {
            continue;
        }
        let index = plays.len();
        plays.push(FeedPlay {
            id: item
                .sequence
                .as_ref()
                .and_then(id_string)
                .map(|seq| format!("c{seq}"))
                .unwrap_or_default(),
            index,
            label: play.kind.and_then(|k| k.text).unwrap_or_default(),
            text: item.text.unwrap_or_default(),
            clock: item.time.and_then(|t| t.display_value),
            team: play.team.and_then(|t| t.display_name),
            players: athletes(play.participants),
            scoring: play.scoring_play,
        });
    }
    snapshot.plays = plays;

    Ok(snapshot)
}

/// Parse a `/scoreboard` body.
pub fn parse_scoreboard(body: &str) -> PipelineResult<Vec<ScheduledMatch>> {
    let board: ScoreboardResponse = serde_json::from_str(body)
        .map_err(|e| PipelineError::MalformedData(format!("feed scoreboard: {e}")))?;

    Ok(board
        .events
        .into_iter()
        .filter_map(|ev| {
            let match_id = ev.id?;
            Some(ScheduledMatch {
                match_id,
                status: ev
                    .status
                    .and_then(|s| s.kind)
                    .and_then(|k| k.state)
                    .unwrap_or_default(),
                kickoff: ev.date.as_deref().and_then(parse_kickoff),
                name: ev.name.unwrap_or_default(),
            })
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct EspnClient {
    http: Client,
    base_url: String,
}

impl EspnClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("TOUCHLINE/0.1.0")
            .build()
            .context("Failed to build feed HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_text(&self, url: &str) -> PipelineResult<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::unavailable(SourceKind::Feed, format!("request error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::unavailable(SourceKind::Feed, format!("HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| PipelineError::unavailable(SourceKind::Feed, format!("body error: {e}")))
    }
}

#[async_trait]
impl MatchStateSource for EspnClient {
    async fn snapshot(&self, match_id: &str) -> PipelineResult<MatchSnapshot> {
        let url = format!(
            "{}/summary?event={}",
            self.base_url,
            urlencoding::encode(match_id)
        );
        let body = self.get_text(&url).await?;
        parse_summary(match_id, &body)
    }

    async fn schedule(&self) -> PipelineResult<Vec<ScheduledMatch>> {
        let url = format!("{}/scoreboard", self.base_url);
        let body = self.get_text(&url).await?;
        parse_scoreboard(&body)
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Emits every key play currently listed; the deduplicator filters repeats.
pub struct FeedAdapter {
    source: Arc<dyn MatchStateSource>,
    timeout: Duration,
}

impl FeedAdapter {
    pub fn new(source: Arc<dyn MatchStateSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }
}

pub fn play_to_raw(play: &FeedPlay) -> RawEvent {
    RawEvent {
        source: SourceKind::Feed,
        sequence: play.id.clone(),
        order: play.index as i64,
        text: play.text.clone(),
        metadata: json!({
            "type": play.label,
            "clock": play.clock,
            "team": play.team,
            "players": play.players,
            "scoring": play.scoring,
        }),
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn poll(&self, ctx: &MatchContext) -> PipelineResult<Vec<RawEvent>> {
        let snapshot = self.source.snapshot(&ctx.match_id).await?;
        Ok(snapshot.plays.iter().map(play_to_raw).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
