//! Shared types for the TOUCHLINE pipeline.
//!
//! These types form the data model passed between sources, the engine
//! stages and the status server. Events are created once and never
//! mutated after they leave the stage that built them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Match
// ---------------------------------------------------------------------------

/// Coarse match lifecycle state. Ordering follows the lifecycle, so
/// `max(previous, observed)` is the monotonic transition rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Scheduled,
    Live,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Scheduled => write!(f, "SCHEDULED"),
            Phase::Live => write!(f, "LIVE"),
            Phase::Finished => write!(f, "FINISHED"),
        }
    }
}

/// A participant. `key` is the canonical name key used for grammar lookups
/// (e.g. "ivoryCoast"), `name` the feed's display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub abbreviation: Option<String>,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key: team_key(name),
            abbreviation: None,
        }
    }
}

/// Derive a camelCase name key from a display name ("DR Congo" -> "drCongo").
pub fn team_key(display_name: &str) -> String {
    let mut key = String::new();
    for (i, word) in display_name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .enumerate()
    {
        let lower = word.to_lowercase();
        if i == 0 {
            key.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                key.extend(first.to_uppercase());
                key.push_str(chars.as_str());
            }
        }
    }
    key
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub home: u32,
    pub away: u32,
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.home, self.away)
    }
}

/// In-memory state of one tracked match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub match_id: String,
    pub phase: Option<Phase>,
    pub home: Team,
    pub away: Team,
    pub score: Score,
    /// Last clock label reported by the feed, e.g. "67'".
    pub clock: Option<String>,
    pub kickoff: Option<DateTime<Utc>>,
}

impl Match {
    pub fn new(match_id: &str) -> Self {
        Self {
            match_id: match_id.to_string(),
            phase: None,
            home: Team::default(),
            away: Team::default(),
            score: Score::default(),
            clock: None,
            kickoff: None,
        }
    }

    /// Snapshot of what the normalizer and generator need for one pass.
    pub fn context(&self, locale: &str) -> MatchContext {
        let (minute_label, minute_seconds) = self
            .clock
            .as_deref()
            .and_then(crate::engine::normalizer::parse_minute)
            .unwrap_or_else(|| ("0'".to_string(), 0));

        MatchContext {
            match_id: self.match_id.clone(),
            phase: self.phase,
            home: self.home.clone(),
            away: self.away.clone(),
            score: self.score,
            minute_label,
            minute_seconds,
            kickoff: self.kickoff,
            locale: locale.to_string(),
        }
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {}",
            self.match_id, self.home.name, self.score, self.away.name
        )
    }
}

/// Read-only view of a match handed to normalization and generation.
#[derive(Debug, Clone, Serialize)]
pub struct MatchContext {
    pub match_id: String,
    pub phase: Option<Phase>,
    pub home: Team,
    pub away: Team,
    pub score: Score,
    pub minute_label: String,
    pub minute_seconds: i64,
    pub kickoff: Option<DateTime<Utc>>,
    pub locale: String,
}

impl MatchContext {
    /// Roster lookup: the team whose name, key or abbreviation appears in `text`.
    pub fn find_team(&self, text: &str) -> Option<&Team> {
        let lower = text.to_lowercase();
        [&self.home, &self.away].into_iter().find(|team| {
            if team.name.is_empty() {
                return false;
            }
            lower.contains(&team.name.to_lowercase())
                || (!team.key.is_empty() && lower.contains(&team.key.to_lowercase()))
                || team
                    .abbreviation
                    .as_deref()
                    .map(|abbr| contains_word(text, abbr))
                    .unwrap_or(false)
        })
    }

    /// Exact roster match on a display name reported by a source.
    pub fn team_named(&self, name: &str) -> Option<&Team> {
        [&self.home, &self.away]
            .into_iter()
            .find(|team| !team.name.is_empty() && team.name.eq_ignore_ascii_case(name.trim()))
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Which adapter (or synthetic lifecycle hook) produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Feed,
    Chat,
    Audio,
    Lifecycle,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Feed => "feed",
            SourceKind::Chat => "chat",
            SourceKind::Audio => "audio",
            SourceKind::Lifecycle => "lifecycle",
        }
    }

    /// Confidence attached to published events from this source.
    pub fn confidence(&self) -> f64 {
        match self {
            SourceKind::Feed | SourceKind::Lifecycle => 1.0,
            SourceKind::Audio => 0.9,
            SourceKind::Chat => 0.6,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source-native observation. Lives for one pipeline pass only.
#[derive(Debug, Clone, Serialize)]
pub struct RawEvent {
    pub source: SourceKind,
    /// Source-native identity: feed play id, chat message id, audio chunk offset.
    pub sequence: String,
    /// Ordering key within the source (ascending).
    pub order: i64,
    pub text: String,
    /// Source-specific payload. Only the normalizer for that source reads it.
    pub metadata: serde_json::Value,
}

/// Canonical event type. Wire names match the commentary store's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "goal")]
    Goal,
    #[serde(rename = "yellowCard")]
    YellowCard,
    #[serde(rename = "redCard")]
    RedCard,
    #[serde(rename = "substitution")]
    Substitution,
    #[serde(rename = "corner")]
    Corner,
    #[serde(rename = "foul")]
    Foul,
    #[serde(rename = "shot")]
    Shot,
    #[serde(rename = "offside")]
    Offside,
    #[serde(rename = "save")]
    Save,
    #[serde(rename = "halftime")]
    HalfTime,
    #[serde(rename = "kickoff")]
    KickOff,
    #[serde(rename = "commentary")]
    Commentary,
    #[serde(rename = "analysis")]
    Analysis,
}

impl EventType {
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventType::Goal => "goal",
            EventType::YellowCard => "yellowCard",
            EventType::RedCard => "redCard",
            EventType::Substitution => "substitution",
            EventType::Corner => "corner",
            EventType::Foul => "foul",
            EventType::Shot => "shot",
            EventType::Offside => "offside",
            EventType::Save => "save",
            EventType::HalfTime => "halftime",
            EventType::KickOff => "kickoff",
            EventType::Commentary => "commentary",
            EventType::Analysis => "analysis",
        }
    }

    /// Lenient parse used for model output ("yellow_card", "YellowCard", "yellow card").
    pub fn from_label(label: &str) -> Option<Self> {
        let folded: String = label
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        let t = match folded.as_str() {
            "goal" | "but" => EventType::Goal,
            "yellowcard" | "yellow" => EventType::YellowCard,
            "redcard" | "red" => EventType::RedCard,
            "substitution" | "sub" => EventType::Substitution,
            "corner" => EventType::Corner,
            "foul" => EventType::Foul,
            "shot" => EventType::Shot,
            "offside" => EventType::Offside,
            "save" => EventType::Save,
            "halftime" => EventType::HalfTime,
            "kickoff" => EventType::KickOff,
            "commentary" | "highlight" => EventType::Commentary,
            "analysis" => EventType::Analysis,
            _ => return None,
        };
        Some(t)
    }

    pub fn icon(&self) -> &'static str {
        match self {
            EventType::Goal => "⚽",
            EventType::YellowCard => "🟨",
            EventType::RedCard => "🟥",
            EventType::Substitution => "🔄",
            EventType::Corner => "🚩",
            EventType::Foul => "🚫",
            EventType::Save => "🧤",
            EventType::Shot => "🎯",
            EventType::Offside => "🚫",
            EventType::KickOff => "📢",
            EventType::HalfTime => "⏸️",
            EventType::Commentary => "🎙️",
            EventType::Analysis => "📊",
        }
    }

    /// Categories a fan chat message may not assert on its own.
    pub fn is_decisive(&self) -> bool {
        matches!(
            self,
            EventType::Goal | EventType::RedCard | EventType::YellowCard | EventType::Substitution
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Canonical, post-normalization event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchEvent {
    pub match_id: String,
    pub event_type: EventType,
    pub minute_label: String,
    /// Ordering value. Negative values are pre-match blocks.
    pub minute_seconds: i64,
    pub team: Option<String>,
    pub player: Option<String>,
    pub is_scoring: bool,
    pub source: SourceKind,
    pub dedup_key: String,
    /// Source text the commentary must stay grounded in.
    pub detail: String,
}

/// Key record of something this pipeline has delivered to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEventRecord {
    pub event_id: uuid::Uuid,
    pub match_id: String,
    pub dedup_key: String,
    pub published_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Pass reporting
// ---------------------------------------------------------------------------

/// Per-match orchestration state, including the terminal eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Idle,
    Scheduled,
    Live,
    Finished,
    Evicted,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "IDLE"),
            WorkerState::Scheduled => write!(f, "SCHEDULED"),
            WorkerState::Live => write!(f, "LIVE"),
            WorkerState::Finished => write!(f, "FINISHED"),
            WorkerState::Evicted => write!(f, "EVICTED"),
        }
    }
}

/// Everything the supervisor learns about one orchestration pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub match_id: String,
    pub state: Option<WorkerState>,
    pub score: Score,
    pub raw_events: usize,
    pub generation_calls: usize,
    pub published: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub rejected: usize,
    pub deferred: usize,
    pub dropped: usize,
    pub errors: usize,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_key_camel_case() {
        assert_eq!(team_key("Ivory Coast"), "ivoryCoast");
        assert_eq!(team_key("DR Congo"), "drCongo");
        assert_eq!(team_key("Morocco"), "morocco");
        assert_eq!(team_key(""), "");
    }

    #[test]
    fn test_phase_ordering_follows_lifecycle() {
        assert!(Phase::Scheduled < Phase::Live);
        assert!(Phase::Live < Phase::Finished);
        assert_eq!(Phase::Live.max(Phase::Scheduled), Phase::Live);
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::YellowCard).unwrap();
        assert_eq!(json, "\"yellowCard\"");
        let json = serde_json::to_string(&EventType::HalfTime).unwrap();
        assert_eq!(json, "\"halftime\"");
        assert_eq!(EventType::KickOff.wire_name(), "kickoff");
    }

    #[test]
    fn test_event_type_lenient_labels() {
        assert_eq!(EventType::from_label("yellow_card"), Some(EventType::YellowCard));
        assert_eq!(EventType::from_label("Red Card"), Some(EventType::RedCard));
        assert_eq!(EventType::from_label("highlight"), Some(EventType::Commentary));
        assert_eq!(EventType::from_label("dance"), None);
    }

    #[test]
    fn test_find_team_by_name_and_abbreviation() {
        let mut m = Match::new("1");
        m.home = Team::new("Senegal");
        m.away = Team {
            abbreviation: Some("MLI".into()),
            ..Team::new("Mali")
        };
        let ctx = m.context("fr");
        assert_eq!(ctx.find_team("Goal for Senegal!").map(|t| t.name.as_str()), Some("Senegal"));
        assert_eq!(ctx.find_team("MLI press high").map(|t| t.name.as_str()), Some("Mali"));
        assert!(ctx.find_team("nobody here").is_none());
    }

    #[test]
    fn test_context_minute_from_clock() {
        let mut m = Match::new("1");
        m.clock = Some("45'+2'".into());
        let ctx = m.context("fr");
        assert_eq!(ctx.minute_label, "45+2'");
        assert_eq!(ctx.minute_seconds, 45 * 60 + 2);
    }
}
