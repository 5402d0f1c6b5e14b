//! Commentary generator.
//!
//! Templated mode turns one canonical event into one localized line.
//! Extraction mode turns one audio transcript into zero or more events,
//! each with drafted text, in a single structured call. Every call goes
//! through the shared `GenerationLimiter`.
//!
//! Output constraints are enforced after the call as well as in the
//! prompt: quotes are stripped, the text is cut to the sentence cap and
//! anything containing a banned phrase is rejected. Extraction fails
//! closed: one malformed item discards the whole chunk. A Goal is only
//! kept when the transcript itself acknowledges a score.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{self, AppConfig, TeamGrammar};
use crate::engine::dedup;
use crate::engine::limiter::GenerationLimiter;
use crate::engine::normalizer::parse_minute;
use crate::error::{PipelineError, PipelineResult};
use crate::llm::prompts::{self, TeamPhrases};
use crate::llm::{GenerationRequest, ResponseFormat, TextGenerator};
use crate::types::{EventType, MatchContext, MatchEvent, RawEvent, Score, SourceKind, Team};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const QUOTE_CHARS: &[char] = &['"', '“', '”', '«', '»', '„'];
const SENTENCE_ENDS: &[char] = &['.', '!', '?', '…'];

const SCORING_WORDS: &str =
    r"(?i)\b(buts?|b+u+t+|goals?|go+l+|il marque|elle marque|c'est le but|scores?|scored)\b";
const SCORE_PATTERN: &str = r"\b(\d{1,2})\s*(?:-|–|à)\s*(\d{1,2})\b";
/// Team shapes like "4-3-3" or "4-2-3-1" are not scorelines.
const FORMATION_PATTERN: &str = r"\b\d\s*[-–]\s*\d(?:\s*[-–]\s*\d)+\b";
const JSON_BLOCK: &str = r"\{[\s\S]*\}";

/// Extraction replies are longer than single lines.
const EXTRACTION_MIN_TOKENS: u32 = 600;
const EXTRACTION_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub locale: String,
    pub max_sentences: usize,
    pub banned_words: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub audio_prefix_chars: usize,
}

impl GeneratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            locale: cfg.worker.locale.clone(),
            max_sentences: cfg.generation.max_sentences.max(1),
            banned_words: cfg.generation.banned_words.clone(),
            max_tokens: cfg.llm.max_tokens,
            temperature: cfg.llm.temperature,
            audio_prefix_chars: cfg.generation.audio_dedup_prefix_chars,
        }
    }
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            locale: "fr".to_string(),
            max_sentences: 2,
            banned_words: vec!["OH MON DIEU".to_string()],
            max_tokens: 200,
            temperature: 0.7,
            audio_prefix_chars: 30,
        }
    }
}

/// Generation usage as reported by the status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationUsage {
    pub model: String,
    pub calls: u64,
    /// Limiter slots handed out across every worker.
    pub slots_granted: u64,
    pub min_interval_ms: u64,
    pub cost_usd: f64,
}

/// An event recovered from a transcript, with its drafted commentary.
#[derive(Debug, Clone)]
pub struct Drafted {
    pub event: MatchEvent,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Extraction reply
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    events: Vec<ExtractionItem>,
}

#[derive(Debug, Deserialize)]
struct ExtractionItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    time: Option<Value>,
    text: String,
    #[serde(default)]
    player: Option<String>,
    #[serde(default)]
    team: Option<String>,
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct CommentaryGenerator {
    llm: Arc<dyn TextGenerator>,
    limiter: Arc<GenerationLimiter>,
    /// team key -> locale -> phrase
    grammar: HashMap<String, HashMap<String, String>>,
    /// lowercased alias -> team key
    aliases: HashMap<String, String>,
    settings: GeneratorSettings,
    scoring_words: Regex,
    score_pattern: Regex,
    formation_pattern: Regex,
    json_block: Regex,
    calls: AtomicU64,
}

impl CommentaryGenerator {
    pub fn new(
        llm: Arc<dyn TextGenerator>,
        limiter: Arc<GenerationLimiter>,
        teams: &HashMap<String, TeamGrammar>,
        settings: GeneratorSettings,
    ) -> Result<Self> {
        let aliases = config::team_aliases(teams);

        Ok(Self {
            llm,
            limiter,
            grammar: teams
                .iter()
                .map(|(key, g)| (key.clone(), g.names.clone()))
                .collect(),
            aliases,
            settings,
            scoring_words: Regex::new(SCORING_WORDS).context("Bad scoring pattern")?,
            score_pattern: Regex::new(SCORE_PATTERN).context("Bad score pattern")?,
            formation_pattern: Regex::new(FORMATION_PATTERN).context("Bad formation pattern")?,
            json_block: Regex::new(JSON_BLOCK).context("Bad JSON block pattern")?,
            calls: AtomicU64::new(0),
        })
    }

    /// Generation calls issued by this generator (one per event or chunk).
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    pub fn cumulative_cost(&self) -> f64 {
        self.llm.cumulative_cost()
    }

    pub fn usage(&self) -> GenerationUsage {
        GenerationUsage {
            model: self.model_name().to_string(),
            calls: self.calls(),
            slots_granted: self.limiter.granted(),
            min_interval_ms: u64::try_from(self.limiter.min_interval().as_millis()).unwrap_or(u64::MAX),
            cost_usd: self.cumulative_cost(),
        }
    }

    /// Team name with the configured article for `locale`, else the display name.
    pub fn team_phrase(&self, team: &Team, locale: &str) -> String {
        let key = if self.grammar.contains_key(&team.key) {
            Some(team.key.as_str())
        } else {
            self.aliases.get(&team.name.to_lowercase()).map(String::as_str)
        };

        key.and_then(|k| self.grammar.get(k))
            .and_then(|names| names.get(locale))
            .cloned()
            .unwrap_or_else(|| team.name.clone())
    }

    fn phrases(&self, ctx: &MatchContext) -> TeamPhrases {
        TeamPhrases {
            home: self.team_phrase(&ctx.home, &ctx.locale),
            away: self.team_phrase(&ctx.away, &ctx.locale),
        }
    }

    // -- Templated mode --------------------------------------------------

    /// One line of commentary for `event`, or `None` if generation failed
    /// or the output was rejected. Never falls back to invented text.
    pub async fn generate(&self, event: &MatchEvent, ctx: &MatchContext) -> Option<String> {
        match self.try_generate(event, ctx).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(
                    match_id = %event.match_id,
                    dedup_key = %event.dedup_key,
                    event_type = %event.event_type,
                    category = e.category(),
                    error = %e,
                    "Commentary dropped"
                );
                None
            }
        }
    }

    async fn try_generate(&self, event: &MatchEvent, ctx: &MatchContext) -> PipelineResult<String> {
        let phrases = self.phrases(ctx);
        let request = GenerationRequest {
            system: prompts::commentary_system(&ctx.locale, self.settings.max_sentences, &phrases),
            user: prompts::commentary_user(event, ctx, &phrases),
            locale: ctx.locale.clone(),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            format: ResponseFormat::Text,
        };
        let raw = self.call(&request).await?;
        self.post_process(&raw)
    }

    async fn call(&self, request: &GenerationRequest) -> PipelineResult<String> {
        let _permit = self.limiter.acquire().await?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.llm
            .complete(request)
            .await
            .map_err(|e| PipelineError::GenerationRejected(format!("{e:#}")))
    }

    /// Enforce output constraints on model text.
    pub fn post_process(&self, raw: &str) -> PipelineResult<String> {
        let unquoted: String = raw.chars().filter(|c| !QUOTE_CHARS.contains(c)).collect();
        let collapsed = unquoted.split_whitespace().collect::<Vec<_>>().join(" ");
        let text = truncate_sentences(&collapsed, self.settings.max_sentences);

        if text.is_empty() {
            return Err(PipelineError::GenerationRejected("empty output".into()));
        }

        let lower = text.to_lowercase();
        if let Some(banned) = self
            .settings
            .banned_words
            .iter()
            .find(|w| !w.trim().is_empty() && lower.contains(&w.to_lowercase()))
        {
            return Err(PipelineError::GenerationRejected(format!(
                "contains banned phrase '{banned}'"
            )));
        }

        Ok(text)
    }

    // -- Extraction mode -------------------------------------------------

    /// True when the transcript explicitly acknowledges a goal, or quotes a
    /// scoreline other than `current`. Formations never count.
    pub fn has_scoring_acknowledgment(&self, transcript: &str, current: Score) -> bool {
        if self.scoring_words.is_match(transcript) {
            return true;
        }
        let without_formations = self.formation_pattern.replace_all(transcript, " ");
        self.score_pattern
            .captures_iter(&without_formations)
            .filter_map(|c| {
                let a = c.get(1)?.as_str().parse::<u32>().ok()?;
                let b = c.get(2)?.as_str().parse::<u32>().ok()?;
                Some((a, b))
            })
            .any(|(a, b)| (a, b) != (current.home, current.away) && (b, a) != (current.home, current.away))
    }

    /// Classify and draft events from one transcript in a single call.
    /// `None` when the call failed or the reply was malformed.
    pub async fn extract(&self, raw: &RawEvent, ctx: &MatchContext) -> Option<Vec<Drafted>> {
        match self.try_extract(raw, ctx).await {
            Ok(drafted) => {
                debug!(
                    match_id = %ctx.match_id,
                    chunk = %raw.sequence,
                    events = drafted.len(),
                    "Transcript extracted"
                );
                Some(drafted)
            }
            Err(e) => {
                warn!(
                    match_id = %ctx.match_id,
                    chunk = %raw.sequence,
                    category = e.category(),
                    error = %e,
                    "Transcript chunk discarded"
                );
                None
            }
        }
    }

    async fn try_extract(&self, raw: &RawEvent, ctx: &MatchContext) -> PipelineResult<Vec<Drafted>> {
        let phrases = self.phrases(ctx);
        let request = GenerationRequest {
            system: prompts::extraction_system(&ctx.locale, self.settings.max_sentences),
            user: prompts::extraction_user(&raw.text, ctx, &phrases),
            locale: ctx.locale.clone(),
            max_tokens: self.settings.max_tokens.max(EXTRACTION_MIN_TOKENS),
            temperature: EXTRACTION_TEMPERATURE,
            format: ResponseFormat::Json,
        };
        let reply = self.call(&request).await?;
        self.interpret_extraction(&reply, &raw.text, ctx)
    }

    /// Validate a model reply against the transcript it came from.
    pub fn interpret_extraction(
        &self,
        reply: &str,
        transcript: &str,
        ctx: &MatchContext,
    ) -> PipelineResult<Vec<Drafted>> {
        let json = self
            .json_block
            .find(reply)
            .map(|m| m.as_str())
            .ok_or_else(|| PipelineError::MalformedData("no JSON object in extraction reply".into()))?;

        let parsed: ExtractionReply = serde_json::from_str(json)
            .map_err(|e| PipelineError::MalformedData(format!("extraction reply: {e}")))?;

        let grounded = self.has_scoring_acknowledgment(transcript, ctx.score);

        // Validate everything before building anything.
        let mut validated = Vec::with_capacity(parsed.events.len());
        for item in parsed.events {
            let event_type = EventType::from_label(&item.kind).ok_or_else(|| {
                PipelineError::MalformedData(format!("unknown event type '{}'", item.kind))
            })?;
            if item.text.trim().is_empty() {
                return Err(PipelineError::MalformedData("event without text".into()));
            }
            let minute = match &item.time {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => parse_minute(s),
                Some(Value::Number(n)) => n.as_i64().and_then(|m| parse_minute(&m.to_string())),
                Some(other) => {
                    return Err(PipelineError::MalformedData(format!("invalid time {other}")))
                }
            };
            validated.push((event_type, minute, item));
        }

        let mut drafted = Vec::with_capacity(validated.len());
        for (mut event_type, minute, item) in validated {
            if event_type == EventType::Goal && !grounded {
                debug!(match_id = %ctx.match_id, "Ungrounded goal downgraded to shot");
                event_type = EventType::Shot;
            }

            let text = match self.post_process(&item.text) {
                Ok(text) => text,
                Err(e) => {
                    debug!(match_id = %ctx.match_id, error = %e, "Extracted line rejected");
                    continue;
                }
            };

            let (minute_label, minute_seconds) =
                minute.unwrap_or_else(|| (ctx.minute_label.clone(), ctx.minute_seconds));

            let team = item
                .team
                .as_deref()
                .and_then(|name| ctx.team_named(name).or_else(|| ctx.find_team(name)))
                .map(|t| t.name.clone());

            let dedup_key = dedup::content_key(
                &ctx.match_id,
                &minute_label,
                event_type,
                &text,
                self.settings.audio_prefix_chars,
            );

            drafted.push(Drafted {
                event: MatchEvent {
                    match_id: ctx.match_id.clone(),
                    event_type,
                    minute_label,
                    minute_seconds,
                    team,
                    player: item
                        .player
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty()),
                    is_scoring: event_type == EventType::Goal,
                    source: SourceKind::Audio,
                    dedup_key,
                    detail: text.clone(),
                },
                text,
            });
        }

        Ok(drafted)
    }
}

/// Keep at most `max` sentences. Runs of terminators ("?!", "...") end one sentence.
fn truncate_sentences(text: &str, max: usize) -> String {
    let max = max.max(1);
    let mut out = String::with_capacity(text.len());
    let mut count = 0;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        out.push(c);
        let run_ends = SENTENCE_ENDS.contains(&c)
            && !chars.peek().map(|n| SENTENCE_ENDS.contains(n)).unwrap_or(false);
        if run_ends {
            count += 1;
            if count >= max {
                break;
            }
        }
    }
    out.trim().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
