//! Event normalizer: source-specific `RawEvent` -> canonical `MatchEvent`.
//!
//! Classification is an ordered table of `(category, pattern)` pairs
//! evaluated in fixed priority order; the first match wins. A line such
//! as "goal disallowed, offside" satisfies both the goal and offside
//! patterns and is classified as `Goal`, with `is_scoring = false` when a
//! disallowance marker is present.
//!
//! Audio transcripts are not normalized here. They go through the
//! generator's extraction mode, which classifies and drafts in one call.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::engine::dedup;
use crate::types::{EventType, MatchContext, MatchEvent, RawEvent, SourceKind};

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Below this many alphanumeric characters a line carries no information.
const MIN_INFORMATIVE_CHARS: usize = 4;

/// Text prefix length keying feed plays that arrive without an id.
const ANONYMOUS_PLAY_PREFIX_CHARS: usize = 30;

/// Which native vocabulary a source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    English,
    French,
    All,
}

struct RuleSpec {
    event_type: EventType,
    en: &'static str,
    fr: &'static str,
}

/// Priority order. Do not reorder without updating the tie-break tests.
const RULES: &[RuleSpec] = &[
    RuleSpec {
        event_type: EventType::Goal,
        // Scoring phrasing only: "the goal" alone is a place on the pitch.
        en: r"^\s*goal(\s*[!\-]|\s*$)|\bgoal\s*!|\bgo{2,}a*l+\b|\b(scores|scored|own goal|penalty - scored|no goal|goal (disallowed|ruled out|chalked off))\b",
        fr: r"\b(buts?|b+u+t+|go+l+|il marque|elle marque|c'est le but|égalisation|égalise)\b",
    },
    RuleSpec {
        event_type: EventType::RedCard,
        en: r"\b(red card|sent off|second yellow)\b",
        fr: r"\b(carton rouge|expulsé|expulsion)\b",
    },
    RuleSpec {
        event_type: EventType::YellowCard,
        en: r"\b(yellow card|booked|booking|cautioned)\b",
        fr: r"\b(carton jaune|averti|avertissement)\b",
    },
    RuleSpec {
        event_type: EventType::Substitution,
        en: r"\b(substitution|substitute|replaces|replaced by|comes on|subbed)\b",
        fr: r"\b(remplacement|remplacé|remplace|changement|entre en jeu|fait son entrée)\b",
    },
    RuleSpec {
        event_type: EventType::Corner,
        en: r"\bcorners?\b",
        fr: r"\b(corners?|coup de pied de coin)\b",
    },
    RuleSpec {
        event_type: EventType::Offside,
        en: r"\boff-?side\b",
        fr: r"\bhors[- ]jeu\b",
    },
    RuleSpec {
        event_type: EventType::Shot,
        en: r"\b(shots?|attempt|strike|header|hits the (post|bar|crossbar))\b",
        fr: r"\b(tirs?|frappes?|tête|poteau|transversale)\b",
    },
    RuleSpec {
        event_type: EventType::Foul,
        en: r"\b(fouls?|fouled|free kick|penalty)\b",
        fr: r"\b(fautes?|coup franc|penalty|pénalty)\b",
    },
    RuleSpec {
        event_type: EventType::Save,
        en: r"\b(saves?|saved)\b",
        fr: r"\b(arrêt|parade|sauvetage|détourne)\b",
    },
    RuleSpec {
        event_type: EventType::HalfTime,
        en: r"\b(half-?time|half time|end of (the )?first half)\b",
        fr: r"\bmi-temps\b",
    },
    RuleSpec {
        event_type: EventType::KickOff,
        en: r"\b(kick-?off|kick off|first half begins|second half begins|start 2nd half)\b",
        fr: r"\b(coup d'envoi|début du match|c'est parti)\b",
    },
];

const DISALLOWED: &str = r"(?i)\b(disallowed|ruled out|no goal|chalked off|annulé|annule|refusé|refuse)\b";

struct Rule {
    event_type: EventType,
    en: Regex,
    fr: Regex,
}

impl Rule {
    fn matches(&self, text: &str, vocabulary: Vocabulary) -> bool {
        match vocabulary {
            Vocabulary::English => self.en.is_match(text),
            Vocabulary::French => self.fr.is_match(text),
            Vocabulary::All => self.en.is_match(text) || self.fr.is_match(text),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

pub struct Normalizer {
    rules: Vec<Rule>,
    disallowed: Regex,
}

impl Normalizer {
    pub fn new() -> Result<Self> {
        let rules = RULES
            .iter()
            .map(|spec| {
                Ok(Rule {
                    event_type: spec.event_type,
                    en: Regex::new(&format!("(?i){}", spec.en))
                        .with_context(|| format!("Bad pattern for {}", spec.event_type))?,
                    fr: Regex::new(&format!("(?i){}", spec.fr))
                        .with_context(|| format!("Bad pattern for {}", spec.event_type))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            disallowed: Regex::new(DISALLOWED).context("Bad disallowance pattern")?,
        })
    }

    /// First matching category in priority order, else `Commentary`.
    pub fn classify(&self, text: &str, vocabulary: Vocabulary) -> EventType {
        self.rules
            .iter()
            .find(|rule| rule.matches(text, vocabulary))
            .map(|rule| rule.event_type)
            .unwrap_or(EventType::Commentary)
    }

    pub fn is_disallowed(&self, text: &str) -> bool {
        self.disallowed.is_match(text)
    }

    /// Convert one raw observation. `None` when the text is not informative.
    pub fn normalize(&self, raw: &RawEvent, ctx: &MatchContext) -> Option<MatchEvent> {
        let event = match raw.source {
            SourceKind::Feed => self.normalize_feed(raw, ctx),
            SourceKind::Chat => self.normalize_chat(raw, ctx),
            SourceKind::Audio | SourceKind::Lifecycle => None,
        };
        if event.is_none() {
            debug!(
                match_id = %ctx.match_id,
                source = %raw.source,
                sequence = %raw.sequence,
                "Raw event filtered out"
            );
        }
        event
    }

    fn normalize_feed(&self, raw: &RawEvent, ctx: &MatchContext) -> Option<MatchEvent> {
        let text = raw.text.trim();
        let label = meta_str(&raw.metadata, "type").unwrap_or_default();

        let detail = match (text.is_empty(), label.is_empty()) {
            (false, _) => text.to_string(),
            (true, false) => label.to_string(),
            (true, true) => return None,
        };
        if !is_informative(&detail) {
            return None;
        }

        // The play-type label is authoritative; fall back to the free text.
        let mut event_type = self.classify(label, Vocabulary::English);
        if event_type == EventType::Commentary {
            event_type = self.classify(text, Vocabulary::English);
        }

        let disallowed = self.is_disallowed(text) || self.is_disallowed(label);
        // Only a feed assertion makes a goal count.
        let scoring_flag = raw.metadata.get("scoring").and_then(Value::as_bool).unwrap_or(false);
        let is_scoring = event_type == EventType::Goal && !disallowed && scoring_flag;

        let (minute_label, minute_seconds) = meta_str(&raw.metadata, "clock")
            .and_then(parse_minute)
            .unwrap_or_else(|| (ctx.minute_label.clone(), ctx.minute_seconds));

        let team = meta_str(&raw.metadata, "team")
            .and_then(|name| ctx.team_named(name))
            .or_else(|| ctx.find_team(&detail))
            .map(|t| t.name.clone());

        let player = raw
            .metadata
            .get("players")
            .and_then(Value::as_array)
            .and_then(|players| players.first())
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        // The opening kickoff is one real-world event whichever source reports it.
        let dedup_key = if event_type == EventType::KickOff && minute_seconds <= 60 {
            dedup::lifecycle_key(&ctx.match_id, "kickoff")
        } else if raw.sequence.is_empty() {
            dedup::content_key(
                &ctx.match_id,
                &minute_label,
                event_type,
                &detail,
                ANONYMOUS_PLAY_PREFIX_CHARS,
            )
        } else {
            dedup::source_key(&ctx.match_id, SourceKind::Feed, &raw.sequence)
        };

        Some(MatchEvent {
            match_id: ctx.match_id.clone(),
            event_type,
            minute_label,
            minute_seconds,
            team,
            player,
            is_scoring,
            source: SourceKind::Feed,
            dedup_key,
            detail,
        })
    }

    fn normalize_chat(&self, raw: &RawEvent, ctx: &MatchContext) -> Option<MatchEvent> {
        let text = raw.text.trim();
        if !is_informative(text) {
            return None;
        }

        // Fans do not get to assert decisive events.
        let mut event_type = self.classify(text, Vocabulary::All);
        if event_type.is_decisive() {
            event_type = EventType::Commentary;
        }

        Some(MatchEvent {
            match_id: ctx.match_id.clone(),
            event_type,
            minute_label: ctx.minute_label.clone(),
            minute_seconds: ctx.minute_seconds,
            team: ctx.find_team(text).map(|t| t.name.clone()),
            player: None,
            is_scoring: false,
            source: SourceKind::Chat,
            dedup_key: dedup::source_key(&ctx.match_id, SourceKind::Chat, &raw.sequence),
            detail: text.to_string(),
        })
    }
}

fn meta_str<'a>(metadata: &'a Value, field: &str) -> Option<&'a str> {
    metadata.get(field).and_then(Value::as_str).map(str::trim)
}

fn is_informative(text: &str) -> bool {
    text.chars().filter(|c| c.is_alphanumeric()).count() >= MIN_INFORMATIVE_CHARS
}

// ---------------------------------------------------------------------------
// Clock labels
// ---------------------------------------------------------------------------

/// Canonicalize a clock label ("45'+2'", "45+2", "67'") into
/// `("45+2'", 2702)`. Added time orders inside its base minute.
pub fn parse_minute(label: &str) -> Option<(String, i64)> {
    let cleaned: String = label
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '\'' | '’' | '′'))
        .collect();

    let (base, added) = match cleaned.split_once('+') {
        Some((base, added)) => (base, Some(added)),
        None => (cleaned.as_str(), None),
    };

    let base: i64 = base.parse().ok()?;
    let added: i64 = match added {
        Some(a) => a.parse().ok()?,
        None => 0,
    };
    if !(0..=150).contains(&base) || !(0..=30).contains(&added) {
        return None;
    }

    let label = if added > 0 {
        format!("{base}+{added}'")
    } else {
        format!("{base}'")
    };
    Some((label, base * 60 + added))
}

/// First run of ASCII digits in `text`, if it fits a `u32`.
pub fn first_integer(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
