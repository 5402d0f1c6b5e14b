//! Mock sources for integration testing.
//!
//! Deterministic stand-ins for the match-state service, the source
//! adapters and the text-generation provider. All state is in-memory and
//! controllable from test code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use touchline::config::{OverflowPolicy, TeamGrammar};
use touchline::engine::generator::{CommentaryGenerator, GeneratorSettings};
use touchline::engine::limiter::GenerationLimiter;
use touchline::engine::normalizer::Normalizer;
use touchline::engine::orchestrator::{PipelineComponents, PipelineSettings};
use touchline::engine::publisher::{CommentaryStore, InMemoryStore, Publisher};
use touchline::error::{PipelineError, PipelineResult};
use touchline::llm::{GenerationRequest, ResponseFormat, TextGenerator};
use touchline::sources::{MatchSnapshot, MatchStateSource, ScheduledMatch, SourceAdapter};
use touchline::storage::LedgerStore;
use touchline::types::{MatchContext, RawEvent, SourceKind, Team};

// ---------------------------------------------------------------------------
// Match state
// ---------------------------------------------------------------------------

/// Replays a status script; the last status sticks.
pub struct MockMatchSource {
    statuses: Mutex<VecDeque<String>>,
    pub kickoff: Option<DateTime<Utc>>,
    pub clock: Mutex<Option<String>>,
    /// If set, all snapshots fail with this reason.
    force_error: Mutex<Option<String>>,
}

impl MockMatchSource {
    pub fn new(statuses: &[&str]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().map(|s| s.to_string()).collect()),
            kickoff: None,
            clock: Mutex::new(Some("12'".into())),
            force_error: Mutex::new(None),
        }
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }
}

#[async_trait]
impl MatchStateSource for MockMatchSource {
    async fn snapshot(&self, match_id: &str) -> PipelineResult<MatchSnapshot> {
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(PipelineError::unavailable(SourceKind::Feed, msg));
        }
        let status = {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                statuses.pop_front().unwrap_or_default()
            } else {
                statuses.front().cloned().unwrap_or_else(|| "pre".into())
            }
        };
        Ok(MatchSnapshot {
            match_id: match_id.to_string(),
            status,
            home: Team::new("Senegal"),
            away: Team::new("DR Congo"),
            home_score: Some(0),
            away_score: Some(0),
            clock: self.clock.lock().unwrap().clone(),
            kickoff: self.kickoff,
            plays: Vec::new(),
        })
    }

    async fn schedule(&self) -> PipelineResult<Vec<ScheduledMatch>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Returns the next scripted batch on each poll, then empty batches.
pub struct ScriptedAdapter {
    kind: SourceKind,
    batches: Mutex<VecDeque<Vec<RawEvent>>>,
    repeat_last: bool,
    delay: Duration,
    timeout: Duration,
    pub polls: Mutex<usize>,
}

impl ScriptedAdapter {
    pub fn new(kind: SourceKind, batches: Vec<Vec<RawEvent>>) -> Self {
        Self {
            kind,
            batches: Mutex::new(batches.into_iter().collect()),
            repeat_last: false,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(2),
            polls: Mutex::new(0),
        }
    }

    /// Keep returning the last batch, like a feed that lists every play.
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Sleep before answering; with a short timeout this simulates a hung source.
    pub fn slow(mut self, delay: Duration, timeout: Duration) -> Self {
        self.delay = delay;
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn poll(&self, _ctx: &MatchContext) -> PipelineResult<Vec<RawEvent>> {
        *self.polls.lock().unwrap() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut batches = self.batches.lock().unwrap();
        let batch = if self.repeat_last && batches.len() == 1 {
            batches.front().cloned()
        } else {
            batches.pop_front()
        };
        Ok(batch.unwrap_or_default())
    }
}

pub fn raw(kind: SourceKind, sequence: &str, order: i64, text: &str, metadata: serde_json::Value) -> RawEvent {
    RawEvent {
        source: kind,
        sequence: sequence.to_string(),
        order,
        text: text.to_string(),
        metadata,
    }
}

pub fn chat(id: &str, order: i64, text: &str) -> RawEvent {
    raw(SourceKind::Chat, id, order, text, serde_json::json!({"author": "fan"}))
}

pub fn play(id: &str, order: i64, label: &str, text: &str, clock: &str) -> RawEvent {
    raw(
        SourceKind::Feed,
        id,
        order,
        text,
        serde_json::json!({"type": label, "clock": clock}),
    )
}

pub fn transcript(order: i64, text: &str) -> RawEvent {
    raw(SourceKind::Audio, &format!("chunk-{order}"), order, text, serde_json::json!({}))
}

// ---------------------------------------------------------------------------
// Text generation
// ---------------------------------------------------------------------------

/// Counts calls; answers templated requests with a fixed line and
/// extraction requests with the scripted JSON replies.
pub struct MockLlm {
    pub calls: Mutex<Vec<GenerationRequest>>,
    extraction_replies: Mutex<VecDeque<String>>,
    force_error: Mutex<Option<String>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            extraction_replies: Mutex::new(VecDeque::new()),
            force_error: Mutex::new(None),
        }
    }

    pub fn with_extractions(replies: &[&str]) -> Self {
        let llm = Self::new();
        *llm.extraction_replies.lock().unwrap() = replies.iter().map(|r| r.to_string()).collect();
        llm
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TextGenerator for MockLlm {
    async fn complete(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            anyhow::bail!(msg);
        }
        match request.format {
            ResponseFormat::Text => Ok("Le match s'anime sur la pelouse.".to_string()),
            ResponseFormat::Json => Ok(self
                .extraction_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| r#"{"events":[]}"#.to_string())),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

pub struct Harness {
    pub components: PipelineComponents,
    pub store: Arc<InMemoryStore>,
    pub llm: Arc<MockLlm>,
    pub source: Arc<MockMatchSource>,
}

pub struct HarnessOptions {
    pub max_per_pass: usize,
    pub overflow_policy: OverflowPolicy,
    pub ledger: Option<Arc<LedgerStore>>,
    pub store: Option<Arc<dyn CommentaryStore>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_per_pass: 10,
            overflow_policy: OverflowPolicy::Defer,
            ledger: None,
            store: None,
        }
    }
}

fn grammar() -> HashMap<String, TeamGrammar> {
    HashMap::from([(
        "senegal".to_string(),
        TeamGrammar {
            aliases: vec!["Sénégal".into()],
            names: HashMap::from([("fr".to_string(), "le Sénégal".to_string())]),
        },
    )])
}

/// Wire a pipeline around the given adapters, LLM and match source.
pub fn harness(
    adapters: Vec<Arc<dyn SourceAdapter>>,
    llm: Arc<MockLlm>,
    source: Arc<MockMatchSource>,
    options: HarnessOptions,
) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let sink: Arc<dyn CommentaryStore> = options.store.unwrap_or_else(|| store.clone());

    let generator = CommentaryGenerator::new(
        llm.clone(),
        Arc::new(GenerationLimiter::unlimited()),
        &grammar(),
        GeneratorSettings::default(),
    )
    .expect("generator");

    let settings = PipelineSettings {
        lifecycle_interval: Duration::ZERO,
        pass_interval: Duration::from_millis(20),
        max_per_pass: options.max_per_pass,
        overflow_policy: options.overflow_policy,
        ..PipelineSettings::default()
    };

    let components = PipelineComponents {
        normalizer: Arc::new(Normalizer::new().expect("normalizer")),
        generator: Arc::new(generator),
        publisher: Arc::new(Publisher::new(sink, "fr", 2, Duration::from_millis(5))),
        match_source: source.clone(),
        ledger: options.ledger,
        adapters: Arc::new(move |_id: &str| adapters.clone()),
        settings,
    };

    Harness {
        components,
        store,
        llm,
        source,
    }
}
