//! Per-match orchestration: the poll → normalize → generate → dedup →
//! publish pass, and the loop that runs it until the match is evicted or
//! the process shuts down.
//!
//! Each match gets its own `MatchWorker`, owning its lifecycle tracker,
//! deduplicator and backlog outright. The only state shared across
//! workers is behind `PipelineComponents`: the generation limiter (inside
//! the generator), the publisher and the ledger.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::dedup::{self, Deduplicator};
use super::generator::CommentaryGenerator;
use super::lifecycle::{LifecycleTracker, LifecycleWindows};
use super::normalizer::Normalizer;
use super::publisher::{PublishOutcome, Publisher};
use crate::config::{AppConfig, OverflowPolicy};
use crate::sources::{poll_guarded, MatchSnapshot, MatchStateSource, SourceAdapter};
use crate::storage::LedgerStore;
use crate::types::{
    EventType, Match, MatchContext, MatchEvent, PassReport, Phase, RawEvent, SourceKind, WorkerState,
};

/// A late-started worker does not announce a kickoff past this clock.
const KICKOFF_ANNOUNCE_LIMIT_SECS: i64 = 600;

/// Minute value of the pre-match analysis block.
const PREMATCH_MINUTE_SECONDS: i64 = -60;

/// Builds the adapter set for one match id.
pub type AdapterFactory = Arc<dyn Fn(&str) -> Vec<Arc<dyn SourceAdapter>> + Send + Sync>;

/// Pass-loop tunables.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub locale: String,
    pub pass_interval: Duration,
    pub lifecycle_interval: Duration,
    pub max_per_pass: usize,
    pub overflow_policy: OverflowPolicy,
    pub backlog_limit: usize,
    pub prematch_window: chrono::Duration,
    pub windows: LifecycleWindows,
}

impl PipelineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            locale: cfg.worker.locale.clone(),
            pass_interval: cfg.worker.pass_interval(),
            lifecycle_interval: cfg.worker.lifecycle_interval(),
            max_per_pass: cfg.generation.max_per_pass.max(1),
            overflow_policy: cfg.generation.overflow_policy,
            backlog_limit: cfg.generation.backlog_limit,
            prematch_window: chrono::Duration::hours(cfg.generation.prematch_window_hours),
            windows: LifecycleWindows {
                drain: chrono::Duration::seconds(cfg.worker.drain_secs as i64),
                retention: chrono::Duration::seconds(cfg.worker.retention_secs as i64),
            },
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Everything a worker needs that outlives it.
#[derive(Clone)]
pub struct PipelineComponents {
    pub normalizer: Arc<Normalizer>,
    pub generator: Arc<CommentaryGenerator>,
    pub publisher: Arc<Publisher>,
    pub match_source: Arc<dyn MatchStateSource>,
    pub ledger: Option<Arc<LedgerStore>>,
    pub adapters: AdapterFactory,
    pub settings: PipelineSettings,
}

impl PipelineComponents {
    pub fn worker_for(&self, initial: Match) -> MatchWorker {
        MatchWorker::new(initial, self.clone())
    }
}

/// One unit of generation work.
#[derive(Debug, Clone)]
enum Candidate {
    /// Templated mode: one call drafts one event.
    Event(MatchEvent),
    /// Extraction mode: one call classifies and drafts a transcript.
    Transcript(RawEvent),
}

impl Candidate {
    fn batch_key(&self, match_id: &str) -> String {
        match self {
            Candidate::Event(event) => event.dedup_key.clone(),
            Candidate::Transcript(raw) => dedup::source_key(match_id, raw.source, &raw.sequence),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct MatchWorker {
    state: Match,
    tracker: LifecycleTracker,
    dedup: Deduplicator,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    backlog: VecDeque<Candidate>,
    last_refresh: Option<Instant>,
    components: PipelineComponents,
}

impl MatchWorker {
    pub fn new(initial: Match, components: PipelineComponents) -> Self {
        let match_id = initial.match_id.clone();
        let known = components
            .ledger
            .as_ref()
            .map(|l| l.keys_for(&match_id))
            .unwrap_or_default();
        if !known.is_empty() {
            info!(match_id = %match_id, keys = known.len(), "Dedup keys restored from ledger");
        }

        Self {
            tracker: LifecycleTracker::new(&match_id, components.settings.windows),
            dedup: Deduplicator::with_keys(&match_id, known),
            adapters: (components.adapters)(&match_id),
            backlog: VecDeque::new(),
            last_refresh: None,
            state: initial,
            components,
        }
    }

    pub fn match_id(&self) -> &str {
        &self.state.match_id
    }

    pub fn current(&self) -> &Match {
        &self.state
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> WorkerState {
        self.tracker.state(now)
    }

    /// Run passes until cancelled or evicted. The in-flight pass always
    /// completes; cancellation is only observed between passes.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>, reports: mpsc::Sender<PassReport>) {
        let mut interval = tokio::time::interval(self.components.settings.pass_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(match_id = %self.state.match_id, "Match worker started");

        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_pass(Utc::now()).await;
                    let evicted = report.state == Some(WorkerState::Evicted);
                    if reports.send(report).await.is_err() {
                        debug!(match_id = %self.state.match_id, "Report channel closed");
                        break;
                    }
                    if evicted {
                        break;
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            match_id = %self.state.match_id,
            seen = self.dedup.len(),
            backlog = self.backlog.len(),
            "Match worker stopped"
        );
    }

    // -- Lifecycle ---------------------------------------------------------

    fn refresh_due(&self) -> bool {
        if self.tracker.phase() == Some(Phase::Finished) {
            return false;
        }
        match self.last_refresh {
            None => true,
            Some(at) => at.elapsed() >= self.components.settings.lifecycle_interval,
        }
    }

    /// Poll the match-state service and fold the snapshot in.
    /// Returns false when the service could not be reached.
    pub async fn refresh_lifecycle(&mut self, now: DateTime<Utc>) -> bool {
        self.last_refresh = Some(Instant::now());
        match self.components.match_source.snapshot(&self.state.match_id).await {
            Ok(snapshot) => {
                self.apply_snapshot(snapshot, now);
                true
            }
            Err(e) => {
                warn!(
                    match_id = %self.state.match_id,
                    category = e.category(),
                    error = %e,
                    "Lifecycle check failed, keeping previous phase"
                );
                false
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: MatchSnapshot, now: DateTime<Utc>) {
        if !snapshot.home.name.is_empty() {
            self.state.home = snapshot.home;
        }
        if !snapshot.away.name.is_empty() {
            self.state.away = snapshot.away;
        }
        if let Some(home) = snapshot.home_score {
            self.state.score.home = home;
        }
        if let Some(away) = snapshot.away_score {
            self.state.score.away = away;
        }
        if snapshot.clock.is_some() {
            self.state.clock = snapshot.clock;
        }
        if snapshot.kickoff.is_some() {
            self.state.kickoff = snapshot.kickoff;
        }
        self.tracker.observe(&snapshot.status, now);
        self.state.phase = self.tracker.phase();
    }

    /// Synthetic lifecycle events: the pre-match analysis block and the
    /// kickoff announcement. Both are keyed once per match.
    fn lifecycle_events(&self, ctx: &MatchContext, now: DateTime<Utc>) -> Vec<MatchEvent> {
        let mut events = Vec::new();
        let has_teams = !ctx.home.name.is_empty() && !ctx.away.name.is_empty();
        if !has_teams {
            return events;
        }

        match self.tracker.phase() {
            Some(Phase::Scheduled) => {
                let key = dedup::lifecycle_key(&ctx.match_id, "prematch");
                let within_window = ctx
                    .kickoff
                    .map(|k| k - now <= self.components.settings.prematch_window)
                    .unwrap_or(false);
                if within_window && !self.dedup.contains(&key) {
                    events.push(MatchEvent {
                        match_id: ctx.match_id.clone(),
                        event_type: EventType::Analysis,
                        minute_label: prematch_label(&ctx.locale).to_string(),
                        minute_seconds: PREMATCH_MINUTE_SECONDS,
                        team: None,
                        player: None,
                        is_scoring: false,
                        source: SourceKind::Lifecycle,
                        dedup_key: key,
                        detail: format!("{} vs {}", ctx.home.name, ctx.away.name),
                    });
                }
            }
            Some(Phase::Live) => {
                let key = dedup::lifecycle_key(&ctx.match_id, "kickoff");
                if ctx.minute_seconds <= KICKOFF_ANNOUNCE_LIMIT_SECS && !self.dedup.contains(&key) {
                    events.push(MatchEvent {
                        match_id: ctx.match_id.clone(),
                        event_type: EventType::KickOff,
                        minute_label: "0'".to_string(),
                        minute_seconds: 0,
                        team: None,
                        player: None,
                        is_scoring: false,
                        source: SourceKind::Lifecycle,
                        dedup_key: key,
                        detail: format!("Kick-off: {} vs {}", ctx.home.name, ctx.away.name),
                    });
                }
            }
            _ => {}
        }
        events
    }

    // -- Pass --------------------------------------------------------------

    /// One orchestration pass. Never fails: every error is handled at the
    /// component where it occurs and only shows up as a count.
    pub async fn run_pass(&mut self, now: DateTime<Utc>) -> PassReport {
        let match_id = self.state.match_id.clone();
        let mut report = PassReport {
            match_id: match_id.clone(),
            ..PassReport::default()
        };

        if self.refresh_due() && !self.refresh_lifecycle(now).await {
            report.errors += 1;
        }

        let worker_state = self.tracker.state(now);
        report.state = Some(worker_state);
        report.score = self.state.score;

        if worker_state == WorkerState::Evicted {
            self.evict();
            report.finished_at = Some(Utc::now());
            return report;
        }

        let ctx = self.state.context(&self.components.settings.locale);

        // 1. Fan out to the adapters active in this phase.
        let active = self.tracker.active_sources(now);
        let polls = self
            .adapters
            .iter()
            .filter(|a| active.contains(&a.kind()))
            .map(|a| poll_guarded(a.as_ref(), &ctx));
        let outcomes = join_all(polls).await;

        // 2. Normalize, skipping anything already delivered.
        let mut batch_keys: HashSet<String> = self
            .backlog
            .iter()
            .map(|c| c.batch_key(&match_id))
            .collect();
        let mut fresh: Vec<Candidate> = self
            .lifecycle_events(&ctx, now)
            .into_iter()
            .filter(|e| batch_keys.insert(e.dedup_key.clone()))
            .map(Candidate::Event)
            .collect();

        for outcome in outcomes {
            if outcome.error.is_some() {
                report.errors += 1;
            }
            report.raw_events += outcome.events.len();

            for raw in outcome.events {
                let candidate = if raw.source == SourceKind::Audio {
                    Candidate::Transcript(raw)
                } else {
                    match self.components.normalizer.normalize(&raw, &ctx) {
                        Some(event) => Candidate::Event(event),
                        None => continue,
                    }
                };
                let key = candidate.batch_key(&match_id);
                if self.dedup.contains(&key) || !batch_keys.insert(key) {
                    report.duplicates += 1;
                    continue;
                }
                fresh.push(candidate);
            }
        }

        // 3. Cap generation work. Backlog is served first.
        let mut queue: VecDeque<Candidate> = std::mem::take(&mut self.backlog);
        queue.retain(|c| !self.dedup.contains(&c.batch_key(&match_id)));
        queue.extend(fresh);

        let cap = self.components.settings.max_per_pass;
        let selected: Vec<Candidate> = queue.drain(..queue.len().min(cap)).collect();
        self.handle_overflow(queue, &mut report);

        // 4. Generate, claim, publish.
        let mut delivered_keys = Vec::new();
        for candidate in selected {
            report.generation_calls += 1;
            match candidate {
                Candidate::Event(event) => {
                    let text = self.components.generator.generate(&event, &ctx).await;
                    match text {
                        Some(text) => {
                            self.deliver(&event, &text, &mut report, &mut delivered_keys).await;
                        }
                        None => {
                            // Dropped for good, never fabricated.
                            let _ = self.dedup.is_new(&event.dedup_key);
                            report.rejected += 1;
                        }
                    }
                }
                Candidate::Transcript(raw) => {
                    let _ = self.dedup.is_new(&dedup::source_key(&match_id, raw.source, &raw.sequence));
                    let drafted = self.components.generator.extract(&raw, &ctx).await;
                    match drafted {
                        Some(drafted) => {
                            for d in drafted {
                                self.deliver(&d.event, &d.text, &mut report, &mut delivered_keys)
                                    .await;
                            }
                        }
                        None => report.rejected += 1,
                    }
                }
            }
        }

        // 5. Persist what the store now has.
        if let Some(ledger) = &self.components.ledger {
            if let Err(e) = ledger.record(&match_id, &delivered_keys) {
                warn!(match_id = %match_id, error = %e, "Ledger write failed");
                report.errors += 1;
            }
        }

        report.finished_at = Some(Utc::now());
        log_pass_report(&report);
        report
    }

    fn handle_overflow(&mut self, overflow: VecDeque<Candidate>, report: &mut PassReport) {
        if overflow.is_empty() {
            return;
        }
        match self.components.settings.overflow_policy {
            OverflowPolicy::Drop => {
                report.dropped += overflow.len();
                debug!(match_id = %self.state.match_id, dropped = overflow.len(), "Overflow dropped");
            }
            OverflowPolicy::Defer => {
                report.deferred += overflow.len();
                self.backlog = overflow;
                let limit = self.components.settings.backlog_limit;
                while self.backlog.len() > limit {
                    self.backlog.pop_front();
                    report.dropped += 1;
                    report.deferred -= 1;
                }
            }
        }
    }

    async fn deliver(
        &mut self,
        event: &MatchEvent,
        text: &str,
        report: &mut PassReport,
        delivered: &mut Vec<String>,
    ) {
        if !self.dedup.is_new(&event.dedup_key) {
            debug!(match_id = %event.match_id, dedup_key = %event.dedup_key, "Duplicate suppressed");
            report.duplicates += 1;
            return;
        }
        match self.components.publisher.publish(event, text).await {
            PublishOutcome::Published => {
                report.published += 1;
                delivered.push(event.dedup_key.clone());
            }
            PublishOutcome::Duplicate => {
                report.duplicates += 1;
                delivered.push(event.dedup_key.clone());
            }
            PublishOutcome::Failed => report.failed += 1,
        }
    }

    /// Release per-match state once retention has passed.
    fn evict(&mut self) {
        self.dedup.clear();
        self.backlog.clear();
        if let Some(ledger) = &self.components.ledger {
            if let Err(e) = ledger.forget(&self.state.match_id) {
                warn!(match_id = %self.state.match_id, error = %e, "Ledger cleanup failed");
            }
        }
        info!(match_id = %self.state.match_id, "Match evicted");
    }
}

fn prematch_label(locale: &str) -> &'static str {
    match locale {
        "fr" => "Avant-match",
        _ => "Pre-match",
    }
}

/// Log a pass summary.
fn log_pass_report(report: &PassReport) {
    let busy = report.raw_events + report.generation_calls + report.errors > 0;
    if !busy {
        debug!(match_id = %report.match_id, state = ?report.state, "Quiet pass");
        return;
    }
    info!(
        match_id = %report.match_id,
        state = ?report.state,
        score = %report.score,
        raw = report.raw_events,
        calls = report.generation_calls,
        published = report.published,
        duplicates = report.duplicates,
        failed = report.failed,
        rejected = report.rejected,
        deferred = report.deferred,
        dropped = report.dropped,
        errors = report.errors,
        "Pass complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
