//! Supervisor: decides which matches get a worker, spawns one task per
//! match, folds their pass reports into the status board, and shuts
//! them down on request.
//!
//! Workers never share mutable state with each other or with the
//! supervisor; reports flow over an `mpsc` channel and cancellation over
//! a per-worker `watch` channel.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lifecycle::phase_from_status;
use super::orchestrator::PipelineComponents;
use crate::config::WorkerConfig;
use crate::dashboard::routes::AppState;
use crate::sources::ScheduledMatch;
use crate::types::{Match, PassReport, Phase, WorkerState};

const REPORT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Match ids tracked regardless of discovery.
    pub matches: Vec<String>,
    pub discover: bool,
    pub discover_interval: Duration,
    pub horizon: chrono::Duration,
    pub shutdown_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self {
            matches: cfg.matches.clone(),
            discover: cfg.discover,
            discover_interval: Duration::from_secs(cfg.discover_interval_secs.max(1)),
            horizon: chrono::Duration::hours(cfg.discover_horizon_hours),
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
        }
    }
}

struct WorkerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Why a candidate match did not get a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    AlreadyTracked,
    Tombstoned,
    AlreadyFinished,
    OutsideHorizon,
}

pub struct Supervisor {
    components: PipelineComponents,
    board: AppState,
    settings: SupervisorSettings,
    workers: HashMap<String, WorkerHandle>,
    tombstones: HashSet<String>,
    reports_tx: mpsc::Sender<PassReport>,
    reports_rx: mpsc::Receiver<PassReport>,
}

impl Supervisor {
    pub fn new(components: PipelineComponents, board: AppState, settings: SupervisorSettings) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            components,
            board,
            settings,
            workers: HashMap::new(),
            tombstones: HashSet::new(),
            reports_tx,
            reports_rx,
        }
    }

    pub fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_tombstoned(&self, match_id: &str) -> bool {
        self.tombstones.contains(match_id)
    }

    /// Start a worker for `candidate` unless it is known, evicted, already
    /// over, or too far in the future. Explicitly configured ids bypass
    /// the horizon check.
    pub async fn admit(&mut self, candidate: &ScheduledMatch, now: DateTime<Utc>, explicit: bool) -> Admission {
        let match_id = candidate.match_id.as_str();
        if self.workers.contains_key(match_id) {
            return Admission::AlreadyTracked;
        }
        if self.tombstones.contains(match_id) {
            return Admission::Tombstoned;
        }

        let phase = phase_from_status(&candidate.status);
        if phase == Some(Phase::Finished) {
            debug!(match_id, status = %candidate.status, "Match already over, not tracking");
            return Admission::AlreadyFinished;
        }
        if !explicit && phase != Some(Phase::Live) {
            let within = candidate
                .kickoff
                .map(|k| k - now <= self.settings.horizon)
                .unwrap_or(false);
            if !within {
                return Admission::OutsideHorizon;
            }
        }

        let mut initial = Match::new(match_id);
        initial.kickoff = candidate.kickoff;
        let worker = self.components.worker_for(initial);

        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(cancel_rx, self.reports_tx.clone()));
        self.workers.insert(match_id.to_string(), WorkerHandle { cancel, task });
        self.board.track(match_id).await;

        info!(
            match_id,
            name = %candidate.name,
            status = %candidate.status,
            kickoff = ?candidate.kickoff,
            "Match worker spawned"
        );
        Admission::Started
    }

    /// Check configured ids and, when enabled, the scoreboard.
    /// Returns how many workers were started.
    pub async fn discover(&mut self, now: DateTime<Utc>) -> usize {
        let mut started = 0;
        let source = self.components.match_source.clone();

        for match_id in self.settings.matches.clone() {
            if self.workers.contains_key(&match_id) || self.tombstones.contains(&match_id) {
                continue;
            }
            // The first observation decides whether the match is worth a worker.
            match source.snapshot(&match_id).await {
                Ok(snapshot) => {
                    let candidate = ScheduledMatch {
                        name: format!("{} vs {}", snapshot.home.name, snapshot.away.name),
                        match_id: snapshot.match_id,
                        status: snapshot.status,
                        kickoff: snapshot.kickoff,
                    };
                    if self.admit(&candidate, now, true).await == Admission::Started {
                        started += 1;
                    }
                }
                Err(e) => {
                    warn!(match_id = %match_id, error = %e, "Configured match not reachable yet");
                }
            }
        }

        if self.settings.discover {
            match source.schedule().await {
                Ok(schedule) => {
                    for candidate in &schedule {
                        if self.admit(candidate, now, false).await == Admission::Started {
                            started += 1;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Scoreboard discovery failed"),
            }
        }
        started
    }

    /// Fold one pass report into the board; retire evicted workers.
    pub async fn handle_report(&mut self, report: PassReport) {
        self.board.record(&report).await;
        if report.state == Some(WorkerState::Evicted) {
            self.workers.remove(&report.match_id);
            self.tombstones.insert(report.match_id.clone());
            self.board.evict(&report.match_id).await;
            info!(match_id = %report.match_id, "Match retired");
        }
    }

    /// Drop handles of workers that exited without an eviction report.
    async fn reap(&mut self) {
        let done: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, h)| h.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for match_id in done {
            if let Some(handle) = self.workers.remove(&match_id) {
                if let Err(e) = handle.task.await {
                    error!(match_id = %match_id, error = %e, "Match worker crashed");
                }
            }
        }
    }

    /// Drive discovery and reports until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut discover_tick = tokio::time::interval(self.settings.discover_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = discover_tick.tick() => {
                    self.reap().await;
                    let started = self.discover(Utc::now()).await;
                    if started > 0 {
                        info!(started, tracked = self.workers.len(), "Discovery round complete");
                    }
                }
                Some(report) = self.reports_rx.recv() => {
                    self.handle_report(report).await;
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received.");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    /// Cancel every worker, let in-flight passes finish, and wait up to the
    /// grace period before aborting stragglers.
    pub async fn shutdown(mut self) {
        let handles: Vec<(String, WorkerHandle)> = self.workers.drain().collect();
        if handles.is_empty() {
            return;
        }
        info!(workers = handles.len(), grace_secs = self.settings.shutdown_grace.as_secs(), "Stopping match workers");

        let mut tasks = Vec::with_capacity(handles.len());
        let mut aborts = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            // A worker that already exited has dropped its receiver.
            let _ = handle.cancel.send(true);
            aborts.push(handle.task.abort_handle());
            tasks.push(handle.task);
        }

        let joined = join_all(tasks);
        let deadline = tokio::time::sleep(self.settings.shutdown_grace);
        tokio::pin!(joined);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut joined => {
                    info!("All match workers stopped");
                    break;
                }
                Some(report) = self.reports_rx.recv() => {
                    self.handle_report(report).await;
                }
                _ = &mut deadline => {
                    warn!("Shutdown grace period elapsed, aborting remaining workers");
                    for abort in &aborts {
                        abort.abort();
                    }
                    break;
                }
            }
        }

        while let Ok(report) = self.reports_rx.try_recv() {
            self.handle_report(report).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
