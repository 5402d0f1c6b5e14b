//! End-to-end pass scenarios: adapters → normalizer → generator →
//! deduplicator → publisher, with every external service mocked.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use touchline::config::OverflowPolicy;
use touchline::engine::publisher::CommentaryStore;
use touchline::sources::SourceAdapter;
use touchline::storage::{delete_ledger, LedgerStore};
use touchline::types::{Match, SourceKind, WorkerState};

use crate::mock_sources::*;

const MATCH_ID: &str = "732145";

fn adapters(list: Vec<ScriptedAdapter>) -> Vec<Arc<dyn SourceAdapter>> {
    list.into_iter()
        .map(|a| Arc::new(a) as Arc<dyn SourceAdapter>)
        .collect()
}

fn fouls(n: usize) -> Vec<touchline::types::RawEvent> {
    (0..n)
        .map(|i| play(&format!("{}", 1000 + i), i as i64, "Foul", &format!("Foul by player {i}"), "30'"))
        .collect()
}

fn temp_ledger() -> String {
    std::env::temp_dir()
        .join(format!("touchline_it_ledger_{}.json", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string()
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_chat_message_published_once() {
    let message = "Quelle ambiance au stade ce soir";
    let chat_adapter = ScriptedAdapter::new(
        SourceKind::Chat,
        vec![
            vec![chat("m1", 1, message), chat("m1", 1, message)],
            vec![chat("m1", 1, message)],
        ],
    );
    let h = harness(
        adapters(vec![chat_adapter]),
        Arc::new(MockLlm::new()),
        Arc::new(MockMatchSource::new(&["in"])),
        HarnessOptions::default(),
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));

    let first = worker.run_pass(chrono::Utc::now()).await;
    let second = worker.run_pass(chrono::Utc::now()).await;

    assert_eq!(first.published, 1);
    assert_eq!(first.duplicates, 1);
    assert_eq!(second.published, 0);
    assert_eq!(second.duplicates, 1);
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.llm.call_count(), 1);

    let payload = &h.store.payloads()[0];
    assert_eq!(payload.source, "chat");
    assert!(!payload.is_scoring);
    assert!((payload.confidence - 0.6).abs() < 1e-9);
}

async fn single_pass_into(store: Arc<dyn CommentaryStore>) -> touchline::types::PassReport {
    let h = harness(
        adapters(vec![ScriptedAdapter::new(SourceKind::Feed, vec![fouls(3)])]),
        Arc::new(MockLlm::new()),
        Arc::new(MockMatchSource::new(&["pre"])),
        HarnessOptions {
            store: Some(store),
            ..HarnessOptions::default()
        },
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));
    worker.run_pass(chrono::Utc::now()).await
}

#[tokio::test]
async fn test_store_duplicate_counts_as_success() {
    let shared = Arc::new(touchline::engine::publisher::InMemoryStore::new());

    // Two workers with no shared dedup state, as after a restart without a ledger.
    let first = single_pass_into(shared.clone()).await;
    let second = single_pass_into(shared.clone()).await;

    assert_eq!(first.published, 3);
    assert_eq!(second.published, 0);
    assert_eq!(second.duplicates, 3);
    assert_eq!(second.failed, 0);
    assert_eq!(shared.len(), 3);
}

#[tokio::test]
async fn test_restart_with_ledger_does_not_resubmit() {
    let path = temp_ledger();

    let first_store = {
        let h = harness(
            adapters(vec![ScriptedAdapter::new(SourceKind::Feed, vec![fouls(3)]).repeating()]),
            Arc::new(MockLlm::new()),
            Arc::new(MockMatchSource::new(&["pre"])),
            HarnessOptions {
                ledger: Some(Arc::new(LedgerStore::open(&path).unwrap())),
                ..HarnessOptions::default()
            },
        );
        let mut worker = h.components.worker_for(Match::new(MATCH_ID));
        let report = worker.run_pass(chrono::Utc::now()).await;
        assert_eq!(report.published, 3);
        h.store
    };

    // Fresh process: new store handle, new generator, ledger reopened from disk.
    let llm = Arc::new(MockLlm::new());
    let h = harness(
        adapters(vec![ScriptedAdapter::new(SourceKind::Feed, vec![fouls(3)]).repeating()]),
        llm.clone(),
        Arc::new(MockMatchSource::new(&["pre"])),
        HarnessOptions {
            ledger: Some(Arc::new(LedgerStore::open(&path).unwrap())),
            ..HarnessOptions::default()
        },
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));
    let report = worker.run_pass(chrono::Utc::now()).await;

    assert_eq!(report.published, 0);
    assert_eq!(report.duplicates, 3);
    assert_eq!(llm.call_count(), 0);
    assert!(h.store.is_empty());
    assert_eq!(first_store.len(), 3);

    delete_ledger(Some(&path)).unwrap();
}

#[tokio::test]
async fn test_feed_kickoff_merges_with_lifecycle_kickoff() {
    let source = Arc::new(MockMatchSource::new(&["in"]));
    *source.clock.lock().unwrap() = Some("1'".into());
    let feed = ScriptedAdapter::new(
        SourceKind::Feed,
        vec![vec![play("k1", 0, "Kickoff", "First half begins.", "1'")]],
    );
    let h = harness(adapters(vec![feed]), Arc::new(MockLlm::new()), source, HarnessOptions::default());
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));

    let report = worker.run_pass(chrono::Utc::now()).await;
    assert_eq!(report.published, 1);
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.store.payloads()[0].event_type, "kickoff");
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rate_limit_defers_overflow() {
    let h = harness(
        adapters(vec![ScriptedAdapter::new(SourceKind::Feed, vec![fouls(50)])]),
        Arc::new(MockLlm::new()),
        Arc::new(MockMatchSource::new(&["pre"])),
        HarnessOptions::default(),
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));

    let report = worker.run_pass(chrono::Utc::now()).await;
    assert_eq!(report.raw_events, 50);
    assert_eq!(report.generation_calls, 10);
    assert_eq!(h.llm.call_count(), 10);
    assert_eq!(report.deferred, 40);
    assert_eq!(report.dropped, 0);

    // The backlog drains ten at a time even though the source went quiet.
    let mut total = report.published;
    for _ in 0..4 {
        total += worker.run_pass(chrono::Utc::now()).await.published;
    }
    assert_eq!(total, 50);
    assert_eq!(worker.backlog_len(), 0);
    assert_eq!(h.store.len(), 50);
}

#[tokio::test]
async fn test_rate_limit_drop_policy() {
    let h = harness(
        adapters(vec![ScriptedAdapter::new(SourceKind::Feed, vec![fouls(50)])]),
        Arc::new(MockLlm::new()),
        Arc::new(MockMatchSource::new(&["pre"])),
        HarnessOptions {
            overflow_policy: OverflowPolicy::Drop,
            ..HarnessOptions::default()
        },
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));

    let report = worker.run_pass(chrono::Utc::now()).await;
    assert_eq!(report.generation_calls, 10);
    assert_eq!(report.dropped, 40);
    assert_eq!(report.deferred, 0);

    let next = worker.run_pass(chrono::Utc::now()).await;
    assert_eq!(next.generation_calls, 0);
    assert_eq!(h.llm.call_count(), 10);
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_hung_adapter_does_not_block_pass() {
    let feed = ScriptedAdapter::new(
        SourceKind::Feed,
        vec![vec![play("1", 0, "Corner", "Corner, Senegal.", "14'")]],
    );
    let chat_adapter = ScriptedAdapter::new(SourceKind::Chat, vec![vec![chat("m1", 1, "anyone watching?")]])
        .slow(Duration::from_secs(5), Duration::from_millis(100));
    let h = harness(
        adapters(vec![feed, chat_adapter]),
        Arc::new(MockLlm::new()),
        Arc::new(MockMatchSource::new(&["in"])),
        HarnessOptions::default(),
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));

    let started = Instant::now();
    let report = worker.run_pass(chrono::Utc::now()).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.errors, 1);
    assert_eq!(report.published, 1);
    assert_eq!(h.store.payloads()[0].event_type, "corner");
}

#[tokio::test]
async fn test_generation_failure_never_fabricates() {
    let llm = Arc::new(MockLlm::new());
    llm.set_error("provider down");
    let h = harness(
        adapters(vec![ScriptedAdapter::new(SourceKind::Feed, vec![fouls(2)]).repeating()]),
        llm.clone(),
        Arc::new(MockMatchSource::new(&["pre"])),
        HarnessOptions::default(),
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));

    let report = worker.run_pass(chrono::Utc::now()).await;
    assert_eq!(report.rejected, 2);
    assert_eq!(report.published, 0);
    assert!(h.store.is_empty());

    // Rejected events are not retried on the next pass.
    let next = worker.run_pass(chrono::Utc::now()).await;
    assert_eq!(next.generation_calls, 0);
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn test_feed_outage_keeps_phase() {
    let source = Arc::new(MockMatchSource::new(&["in"]));
    let h = harness(Vec::new(), Arc::new(MockLlm::new()), source.clone(), HarnessOptions::default());
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));

    assert_eq!(worker.run_pass(chrono::Utc::now()).await.state, Some(WorkerState::Live));

    h.source.set_error("HTTP 503");
    let report = worker.run_pass(chrono::Utc::now()).await;
    assert_eq!(report.state, Some(WorkerState::Live));
    assert_eq!(report.errors, 1);

    source.clear_error();
    assert_eq!(worker.run_pass(chrono::Utc::now()).await.errors, 0);
}

// ---------------------------------------------------------------------------
// Audio extraction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ungrounded_goal_downgraded_to_shot() {
    let reply = r#"{"events":[{"type":"goal","time":"34'","text":"Mané frappe fort, le poteau sauve le gardien !","player":"Sadio Mané","team":"Senegal"}]}"#;
    let audio = ScriptedAdapter::new(
        SourceKind::Audio,
        vec![vec![transcript(1, "Quelle frappe de Mané, sur le poteau, incroyable !")]],
    );
    let h = harness(
        adapters(vec![audio]),
        Arc::new(MockLlm::with_extractions(&[reply])),
        Arc::new(MockMatchSource::new(&["in"])),
        HarnessOptions::default(),
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));

    let report = worker.run_pass(chrono::Utc::now()).await;
    assert_eq!(report.generation_calls, 1);
    assert_eq!(report.published, 1);

    let payload = &h.store.payloads()[0];
    assert_eq!(payload.event_type, "shot");
    assert!(!payload.is_scoring);
    assert_eq!(payload.source, "audio");
    assert_eq!(payload.time, "34'");
    assert!(payload.dedup_key.starts_with("heur:"));
}

#[tokio::test]
async fn test_ledger_keeps_drafted_keys_not_chunk_keys() {
    let path = temp_ledger();
    let ledger = Arc::new(LedgerStore::open(&path).unwrap());
    let reply = r#"{"events":[{"type":"corner","time":"40'","text":"Corner pour le Sénégal.","team":"Senegal"}]}"#;
    let audio = ScriptedAdapter::new(
        SourceKind::Audio,
        vec![vec![transcript(7, "Corner pour le Sénégal, côté droit.")]],
    );
    let h = harness(
        adapters(vec![audio]),
        Arc::new(MockLlm::with_extractions(&[reply])),
        Arc::new(MockMatchSource::new(&["in"])),
        HarnessOptions {
            ledger: Some(ledger.clone()),
            ..HarnessOptions::default()
        },
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));
    worker.run_pass(chrono::Utc::now()).await;

    let corner = h
        .store
        .payloads()
        .into_iter()
        .find(|p| p.event_type == "corner")
        .unwrap();
    let keys = ledger.keys_for(MATCH_ID);
    assert!(keys.contains(&corner.dedup_key));
    let chunk_key = touchline::engine::dedup::source_key(MATCH_ID, SourceKind::Audio, "chunk-7");
    assert!(!keys.contains(&chunk_key));

    delete_ledger(Some(&path)).unwrap();
}

#[tokio::test]
async fn test_confirmed_goal_published_as_scoring() {
    let reply = r#"Voici: {"events":[{"type":"goal","time":"52'","text":"BUT ! Sadio Mané ouvre le score pour le Sénégal !","player":"Sadio Mané","team":"Senegal"}]}"#;
    let audio = ScriptedAdapter::new(
        SourceKind::Audio,
        vec![vec![transcript(1, "BUT ! Sadio Mané marque pour le Sénégal !")]],
    );
    let h = harness(
        adapters(vec![audio]),
        Arc::new(MockLlm::with_extractions(&[reply])),
        Arc::new(MockMatchSource::new(&["in"])),
        HarnessOptions::default(),
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));
    worker.run_pass(chrono::Utc::now()).await;

    let payload = &h.store.payloads()[0];
    assert_eq!(payload.event_type, "goal");
    assert!(payload.is_scoring);
    assert_eq!(payload.team.as_deref(), Some("Senegal"));
    assert_eq!(payload.player_name.as_deref(), Some("Sadio Mané"));
}

#[tokio::test]
async fn test_malformed_extraction_discards_whole_chunk() {
    let reply = r#"{"events":[{"type":"corner","time":"40'","text":"Corner pour le Sénégal."},{"type":"bicycle","text":"???"}]}"#;
    let audio = ScriptedAdapter::new(
        SourceKind::Audio,
        vec![vec![transcript(1, "corner pour le Sénégal, et puis une bicyclette")]],
    );
    let h = harness(
        adapters(vec![audio]),
        Arc::new(MockLlm::with_extractions(&[reply])),
        Arc::new(MockMatchSource::new(&["in"])),
        HarnessOptions::default(),
    );
    let mut worker = h.components.worker_for(Match::new(MATCH_ID));

    let report = worker.run_pass(chrono::Utc::now()).await;
    assert_eq!(report.rejected, 1);
    assert_eq!(report.published, 0);
    assert!(h.store.is_empty());
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_worker_loop_phase_is_monotonic() {
    let h = harness(
        Vec::new(),
        Arc::new(MockLlm::new()),
        Arc::new(MockMatchSource::new(&["pre", "in", "pre", "post"])),
        HarnessOptions::default(),
    );
    let worker = h.components.worker_for(Match::new(MATCH_ID));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (tx, mut rx) = mpsc::channel(16);
    let task = tokio::spawn(worker.run(cancel_rx, tx));

    let mut states = Vec::new();
    while states.len() < 4 {
        let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("report in time")
            .expect("channel open");
        states.push(report.state);
    }
    assert_eq!(
        states,
        vec![
            Some(WorkerState::Scheduled),
            Some(WorkerState::Live),
            Some(WorkerState::Live),
            Some(WorkerState::Finished),
        ]
    );

    cancel_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("worker stops on cancel")
        .unwrap();
}
