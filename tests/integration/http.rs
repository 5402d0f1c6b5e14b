//! HTTP clients exercised against local Axum servers.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use touchline::config::ChatConfig;
use touchline::engine::publisher::{HttpCommentaryStore, PublishOutcome, Publisher};
use touchline::sources::chat::{ChatAdapter, YouTubeClient};
use touchline::sources::feed::EspnClient;
use touchline::sources::{MatchStateSource, SourceAdapter};
use touchline::types::{EventType, Match, MatchEvent, SourceKind, Team};

/// Serve `app` on an ephemeral port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// Commentary store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreScript {
    statuses: Mutex<VecDeque<u16>>,
    calls: Mutex<Vec<(Option<String>, Value)>>,
}

async fn store_handler(
    State(script): State<Arc<StoreScript>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let secret = headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    script.calls.lock().unwrap().push((secret, body));
    let status = script.statuses.lock().unwrap().pop_front().unwrap_or(200);
    let code = StatusCode::from_u16(status).unwrap();
    (code, Json(json!({"ok": code.is_success(), "duplicate": false})))
}

async fn store_with(statuses: &[u16]) -> (String, Arc<StoreScript>) {
    let script = Arc::new(StoreScript {
        statuses: Mutex::new(statuses.iter().copied().collect()),
        ..StoreScript::default()
    });
    let app = Router::new()
        .route("/api/live-events", post(store_handler))
        .with_state(script.clone());
    let base = serve(app).await;
    (format!("{base}/api/live-events"), script)
}

fn publisher(url: &str) -> Publisher {
    let store = HttpCommentaryStore::new(
        url,
        Some(SecretString::new("hook-secret".to_string())),
        Duration::from_secs(5),
    )
    .unwrap();
    Publisher::new(Arc::new(store), "fr", 3, Duration::from_millis(10))
}

fn corner() -> MatchEvent {
    MatchEvent {
        match_id: "732145".into(),
        event_type: EventType::Corner,
        minute_label: "14'".into(),
        minute_seconds: 840,
        team: Some("Senegal".into()),
        player: None,
        is_scoring: false,
        source: SourceKind::Feed,
        dedup_key: "feed:abc123".into(),
        detail: "Corner, Senegal.".into(),
    }
}

#[tokio::test]
async fn test_store_retries_server_error_then_publishes() {
    let (url, script) = store_with(&[500, 200]).await;
    let outcome = publisher(&url).publish(&corner(), "Corner pour le Sénégal.").await;

    assert_eq!(outcome, PublishOutcome::Published);
    let calls = script.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0.as_deref(), Some("hook-secret"));
    assert_eq!(calls[1].1["match_id"], "732145");
    assert_eq!(calls[1].1["type"], "corner");
    assert_eq!(calls[1].1["dedup_key"], "feed:abc123");
    // Same event id on every attempt.
    assert_eq!(calls[0].1["event_id"], calls[1].1["event_id"]);
}

#[tokio::test]
async fn test_store_conflict_is_duplicate() {
    let (url, script) = store_with(&[409]).await;
    let outcome = publisher(&url).publish(&corner(), "Corner pour le Sénégal.").await;

    assert_eq!(outcome, PublishOutcome::Duplicate);
    assert_eq!(script.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_client_error_not_retried() {
    let (url, script) = store_with(&[400, 200]).await;
    let outcome = publisher(&url).publish(&corner(), "Corner pour le Sénégal.").await;

    assert_eq!(outcome, PublishOutcome::Failed);
    assert_eq!(script.calls.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

const SUMMARY: &str = r#"{
  "header": {"competitions": [{
    "date": "2025-12-23T20:00Z",
    "status": {"displayClock": "67'", "type": {"state": "in"}},
    "competitors": [
      {"homeAway": "home", "score": "2", "team": {"displayName": "Senegal", "abbreviation": "SEN"}},
      {"homeAway": "away", "score": "1", "team": {"displayName": "DR Congo", "abbreviation": "COD"}}
    ]
  }]},
  "keyEvents": [
    {"id": "51", "type": {"text": "Goal"}, "text": "Goal! Senegal 1, DR Congo 0.", "clock": {"displayValue": "23'"}}
  ]
}"#;

const SCOREBOARD: &str = r#"{"events": [
  {"id": "732145", "date": "2025-12-23T20:00Z", "name": "DR Congo at Senegal", "status": {"type": {"state": "in"}}},
  {"id": "732146", "date": "2025-12-24T17:00Z", "name": "Mali at Zambia", "status": {"type": {"state": "pre"}}}
]}"#;

async fn summary_handler(Query(params): Query<HashMap<String, String>>) -> (StatusCode, String) {
    match params.get("event").map(String::as_str) {
        Some("732145") => (StatusCode::OK, SUMMARY.to_string()),
        _ => (StatusCode::NOT_FOUND, "{}".to_string()),
    }
}

async fn feed_server() -> String {
    let app = Router::new()
        .route("/summary", get(summary_handler))
        .route("/scoreboard", get(|| async { SCOREBOARD }));
    serve(app).await
}

#[tokio::test]
async fn test_espn_summary_and_scoreboard() {
    let base = feed_server().await;
    let client = EspnClient::new(&base, Duration::from_secs(5)).unwrap();

    let snap = client.snapshot("732145").await.unwrap();
    assert_eq!(snap.status, "in");
    assert_eq!(snap.home.name, "Senegal");
    assert_eq!(snap.home_score, Some(2));
    assert_eq!(snap.clock.as_deref(), Some("67'"));
    assert_eq!(snap.plays.len(), 1);

    let schedule = client.schedule().await.unwrap();
    assert_eq!(schedule.len(), 2);
    assert_eq!(schedule[1].status, "pre");
}

#[tokio::test]
async fn test_espn_http_error_is_source_unavailable() {
    let base = feed_server().await;
    let client = EspnClient::new(&base, Duration::from_secs(5)).unwrap();

    let err = client.snapshot("999").await.unwrap_err();
    assert_eq!(err.category(), "source_unavailable");
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Default)]
struct YouTubeLog {
    page_tokens: Mutex<Vec<Option<String>>>,
    searches: Mutex<Vec<String>>,
}

async fn videos(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    assert_eq!(params.get("key").map(String::as_str), Some("yt-key"));
    match params.get("id").map(String::as_str) {
        Some("vid-live") => Json(json!({"items": [{"liveStreamingDetails": {"activeLiveChatId": "chat-1"}}]})),
        _ => Json(json!({"items": []})),
    }
}

async fn messages(
    State(log): State<Arc<YouTubeLog>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    assert_eq!(params.get("liveChatId").map(String::as_str), Some("chat-1"));
    let token = params.get("pageToken").cloned();
    log.page_tokens.lock().unwrap().push(token.clone());
    match token.as_deref() {
        None => Json(json!({
            "nextPageToken": "page-2",
            "items": [
                {"id": "m1", "snippet": {"displayMessage": "Quelle ambiance au stade ce soir", "publishedAt": "2025-12-23T20:30:00Z"}, "authorDetails": {"displayName": "fan"}},
                {"id": "m2", "snippet": {"displayMessage": "lol", "publishedAt": "2025-12-23T20:30:01Z"}}
            ]
        })),
        _ => Json(json!({"nextPageToken": "page-3", "items": []})),
    }
}

async fn search(State(log): State<Arc<YouTubeLog>>, Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    log.searches
        .lock()
        .unwrap()
        .push(params.get("q").cloned().unwrap_or_default());
    Json(json!({"items": [{"id": {"videoId": "vid-live"}}]}))
}

async fn youtube_server() -> (String, Arc<YouTubeLog>) {
    let log = Arc::new(YouTubeLog::default());
    let app = Router::new()
        .route("/videos", get(videos))
        .route("/liveChat/messages", get(messages))
        .route("/search", get(search))
        .with_state(log.clone());
    (serve(app).await, log)
}

fn chat_adapter(base: &str, video: Option<&str>, search_fallback: bool) -> ChatAdapter {
    let cfg = ChatConfig {
        base_url: base.to_string(),
        search_fallback,
        ..ChatConfig::default()
    };
    let client = Arc::new(YouTubeClient::new(&cfg, SecretString::new("yt-key".to_string())).unwrap());
    ChatAdapter::new(client, &cfg, video.map(str::to_string), Duration::from_secs(5))
}

fn live_match() -> Match {
    let mut m = Match::new("732145");
    m.home = Team::new("Senegal");
    m.away = Team::new("DR Congo");
    m
}

#[tokio::test]
async fn test_chat_adapter_pages_through_messages() {
    let (base, log) = youtube_server().await;
    let adapter = chat_adapter(&base, Some("vid-live"), false);
    let ctx = live_match().context("fr");

    let first = adapter.poll(&ctx).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].sequence, "m1");
    assert_eq!(first[0].source, SourceKind::Chat);
    assert_eq!(first[0].metadata["author"], "fan");

    let second = adapter.poll(&ctx).await.unwrap();
    assert!(second.is_empty());

    let tokens = log.page_tokens.lock().unwrap().clone();
    assert_eq!(tokens, vec![None, Some("page-2".to_string())]);
    assert!(log.searches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_chat_adapter_finds_video_by_search() {
    let (base, log) = youtube_server().await;
    let adapter = chat_adapter(&base, None, true);
    let ctx = live_match().context("fr");

    let events = adapter.poll(&ctx).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(log.searches.lock().unwrap().as_slice(), ["Senegal DR Congo live"]);
}

#[tokio::test]
async fn test_chat_adapter_without_live_chat_is_unavailable() {
    let (base, _log) = youtube_server().await;
    let adapter = chat_adapter(&base, Some("vid-offline"), false);
    let ctx = live_match().context("fr");

    let err = adapter.poll(&ctx).await.unwrap_err();
    assert_eq!(err.category(), "source_unavailable");
}
