//! Publisher: delivers generated commentary to the commentary store.
//!
//! Idempotent from the caller's side. The event id is derived from the
//! dedup key, so a retried or replayed submission carries the same id,
//! and a store-reported duplicate counts as success without retrying.
//! Transient failures get a bounded number of attempts with a fixed
//! backoff; after that the event is dropped and logged as data loss.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::dedup;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{MatchEvent, PublishedEventRecord};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body of `POST` to the commentary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentaryPayload {
    pub match_id: String,
    pub event_id: Uuid,
    pub dedup_key: String,
    pub time: String,
    pub time_seconds: i64,
    pub locale: String,
    pub text: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub team: Option<String>,
    pub player_name: Option<String>,
    pub icon: String,
    pub is_scoring: bool,
    pub confidence: f64,
    pub source: String,
}

impl CommentaryPayload {
    pub fn new(event: &MatchEvent, text: &str, locale: &str) -> Self {
        Self {
            match_id: event.match_id.clone(),
            event_id: dedup::event_id(&event.match_id, &event.dedup_key),
            dedup_key: event.dedup_key.clone(),
            time: event.minute_label.clone(),
            time_seconds: event.minute_seconds,
            locale: locale.to_string(),
            text: text.to_string(),
            event_type: event.event_type.wire_name().to_string(),
            team: event.team.clone(),
            player_name: event.player.clone(),
            icon: event.event_type.icon().to_string(),
            is_scoring: event.is_scoring,
            confidence: event.source.confidence(),
            source: event.source.as_str().to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct StoreReply {
    #[serde(default)]
    duplicate: bool,
}

/// What the store made of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResponse {
    Created,
    Duplicate,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Worth retrying: network errors, 429, 5xx.
    #[error("transient store error: {0}")]
    Transient(String),
    /// The store refused the payload. Retrying will not help.
    #[error("store rejected submission: {0}")]
    Rejected(String),
}

/// Commentary store seam. Production posts over HTTP; dry runs and tests
/// use the in-memory store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommentaryStore: Send + Sync {
    async fn submit(&self, payload: &CommentaryPayload) -> Result<StoreResponse, StoreError>;
}

// ---------------------------------------------------------------------------
// HTTP store
// ---------------------------------------------------------------------------

pub struct HttpCommentaryStore {
    http: Client,
    url: String,
    secret: Option<SecretString>,
}

impl HttpCommentaryStore {
    pub fn new(url: &str, secret: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("TOUCHLINE/0.1.0")
            .build()
            .context("Failed to build commentary store HTTP client")?;
        Ok(Self {
            http,
            url: url.to_string(),
            secret,
        })
    }
}

#[async_trait]
impl CommentaryStore for HttpCommentaryStore {
    async fn submit(&self, payload: &CommentaryPayload) -> Result<StoreResponse, StoreError> {
        let mut request = self.http.post(&self.url).json(payload);
        if let Some(secret) = &self.secret {
            request = request.header("x-webhook-secret", secret.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transient(format!("request error: {e}")))?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            return Ok(StoreResponse::Duplicate);
        }
        if status.is_success() {
            let reply: StoreReply = response.json().await.unwrap_or_default();
            return Ok(if reply.duplicate {
                StoreResponse::Duplicate
            } else {
                StoreResponse::Created
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(StoreError::Transient(format!("HTTP {status}: {body}")))
        } else {
            Err(StoreError::Rejected(format!("HTTP {status}: {body}")))
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Store that keeps records in memory and enforces `(matchId, dedupKey)`
/// uniqueness the way the real store does.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<(String, String), (PublishedEventRecord, CommentaryPayload)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PublishedEventRecord> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.values().map(|(r, _)| r.clone()).collect()
    }

    pub fn payloads(&self) -> Vec<CommentaryPayload> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.values().map(|(_, p)| p.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CommentaryStore for InMemoryStore {
    async fn submit(&self, payload: &CommentaryPayload) -> Result<StoreResponse, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let key = (payload.match_id.clone(), payload.dedup_key.clone());
        if records.contains_key(&key) {
            return Ok(StoreResponse::Duplicate);
        }
        info!(
            match_id = %payload.match_id,
            event_type = %payload.event_type,
            time = %payload.time,
            text = %payload.text,
            "Commentary stored (in-memory)"
        );
        let record = PublishedEventRecord {
            event_id: payload.event_id,
            match_id: payload.match_id.clone(),
            dedup_key: payload.dedup_key.clone(),
            published_at: Utc::now(),
        };
        records.insert(key, (record, payload.clone()));
        Ok(StoreResponse::Created)
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Result of one `publish` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Store already had it. Success for the caller.
    Duplicate,
    /// Dropped after bounded attempts or a hard rejection.
    Failed,
}

pub struct Publisher {
    store: std::sync::Arc<dyn CommentaryStore>,
    locale: String,
    max_attempts: u32,
    backoff: Duration,
}

impl Publisher {
    pub fn new(
        store: std::sync::Arc<dyn CommentaryStore>,
        locale: &str,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            store,
            locale: locale.to_string(),
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub async fn publish(&self, event: &MatchEvent, text: &str) -> PublishOutcome {
        let payload = CommentaryPayload::new(event, text, &self.locale);
        match self.submit_with_retry(&payload, event).await {
            Ok(StoreResponse::Created) => {
                info!(
                    match_id = %event.match_id,
                    event_id = %payload.event_id,
                    event_type = %event.event_type,
                    minute = %event.minute_label,
                    source = %event.source,
                    "Event published"
                );
                PublishOutcome::Published
            }
            Ok(StoreResponse::Duplicate) => {
                let conflict = PipelineError::PublishConflict {
                    dedup_key: event.dedup_key.clone(),
                };
                debug!(match_id = %event.match_id, reason = %conflict, "Duplicate treated as success");
                PublishOutcome::Duplicate
            }
            Err(failure) => {
                error!(match_id = %event.match_id, error = %failure, "Event dropped (data loss)");
                PublishOutcome::Failed
            }
        }
    }

    /// Submit with bounded retries on transient errors. The failure carries
    /// the number of attempts actually made.
    async fn submit_with_retry(
        &self,
        payload: &CommentaryPayload,
        event: &MatchEvent,
    ) -> PipelineResult<StoreResponse> {
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < self.max_attempts {
            attempts += 1;
            match self.store.submit(payload).await {
                Ok(response) => return Ok(response),
                Err(StoreError::Rejected(reason)) => {
                    last_error = reason;
                    break;
                }
                Err(StoreError::Transient(reason)) => {
                    warn!(
                        match_id = %event.match_id,
                        dedup_key = %event.dedup_key,
                        attempt = attempts,
                        error = %reason,
                        "Transient publish failure"
                    );
                    last_error = reason;
                    if attempts < self.max_attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        Err(PipelineError::PublishFailure {
            dedup_key: event.dedup_key.clone(),
            attempts,
            reason: last_error,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
