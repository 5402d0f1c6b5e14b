//! Live chat adapter (YouTube Data API v3).
//!
//! Resolving a chat takes a lookup step: video id -> active live chat id.
//! The chat id is cached per adapter and invalidated after a run of empty
//! or failed fetches, since a stream that restarts gets a new chat. When
//! no video id is configured, a live-video search by team names can find
//! one. Messages pass a relevance filter before they become `RawEvent`s.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::SourceAdapter;
use crate::config::ChatConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{MatchContext, RawEvent, SourceKind};

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoItem {
    #[serde(default, rename = "liveStreamingDetails")]
    live: Option<LiveDetails>,
}

#[derive(Debug, Deserialize, Default)]
struct LiveDetails {
    #[serde(default, rename = "activeLiveChatId")]
    active_live_chat_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ChatPage {
    #[serde(default)]
    pub items: Vec<ChatMessage>,
    #[serde(default, rename = "nextPageToken")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub snippet: Snippet,
    #[serde(default, rename = "authorDetails")]
    pub author: Option<Author>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Snippet {
    #[serde(default, rename = "displayMessage")]
    pub display_message: String,
    #[serde(default, rename = "publishedAt")]
    pub published_at: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Author {
    #[serde(default, rename = "displayName")]
    pub display_name: String,
}

#[derive(Debug, Deserialize, Default)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize, Default)]
struct SearchItem {
    #[serde(default)]
    id: Option<SearchId>,
}

#[derive(Debug, Deserialize, Default)]
struct SearchId {
    #[serde(default, rename = "videoId")]
    video_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Relevance filter
// ---------------------------------------------------------------------------

/// Keyword heuristics or a length threshold; everything else is noise.
#[derive(Debug, Clone)]
pub struct RelevanceFilter {
    min_length: usize,
    /// Whole-word, case-insensitive match on any keyword.
    keywords: Option<Regex>,
}

impl RelevanceFilter {
    pub fn new(min_length: usize, keywords: &[String]) -> Self {
        let words: Vec<String> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();
        let keywords = if words.is_empty() {
            None
        } else {
            match Regex::new(&format!(r"(?i)\b(?:{})\b", words.join("|"))) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(error = %e, "Chat keywords unusable, length filter only");
                    None
                }
            }
        };
        Self { min_length, keywords }
    }

    pub fn is_relevant(&self, message: &str) -> bool {
        let message = message.trim();
        if message.chars().count() > self.min_length {
            return true;
        }
        self.keywords.as_ref().is_some_and(|re| re.is_match(message))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct YouTubeClient {
    http: Client,
    base_url: String,
    api_key: SecretString,
    max_results: u32,
}

impl YouTubeClient {
    pub fn new(cfg: &ChatConfig, api_key: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent("TOUCHLINE/0.1.0")
            .build()
            .context("Failed to build YouTube HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_results: cfg.max_results,
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str, query: &[(&str, &str)]) -> PipelineResult<T> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .query(&[("key", self.api_key.expose_secret().as_str())])
            .send()
            .await
            .map_err(|e| PipelineError::unavailable(SourceKind::Chat, format!("request error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::unavailable(SourceKind::Chat, format!("HTTP {status} from {path}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| PipelineError::MalformedData(format!("YouTube {path}: {e}")))
    }

    /// Active live chat id for a video, if the video is live.
    pub async fn live_chat_id(&self, video_id: &str) -> PipelineResult<Option<String>> {
        let list: VideoListResponse = self
            .get("videos", &[("part", "liveStreamingDetails"), ("id", video_id)])
            .await?;
        Ok(list
            .items
            .into_iter()
            .next()
            .and_then(|v| v.live)
            .and_then(|l| l.active_live_chat_id))
    }

    pub async fn messages(&self, chat_id: &str, page_token: Option<&str>) -> PipelineResult<ChatPage> {
        let max_results = self.max_results.to_string();
        let mut query = vec![
            ("liveChatId", chat_id),
            ("part", "snippet,authorDetails"),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        self.get("liveChat/messages", &query).await
    }

    /// First live video matching `query`.
    pub async fn search_live(&self, query: &str) -> PipelineResult<Option<String>> {
        let found: SearchResponse = self
            .get(
                "search",
                &[("part", "snippet"), ("eventType", "live"), ("type", "video"), ("q", query)],
            )
            .await?;
        Ok(found
            .items
            .into_iter()
            .find_map(|i| i.id.and_then(|id| id.video_id)))
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ChatState {
    video_id: Option<String>,
    chat_id: Option<String>,
    page_token: Option<String>,
    empty_streak: u32,
}

pub struct ChatAdapter {
    client: Arc<YouTubeClient>,
    filter: RelevanceFilter,
    configured_video: Option<String>,
    search_fallback: bool,
    invalidate_after: u32,
    timeout: Duration,
    state: Mutex<ChatState>,
}

impl ChatAdapter {
    pub fn new(
        client: Arc<YouTubeClient>,
        cfg: &ChatConfig,
        video_id: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            filter: RelevanceFilter::new(cfg.min_length, &cfg.keywords),
            configured_video: video_id,
            search_fallback: cfg.search_fallback,
            invalidate_after: cfg.invalidate_after_empty.max(1),
            timeout,
            state: Mutex::new(ChatState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn resolve_video(&self, ctx: &MatchContext) -> PipelineResult<String> {
        let cached = self.state().video_id.clone();
        if let Some(video) = cached {
            return Ok(video);
        }
        if let Some(video) = &self.configured_video {
            self.state().video_id = Some(video.clone());
            return Ok(video.clone());
        }
        if !self.search_fallback || ctx.home.name.is_empty() {
            return Err(PipelineError::unavailable(SourceKind::Chat, "no video configured"));
        }

        let query = format!("{} {} live", ctx.home.name, ctx.away.name);
        match self.client.search_live(&query).await? {
            Some(video) => {
                info!(match_id = %ctx.match_id, video_id = %video, "Live video found by search");
                self.state().video_id = Some(video.clone());
                Ok(video)
            }
            None => Err(PipelineError::unavailable(SourceKind::Chat, "no live video found")),
        }
    }

    async fn resolve_chat(&self, ctx: &MatchContext) -> PipelineResult<String> {
        let cached = self.state().chat_id.clone();
        if let Some(chat) = cached {
            return Ok(chat);
        }
        let video = self.resolve_video(ctx).await?;
        match self.client.live_chat_id(&video).await? {
            Some(chat) => {
                info!(match_id = %ctx.match_id, video_id = %video, "Live chat resolved");
                self.state().chat_id = Some(chat.clone());
                Ok(chat)
            }
            None => {
                self.record_empty(ctx);
                Err(PipelineError::unavailable(
                    SourceKind::Chat,
                    format!("video {video} has no active live chat"),
                ))
            }
        }
    }

    /// Count an empty or failed fetch; drop the cached ids past the threshold.
    fn record_empty(&self, ctx: &MatchContext) {
        let mut state = self.state();
        state.empty_streak += 1;
        if state.empty_streak >= self.invalidate_after {
            info!(
                match_id = %ctx.match_id,
                streak = state.empty_streak,
                "Chat lookup invalidated"
            );
            state.chat_id = None;
            state.page_token = None;
            state.empty_streak = 0;
            if self.configured_video.is_none() {
                state.video_id = None;
            }
        }
    }

    pub fn to_raw_events(&self, messages: &[ChatMessage]) -> Vec<RawEvent> {
        messages
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.id.is_empty() && self.filter.is_relevant(&m.snippet.display_message))
            .map(|(index, m)| {
                let order = m
                    .snippet
                    .published_at
                    .as_deref()
                    .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
                    .map(|t| t.with_timezone(&Utc).timestamp_millis())
                    .unwrap_or(index as i64);
                RawEvent {
                    source: SourceKind::Chat,
                    sequence: m.id.clone(),
                    order,
                    text: m.snippet.display_message.clone(),
                    metadata: json!({
                        "author": m.author.as_ref().map(|a| a.display_name.clone()),
                        "published_at": m.snippet.published_at,
                    }),
                }
            })
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for ChatAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Chat
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn poll(&self, ctx: &MatchContext) -> PipelineResult<Vec<RawEvent>> {
        let chat_id = self.resolve_chat(ctx).await?;
        let page_token = self.state().page_token.clone();

        let page = match self.client.messages(&chat_id, page_token.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                self.record_empty(ctx);
                return Err(e);
            }
        };

        if page.next_page_token.is_some() {
            self.state().page_token = page.next_page_token.clone();
        }
        if page.items.is_empty() {
            self.record_empty(ctx);
            return Ok(Vec::new());
        }
        self.state().empty_streak = 0;

        let events = self.to_raw_events(&page.items);
        debug!(
            match_id = %ctx.match_id,
            fetched = page.items.len(),
            relevant = events.len(),
            "Chat messages filtered"
        );
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
