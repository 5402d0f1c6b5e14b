//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section has defaults, so a file naming only the tracked matches
//! is valid. Secrets (API keys, webhook secret) are referenced by env-var
//! name in the config and resolved at runtime into `SecretString`.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::error::PipelineError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub status: StatusConfig,
    /// Grammar table keyed by canonical team key ("ivoryCoast").
    #[serde(default)]
    pub teams: HashMap<String, TeamGrammar>,
    /// Stream references keyed by match id.
    #[serde(default)]
    pub streams: HashMap<String, StreamConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    pub locale: String,
    /// Match ids tracked regardless of discovery.
    pub matches: Vec<String>,
    /// Pull upcoming and live matches from the feed scoreboard.
    pub discover: bool,
    pub discover_interval_secs: u64,
    pub discover_horizon_hours: i64,
    pub pass_interval_secs: u64,
    pub lifecycle_interval_secs: u64,
    /// Default per-adapter poll timeout.
    pub adapter_timeout_secs: u64,
    /// Adapters keep running this long after Finished is observed.
    pub drain_secs: u64,
    /// Match state is evicted this long after Finished is observed.
    pub retention_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "TOUCHLINE-001".to_string(),
            locale: "fr".to_string(),
            matches: Vec::new(),
            discover: false,
            discover_interval_secs: 600,
            discover_horizon_hours: 48,
            pass_interval_secs: 30,
            lifecycle_interval_secs: 60,
            adapter_timeout_secs: 25,
            drain_secs: 300,
            retention_secs: 3600,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConfig {
    /// Base of the league endpoints; `/scoreboard` and `/summary` are appended.
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://site.api.espn.com/apis/site/v2/sports/soccer/caf.nations".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChatConfig {
    pub enabled: bool,
    pub api_key_env: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_results: u32,
    /// Messages longer than this are always relevant.
    pub min_length: usize,
    pub keywords: Vec<String>,
    /// Consecutive empty or failed fetches before the chat id is re-resolved.
    pub invalidate_after_empty: u32,
    /// Search for a live video when no video id is configured.
    pub search_fallback: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_env: "YOUTUBE_API_KEY".to_string(),
            base_url: "https://www.googleapis.com/youtube/v3".to_string(),
            timeout_secs: 20,
            max_results: 50,
            min_length: 20,
            keywords: ["goal", "but", "gol", "penalty", "card", "carton", "red", "yellow"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            invalidate_after_empty: 3,
            search_fallback: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub chunk_secs: u64,
    /// Capture plus transcription must finish within this.
    pub timeout_secs: u64,
    /// Bound on the transcription request alone; shorter than `timeout_secs`.
    pub transcription_timeout_secs: u64,
    pub failure_backoff_secs: u64,
    pub work_dir: String,
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
    pub transcription_url: String,
    pub transcription_model: String,
    pub api_key_env: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_secs: 30,
            timeout_secs: 120,
            transcription_timeout_secs: 45,
            failure_backoff_secs: 10,
            work_dir: std::env::temp_dir()
                .join("touchline-audio")
                .to_string_lossy()
                .to_string(),
            ytdlp_bin: "yt-dlp".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            transcription_url: "https://api.openai.com/v1".to_string(),
            transcription_model: "whisper-1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// "openai" (any chat-completions compatible endpoint) or "anthropic".
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    /// Override for OpenAI-compatible hosts (vLLM, OpenRouter).
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            max_tokens: 200,
            temperature: 0.7,
        }
    }
}

/// What happens to events beyond the per-pass generation cap.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Defer,
    Drop,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_per_pass: usize,
    pub min_interval_ms: u64,
    pub max_concurrent: usize,
    pub max_sentences: usize,
    pub banned_words: Vec<String>,
    pub overflow_policy: OverflowPolicy,
    pub backlog_limit: usize,
    pub prematch_window_hours: i64,
    pub audio_dedup_prefix_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_per_pass: 10,
            min_interval_ms: 1500,
            max_concurrent: 2,
            max_sentences: 2,
            banned_words: vec!["OH MON DIEU".to_string()],
            overflow_policy: OverflowPolicy::Defer,
            backlog_limit: 100,
            prematch_window_hours: 24,
            audio_dedup_prefix_chars: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub secret_env: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Log submissions to an in-memory store instead of posting.
    pub dry_run: bool,
    pub ledger_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000/api/can2025/live-commentary".to_string(),
            secret_env: "WEBHOOK_SECRET".to_string(),
            timeout_secs: 15,
            max_attempts: 3,
            backoff_ms: 2000,
            dry_run: false,
            ledger_path: "touchline_ledger.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8090,
        }
    }
}

/// Localized phrasing for one team, e.g. `fr = "la Côte d'Ivoire"`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TeamGrammar {
    /// Display names the feed may use for this team.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Locale -> phrase including the definite article.
    #[serde(default)]
    pub names: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StreamConfig {
    /// Video id whose live chat is polled.
    pub video_id: Option<String>,
    /// Audio stream URL; defaults to the watch URL of `video_id`.
    pub audio_url: Option<String>,
}

impl StreamConfig {
    pub fn audio_source(&self) -> Option<String> {
        self.audio_url.clone().or_else(|| {
            self.video_id
                .as_ref()
                .map(|id| format!("https://www.youtube.com/watch?v={id}"))
        })
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> { Err(PipelineError::Config(reason.to_string()).into()) };
        if self.generation.max_per_pass == 0 {
            return invalid("generation.max_per_pass must be at least 1");
        }
        if self.generation.max_concurrent == 0 {
            return invalid("generation.max_concurrent must be at least 1");
        }
        if self.store.max_attempts == 0 {
            return invalid("store.max_attempts must be at least 1");
        }
        if self.worker.retention_secs < self.worker.drain_secs {
            return invalid("worker.retention_secs must not be shorter than worker.drain_secs");
        }
        if self.audio.transcription_timeout_secs == 0
            || self.audio.transcription_timeout_secs >= self.audio.timeout_secs
        {
            return invalid("audio.transcription_timeout_secs must be positive and below audio.timeout_secs");
        }
        Ok(())
    }

    /// Resolve a secret, treating unset and empty variables alike.
    pub fn resolve_secret(env_name: &str) -> Option<SecretString> {
        std::env::var(env_name)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::new)
    }

    pub fn stream_for(&self, match_id: &str) -> StreamConfig {
        self.streams.get(match_id).cloned().unwrap_or_default()
    }
}

/// Alias -> canonical key lookup built from the grammar table.
pub fn team_aliases(teams: &HashMap<String, TeamGrammar>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, grammar) in teams {
        map.insert(key.to_lowercase(), key.clone());
        for alias in &grammar.aliases {
            map.insert(alias.to_lowercase(), key.clone());
        }
    }
    map
}

impl WorkerConfig {
    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs.max(1))
    }

    pub fn lifecycle_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle_interval_secs.max(1))
    }
}
