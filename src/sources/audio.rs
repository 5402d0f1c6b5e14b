//! Audio adapter: capture a short chunk of a live stream, transcribe it,
//! and hand the transcript on as a single `RawEvent`.
//!
//! Capture shells out to `yt-dlp` (bounded by ffmpeg's `-t`) and converts
//! the result to 16 kHz mono mp3. Transcription posts the chunk to a
//! Whisper-compatible `/audio/transcriptions` endpoint. A failed attempt
//! is retried once; a second failure puts the adapter into a short
//! backoff so the pass loop is not stalled by a dead stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SourceAdapter;
use crate::config::AudioConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{MatchContext, RawEvent, SourceKind};

/// Produces a local audio file covering roughly `length` of the stream.
#[async_trait]
pub trait AudioChunker: Send + Sync {
    async fn capture(&self, origin: &str, length: Duration) -> PipelineResult<PathBuf>;
}

/// Speech-to-text over a local audio file.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, path: &Path, locale: &str) -> PipelineResult<String>;
}

fn audio_error(reason: impl Into<String>) -> PipelineError {
    PipelineError::unavailable(SourceKind::Audio, reason)
}

/// Audio file on disk, removed when dropped unless kept. A poll cut off by
/// its timeout drops the guard with the future.
struct ChunkFile {
    path: PathBuf,
    keep: bool,
}

impl ChunkFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ChunkFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %self.path.display(), error = %e, "Chunk cleanup failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// yt-dlp capture
// ---------------------------------------------------------------------------

pub struct YtDlpChunker {
    ytdlp_bin: String,
    ffmpeg_bin: String,
    work_dir: PathBuf,
}

impl YtDlpChunker {
    pub fn new(cfg: &AudioConfig) -> Self {
        Self {
            ytdlp_bin: cfg.ytdlp_bin.clone(),
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            work_dir: PathBuf::from(&cfg.work_dir),
        }
    }

    async fn run(&self, bin: &str, args: &[String]) -> PipelineResult<()> {
        let output = Command::new(bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| audio_error(format!("failed to spawn {bin}: {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.chars().take(200).collect();
        Err(audio_error(format!("{bin} exited with {}: {tail}", output.status)))
    }
}

#[async_trait]
impl AudioChunker for YtDlpChunker {
    async fn capture(&self, origin: &str, length: Duration) -> PipelineResult<PathBuf> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| audio_error(format!("work dir {}: {e}", self.work_dir.display())))?;

        let stem = self.work_dir.join(format!("chunk_{}", Uuid::new_v4()));
        let template = format!("{}.%(ext)s", stem.display());
        let args: Vec<String> = vec![
            "-f".into(),
            "91".into(),
            "--downloader".into(),
            "ffmpeg".into(),
            "--downloader-args".into(),
            format!("ffmpeg:-t {}", length.as_secs()),
            "-x".into(),
            "--audio-format".into(),
            "mp3".into(),
            "--audio-quality".into(),
            "64K".into(),
            "-o".into(),
            template,
            "--no-playlist".into(),
            "--no-part".into(),
            origin.to_string(),
        ];
        let outputs: Vec<ChunkFile> = ["mp3", "m4a", "webm"]
            .iter()
            .map(|ext| ChunkFile::new(stem.with_extension(ext)))
            .collect();
        // yt-dlp may exit non-zero on a live stream cut by `-t` while still
        // leaving a usable file behind, so the file check decides.
        let run = self.run(&self.ytdlp_bin, &args).await;

        let mp3 = stem.with_extension("mp3");
        let found = outputs.into_iter().find(|f| f.path.exists());

        match found {
            Some(file) if file.path == mp3 => Ok(file.keep()),
            Some(source) => {
                let convert = vec![
                    "-y".into(),
                    "-i".into(),
                    source.path.display().to_string(),
                    "-ar".into(),
                    "16000".into(),
                    "-ac".into(),
                    "1".into(),
                    "-b:a".into(),
                    "64k".into(),
                    mp3.display().to_string(),
                ];
                let output = ChunkFile::new(mp3);
                let converted = self.run(&self.ffmpeg_bin, &convert).await;
                drop(source);
                converted.map(|_| output.keep())
            }
            None => Err(run
                .err()
                .unwrap_or_else(|| audio_error("yt-dlp produced no audio file"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Whisper transcription
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

pub struct WhisperTranscriber {
    http: Client,
    endpoint: String,
    model: String,
    api_key: SecretString,
}

impl WhisperTranscriber {
    pub fn new(cfg: &AudioConfig, api_key: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.transcription_timeout_secs))
            .build()
            .context("Failed to build transcription HTTP client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/audio/transcriptions", cfg.transcription_url.trim_end_matches('/')),
            model: cfg.transcription_model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, path: &Path, locale: &str) -> PipelineResult<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| audio_error(format!("reading {}: {e}", path.display())))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "chunk.mp3".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| audio_error(format!("multipart: {e}")))?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", locale.to_string())
            .text("response_format", "json");

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .multipart(form)
            .send()
            .await
            .map_err(|e| audio_error(format!("transcription request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(audio_error(format!("transcription HTTP {status}: {body}")));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedData(format!("transcription response: {e}")))?;
        Ok(parsed.text)
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AudioState {
    backoff_until: Option<Instant>,
    chunks: u64,
}

pub struct AudioAdapter {
    chunker: Arc<dyn AudioChunker>,
    transcriber: Arc<dyn Transcriber>,
    origin: Option<String>,
    chunk: Duration,
    backoff: Duration,
    timeout: Duration,
    state: Mutex<AudioState>,
}

impl AudioAdapter {
    pub fn new(
        chunker: Arc<dyn AudioChunker>,
        transcriber: Arc<dyn Transcriber>,
        origin: Option<String>,
        cfg: &AudioConfig,
    ) -> Self {
        Self {
            chunker,
            transcriber,
            origin,
            chunk: Duration::from_secs(cfg.chunk_secs),
            backoff: Duration::from_secs(cfg.failure_backoff_secs),
            timeout: Duration::from_secs(cfg.timeout_secs),
            state: Mutex::new(AudioState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AudioState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn chunks_captured(&self) -> u64 {
        self.state().chunks
    }

    async fn capture_and_transcribe(&self, origin: &str, locale: &str) -> PipelineResult<String> {
        let chunk = ChunkFile::new(self.chunker.capture(origin, self.chunk).await?);
        self.transcriber.transcribe(&chunk.path, locale).await
    }
}

#[async_trait]
impl SourceAdapter for AudioAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Audio
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn poll(&self, ctx: &MatchContext) -> PipelineResult<Vec<RawEvent>> {
        let origin = self
            .origin
            .as_deref()
            .ok_or_else(|| audio_error("no audio origin configured"))?;

        let backoff_until = self.state().backoff_until;
        if let Some(until) = backoff_until {
            if Instant::now() < until {
                debug!(match_id = %ctx.match_id, "Audio in backoff, skipping capture");
                return Ok(Vec::new());
            }
        }

        let started = Utc::now();
        let text = match self.capture_and_transcribe(origin, &ctx.locale).await {
            Ok(text) => text,
            Err(first) => {
                warn!(match_id = %ctx.match_id, error = %first, "Audio attempt failed, retrying once");
                match self.capture_and_transcribe(origin, &ctx.locale).await {
                    Ok(text) => text,
                    Err(second) => {
                        self.state().backoff_until = Some(Instant::now() + self.backoff);
                        return Err(second);
                    }
                }
            }
        };

        {
            let mut state = self.state();
            state.backoff_until = None;
            state.chunks += 1;
        }

        let text = text.trim();
        if text.is_empty() {
            debug!(match_id = %ctx.match_id, "Empty transcript");
            return Ok(Vec::new());
        }
        info!(
            match_id = %ctx.match_id,
            chars = text.chars().count(),
            "Audio chunk transcribed"
        );

        let order = started.timestamp_millis();
        Ok(vec![RawEvent {
            source: SourceKind::Audio,
            sequence: format!("chunk-{order}"),
            order,
            text: text.to_string(),
            metadata: json!({
                "captured_at": started.to_rfc3339(),
                "chunk_secs": self.chunk.as_secs(),
            }),
        }])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Match;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeChunker {
        failures: AtomicUsize,
        calls: AtomicUsize,
        written: Mutex<Vec<PathBuf>>,
    }

    impl FakeChunker {
        fn failing(n: usize) -> Self {
            Self {
                failures: AtomicUsize::new(n),
                calls: AtomicUsize::new(0),
                written: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AudioChunker for FakeChunker {
        async fn capture(&self, _origin: &str, _length: Duration) -> PipelineResult<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(audio_error("stream offline"));
            }
            let path = std::env::temp_dir().join(format!("touchline_test_{}.mp3", Uuid::new_v4()));
            std::fs::write(&path, b"fake").unwrap();
            self.written.lock().unwrap().push(path.clone());
            Ok(path)
        }
    }

    struct FixedTranscriber(&'static str);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, path: &Path, _locale: &str) -> PipelineResult<String> {
            assert!(path.exists());
            Ok(self.0.to_string())
        }
    }

    struct StalledTranscriber;

    #[async_trait]
    impl Transcriber for StalledTranscriber {
        async fn transcribe(&self, _path: &Path, _locale: &str) -> PipelineResult<String> {
            std::future::pending().await
        }
    }

    fn adapter(chunker: Arc<FakeChunker>, text: &'static str) -> AudioAdapter {
        let cfg = AudioConfig {
            failure_backoff_secs: 10,
            ..AudioConfig::default()
        };
        AudioAdapter::new(chunker, Arc::new(FixedTranscriber(text)), Some("https://youtu.be/x".into()), &cfg)
    }

    #[tokio::test]
    async fn test_transcript_becomes_single_event() {
        let chunker = Arc::new(FakeChunker::failing(0));
        let a = adapter(chunker.clone(), "  Et c'est le but de Mané !  ");
        let ctx = Match::new("1").context("fr");

        let events = a.poll(&ctx).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, SourceKind::Audio);
        assert_eq!(events[0].text, "Et c'est le but de Mané !");
        assert!(events[0].sequence.starts_with("chunk-"));

        // Chunk files are removed after transcription.
        for path in chunker.written.lock().unwrap().iter() {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_chunk_removed_when_poll_times_out() {
        let chunker = Arc::new(FakeChunker::failing(0));
        let a = AudioAdapter::new(
            chunker.clone(),
            Arc::new(StalledTranscriber),
            Some("https://youtu.be/x".into()),
            &AudioConfig::default(),
        );
        let ctx = Match::new("1").context("fr");

        let cut = tokio::time::timeout(Duration::from_millis(50), a.poll(&ctx)).await;
        assert!(cut.is_err());

        let written = chunker.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert!(!written[0].exists());
    }

    #[tokio::test]
    async fn test_retry_once_then_succeed() {
        let chunker = Arc::new(FakeChunker::failing(1));
        let a = adapter(chunker.clone(), "corner pour le Maroc");
        let ctx = Match::new("1").context("fr");

        let events = a.poll(&ctx).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(chunker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_double_failure_enters_backoff() {
        let chunker = Arc::new(FakeChunker::failing(2));
        let a = adapter(chunker.clone(), "text");
        let ctx = Match::new("1").context("fr");

        assert!(a.poll(&ctx).await.is_err());
        assert_eq!(chunker.calls.load(Ordering::SeqCst), 2);

        // Within the backoff window nothing is captured.
        let events = a.poll(&ctx).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(chunker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_transcript_yields_nothing() {
        let chunker = Arc::new(FakeChunker::failing(0));
        let a = adapter(chunker, "   ");
        let ctx = Match::new("1").context("fr");
        assert!(a.poll(&ctx).await.unwrap().is_empty());
        assert_eq!(a.chunks_captured(), 1);
    }

    #[tokio::test]
    async fn test_missing_origin_is_unavailable() {
        let a = AudioAdapter::new(
            Arc::new(FakeChunker::failing(0)),
            Arc::new(FixedTranscriber("x")),
            None,
            &AudioConfig::default(),
        );
        let ctx = Match::new("1").context("fr");
        assert!(matches!(
            a.poll(&ctx).await,
            Err(PipelineError::SourceUnavailable { kind: SourceKind::Audio, .. })
        ));
    }
}
