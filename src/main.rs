//! TOUCHLINE worker entry point.
//!
//! Loads configuration, initialises structured logging, wires the source
//! adapters, generator and publisher together, and runs the supervisor
//! until Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use touchline::config::{self, AppConfig};
use touchline::dashboard::{self, routes::DashboardState};
use touchline::engine::generator::{CommentaryGenerator, GeneratorSettings};
use touchline::engine::limiter::GenerationLimiter;
use touchline::engine::normalizer::Normalizer;
use touchline::engine::orchestrator::{AdapterFactory, PipelineComponents, PipelineSettings};
use touchline::engine::publisher::{CommentaryStore, HttpCommentaryStore, InMemoryStore, Publisher};
use touchline::engine::registry::{Supervisor, SupervisorSettings};
use touchline::llm;
use touchline::sources::audio::{AudioAdapter, WhisperTranscriber, YtDlpChunker};
use touchline::sources::chat::{ChatAdapter, YouTubeClient};
use touchline::sources::feed::{EspnClient, FeedAdapter};
use touchline::sources::{MatchStateSource, SourceAdapter};
use touchline::storage::LedgerStore;

const BANNER: &str = r#"
 _____ ___  _   _  ____ _   _ _     ___ _   _ _____
|_   _/ _ \| | | |/ ___| | | | |   |_ _| \ | | ____|
  | || | | | | | | |   | |_| | |    | ||  \| |  _|
  | || |_| | |_| | |___|  _  | |___ | || |\  | |___
  |_| \___/ \___/ \____|_| |_|_____|___|_| \_|_____|

  Live match events to published commentary
  v0.1.0
"#;

/// Config path, overridable for deployments that mount it elsewhere.
const CONFIG_ENV: &str = "TOUCHLINE_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        worker = %cfg.worker.name,
        locale = %cfg.worker.locale,
        matches = cfg.worker.matches.len(),
        discover = cfg.worker.discover,
        pass_interval_secs = cfg.worker.pass_interval_secs,
        "TOUCHLINE starting up"
    );

    // -- Match state -------------------------------------------------------

    let espn: Arc<dyn MatchStateSource> = Arc::new(EspnClient::new(
        &cfg.feed.base_url,
        Duration::from_secs(cfg.feed.timeout_secs),
    )?);

    // -- Generation ----------------------------------------------------------

    let text_generator = llm::build_generator(&cfg.llm)?;
    let limiter = Arc::new(GenerationLimiter::new(
        cfg.generation.max_concurrent,
        Duration::from_millis(cfg.generation.min_interval_ms),
    ));
    let generator = Arc::new(CommentaryGenerator::new(
        text_generator,
        limiter,
        &cfg.teams,
        GeneratorSettings::from_config(&cfg),
    )?);

    // -- Publishing ----------------------------------------------------------

    let store: Arc<dyn CommentaryStore> = if cfg.store.dry_run {
        warn!("store.dry_run enabled: submissions stay in memory");
        Arc::new(InMemoryStore::new())
    } else {
        let secret = AppConfig::resolve_secret(&cfg.store.secret_env);
        if secret.is_none() {
            warn!(env = %cfg.store.secret_env, "No webhook secret set, posting without one");
        }
        Arc::new(HttpCommentaryStore::new(
            &cfg.store.url,
            secret,
            Duration::from_secs(cfg.store.timeout_secs),
        )?)
    };
    let publisher = Publisher::new(
        store,
        &cfg.worker.locale,
        cfg.store.max_attempts,
        Duration::from_millis(cfg.store.backoff_ms),
    );
    let ledger = Arc::new(LedgerStore::open(&cfg.store.ledger_path)?);

    // -- Components ----------------------------------------------------------

    let components = PipelineComponents {
        normalizer: Arc::new(Normalizer::new()?),
        generator: generator.clone(),
        publisher: Arc::new(publisher),
        match_source: espn.clone(),
        ledger: Some(ledger),
        adapters: adapter_factory(&cfg, espn)?,
        settings: PipelineSettings::from_config(&cfg),
    };

    let board = Arc::new(DashboardState::new(&cfg.worker.name).with_generator(generator));
    if cfg.status.enabled {
        dashboard::spawn_dashboard(board.clone(), cfg.status.port).await?;
    }

    // -- Main loop -----------------------------------------------------------

    let supervisor = Supervisor::new(components, board, SupervisorSettings::from_config(&cfg.worker));
    info!("Entering main loop. Press Ctrl+C to stop.");

    supervisor
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("TOUCHLINE shut down cleanly.");
    Ok(())
}

/// Build the per-match adapter set. Chat and audio are only wired when
/// their credentials are present.
fn adapter_factory(cfg: &AppConfig, espn: Arc<dyn MatchStateSource>) -> Result<AdapterFactory> {
    let poll_timeout = Duration::from_secs(cfg.worker.adapter_timeout_secs);

    let youtube = match (cfg.chat.enabled, AppConfig::resolve_secret(&cfg.chat.api_key_env)) {
        (true, Some(key)) => Some(Arc::new(YouTubeClient::new(&cfg.chat, key)?)),
        (true, None) => {
            warn!(env = %cfg.chat.api_key_env, "Chat adapter disabled: no API key");
            None
        }
        (false, _) => None,
    };

    let audio = match (cfg.audio.enabled, AppConfig::resolve_secret(&cfg.audio.api_key_env)) {
        (true, Some(key)) => Some((
            Arc::new(YtDlpChunker::new(&cfg.audio)),
            Arc::new(WhisperTranscriber::new(&cfg.audio, key)?),
        )),
        (true, None) => {
            warn!(env = %cfg.audio.api_key_env, "Audio adapter disabled: no transcription key");
            None
        }
        (false, _) => None,
    };

    let cfg = cfg.clone();
    let factory: AdapterFactory = Arc::new(move |match_id: &str| {
        let stream = cfg.stream_for(match_id);
        let mut adapters: Vec<Arc<dyn SourceAdapter>> =
            vec![Arc::new(FeedAdapter::new(espn.clone(), poll_timeout))];

        let chat_reachable = stream.video_id.is_some() || cfg.chat.search_fallback;
        if let (Some(client), true) = (&youtube, chat_reachable) {
            adapters.push(Arc::new(ChatAdapter::new(
                client.clone(),
                &cfg.chat,
                stream.video_id.clone(),
                poll_timeout,
            )));
        }
        if let Some((chunker, transcriber)) = &audio {
            match stream.audio_source() {
                Some(origin) => adapters.push(Arc::new(AudioAdapter::new(
                    chunker.clone(),
                    transcriber.clone(),
                    Some(origin),
                    &cfg.audio,
                ))),
                None => info!(match_id, "No stream configured, audio adapter not started"),
            }
        }
        adapters
    });
    Ok(factory)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("touchline=info"));

    let json_logging = std::env::var("TOUCHLINE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
