//! Text-generation service integration.
//!
//! Defines the `TextGenerator` trait and provides implementations for
//! OpenAI-compatible chat-completions endpoints (OpenAI, vLLM, OpenRouter)
//! and the Anthropic Messages API. Prompt construction lives in `prompts`.

pub mod anthropic;
pub mod openai;
pub mod prompts;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, LlmConfig};

/// Response mode requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    /// A single JSON object. Providers that support it are asked to enforce it.
    Json,
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub user: String,
    pub locale: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub format: ResponseFormat,
}

/// Abstraction over text-generation providers.
///
/// Implementors own transport-level retries; a returned error means the
/// call is definitively failed for this event.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, request: &GenerationRequest) -> Result<String>;

    /// Model identifier string.
    fn model_name(&self) -> &str;

    /// Cumulative spend in USD since start.
    fn cumulative_cost(&self) -> f64 {
        0.0
    }
}

/// Build the configured provider. Fails when the API key is missing.
pub fn build_generator(cfg: &LlmConfig) -> Result<Arc<dyn TextGenerator>> {
    let api_key = AppConfig::resolve_secret(&cfg.api_key_env)
        .with_context(|| format!("LLM API key not set ({})", cfg.api_key_env))?;

    let generator: Arc<dyn TextGenerator> = match cfg.provider.as_str() {
        "anthropic" => {
            info!(model = %cfg.model, "Using Anthropic text generation");
            Arc::new(anthropic::AnthropicClient::new(api_key, Some(cfg.model.clone()))?)
        }
        "openai" | "vllm" | "openrouter" => {
            info!(
                provider = %cfg.provider,
                model = %cfg.model,
                base_url = ?cfg.base_url,
                "Using OpenAI-compatible text generation"
            );
            Arc::new(openai::OpenAiClient::new(
                api_key,
                Some(cfg.model.clone()),
                cfg.base_url.clone(),
            )?)
        }
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    };
    Ok(generator)
}
