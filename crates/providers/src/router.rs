//! Builds the failover chain from configuration.
//!
//! Every provider built here shares one pooled HTTP client, so connections
//! are reused across all upstreams.

use std::sync::Arc;
use std::time::Duration;

use pincer_config::{AppConfig, ProviderConfig, ProviderKind};
use pincer_core::provider::Provider;
use tracing::{info, warn};

use crate::anthropic::AnthropicProvider;
use crate::failover::FailoverChain;
use crate::ollama::OllamaProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::retry::RetryExecutor;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// A pooled HTTP client with the per-request network timeout.
///
/// Falls back to a default client if the builder fails (e.g. no TLS
/// backend could be initialized).
pub fn http_client() -> reqwest::Client {
    match reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to build HTTP client, using defaults");
            reqwest::Client::new()
        }
    }
}

/// Build the failover chain described by `config`.
pub fn build_from_config(config: &AppConfig) -> FailoverChain {
    let client = http_client();
    let retry = RetryExecutor::from_config(&config.retry);
    let mut chain = FailoverChain::new("failover");

    for provider_config in config.provider_chain() {
        let timeout = Duration::from_secs(provider_config.timeout_secs);
        let provider = build_provider(config, &provider_config, client.clone(), retry.clone());
        info!(
            provider = %provider.name(),
            timeout_secs = provider_config.timeout_secs,
            "Registered upstream provider"
        );
        chain = chain.add(provider, timeout);
    }

    chain
}

fn build_provider(
    config: &AppConfig,
    provider_config: &ProviderConfig,
    client: reqwest::Client,
    retry: RetryExecutor,
) -> Arc<dyn Provider> {
    let name = provider_config.display_name();
    let api_key = provider_config
        .api_key
        .clone()
        .or_else(|| config.api_key.clone())
        .unwrap_or_default();

    match provider_config.kind {
        ProviderKind::Anthropic => {
            let mut p = AnthropicProvider::new(&api_key)
                .with_name(name)
                .with_client(client)
                .with_retry(retry);
            if let Some(url) = &provider_config.api_url {
                p = p.with_base_url(url);
            }
            if let Some(model) = &provider_config.model {
                p = p.with_model(model);
            }
            Arc::new(p)
        }
        ProviderKind::Ollama => {
            let mut p = OllamaProvider::new(provider_config.api_url.as_deref())
                .with_name(name)
                .with_client(client)
                .with_retry(retry);
            if let Some(model) = &provider_config.model {
                p = p.with_model(model);
            }
            Arc::new(p)
        }
        ProviderKind::Openai => {
            let base_url = provider_config
                .api_url
                .clone()
                .unwrap_or_else(|| default_base_url(&name));
            let mut p = OpenAiCompatProvider::new(name, base_url, api_key)
                .with_client(client)
                .with_retry(retry);
            if let Some(model) = &provider_config.model {
                p = p.with_model(model);
            }
            Arc::new(p)
        }
    }
}

/// Get the default base URL for well-known OpenAI-compatible providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => "https://api.openai.com/v1".into(),
    }
}
