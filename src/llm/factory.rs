//! Provider construction with fallback priority.
//!
//! Grounded: `examples/adolfousier-opencrabs/src/brain/provider/factory.rs`
//! (`create_provider`), which walks a priority list of configured providers
//! and returns the first one explicitly enabled. This core only ships two
//! provider families, so the walk collapses to Anthropic-first,
//! OpenAI-compatible-second.

use std::sync::Arc;

use crate::config::Config;
use crate::error::{CoreError, CoreResult};

use super::anthropic::AnthropicProvider;
use super::openai_compatible::OpenAiCompatibleProvider;
use super::r#trait::Provider;

pub fn create_provider(config: &Config) -> CoreResult<Arc<dyn Provider>> {
    if let Some(cfg) = &config.providers.anthropic {
        if cfg.enabled {
            let api_key = cfg
                .api_key
                .as_ref()
                .ok_or_else(|| CoreError::Config("anthropic provider enabled without api_key".into()))?;
            let provider = match &cfg.base_url {
                Some(base_url) => {
                    AnthropicProvider::with_base_url(api_key.expose_secret().to_string(), base_url.clone())
                }
                None => AnthropicProvider::new(api_key.expose_secret().to_string()),
            };
            tracing::info!("using enabled provider: anthropic");
            return Ok(Arc::new(provider));
        }
    }

    if let Some(cfg) = &config.providers.openai_compatible {
        if cfg.enabled {
            let api_key = cfg.api_key.as_ref().map(|s| s.expose_secret().to_string());
            tracing::info!("using enabled provider: openai-compatible");
            return Ok(Arc::new(OpenAiCompatibleProvider::new(
                "openai-compatible",
                api_key,
                cfg.base_url.clone(),
            )));
        }
    }

    Err(CoreError::Config(
        "no llm provider enabled in configuration".into(),
    ))
}

/// Builds the secondary provider used on failover, prefixing the model id
/// with the target provider's family tag the way `CoreError::is_overloaded`
/// callers expect (spec §4.6 step 10).
pub fn create_failover_provider(config: &Config, primary: &dyn Provider) -> Option<Arc<dyn Provider>> {
    if primary.name() != "anthropic" {
        if let Some(cfg) = &config.providers.anthropic {
            if cfg.enabled {
                return create_provider(config).ok();
            }
        }
        return None;
    }
    config.providers.openai_compatible.as_ref().and_then(|cfg| {
        if !cfg.enabled {
            return None;
        }
        let api_key = cfg.api_key.as_ref().map(|s| s.expose_secret().to_string());
        Some(Arc::new(OpenAiCompatibleProvider::new(
            "openai-compatible",
            api_key,
            cfg.base_url.clone(),
        )) as Arc<dyn Provider>)
    })
}
