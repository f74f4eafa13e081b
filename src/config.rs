//! Engine configuration
//!
//! Everything is read from environment variables once at startup. Binaries call
//! `dotenv::dotenv()` first so a local `.env` file works the same way.

use crate::error::{NlqError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TENANT_PLACEHOLDER: &str = "{{TENANT_ID}}";

/// Wire protocol family of the generation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Chat-completions API, `data:` framed token deltas, bearer auth.
    OpenAi,
    /// Messages API, typed content-block delta events, `x-api-key` auth.
    Anthropic,
    /// generateContent API, single-shot JSON or `data:` framed chunks, API-key header.
    Gemini,
    /// No backend; the pattern fallback and deterministic narration are used.
    Disabled,
}

impl ProviderKind {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::Disabled => "",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::Anthropic => "claude-3-5-haiku-latest",
            ProviderKind::Gemini => "gemini-1.5-flash",
            ProviderKind::Disabled => "",
        }
    }

    /// Provider-specific variable consulted when `NLQ_API_KEY` is unset.
    fn key_variable(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Gemini => Some("GEMINI_API_KEY"),
            ProviderKind::Disabled => None,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "disabled" | "none" | "off" => Ok(ProviderKind::Disabled),
            other => Err(NlqError::Configuration(format!(
                "unknown NLQ_PROVIDER '{}' (expected openai, anthropic, gemini or disabled)",
                other
            ))),
        }
    }
}

/// Resolved generation backend settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub provider: ProviderKind,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: BackendConfig,
    pub database_url: Option<String>,
    pub inline_row_limit: usize,
    pub example_ttl: Duration,
    pub history_turns: usize,
    pub token_delay: Duration,
    pub stream_timeout: Duration,
    pub request_timeout: Duration,
    pub statement_timeout: Duration,
    pub max_prompt_chars: usize,
    pub pattern_fallback: bool,
    pub tenant_placeholder: String,
    pub schema_path: Option<PathBuf>,
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                provider: ProviderKind::Disabled,
                api_key: String::new(),
                model: String::new(),
                base_url: String::new(),
                timeout: Duration::from_secs(30),
                max_tokens: 1024,
            },
            database_url: None,
            inline_row_limit: 100,
            example_ttl: Duration::from_secs(300),
            history_turns: 10,
            token_delay: Duration::from_millis(30),
            stream_timeout: Duration::from_secs(180),
            request_timeout: Duration::from_secs(60),
            statement_timeout: Duration::from_millis(15_000),
            max_prompt_chars: 60_000,
            pattern_fallback: true,
            tenant_placeholder: DEFAULT_TENANT_PLACEHOLDER.to_string(),
            schema_path: None,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let provider = match get("NLQ_PROVIDER") {
            Some(raw) => raw.parse::<ProviderKind>()?,
            None => ProviderKind::OpenAi,
        };

        let api_key = get("NLQ_API_KEY")
            .or_else(|| provider.key_variable().and_then(|var| get(var)))
            .unwrap_or_default();
        if provider != ProviderKind::Disabled && api_key.is_empty() {
            return Err(NlqError::Configuration(format!(
                "no API key configured for provider {:?}; set NLQ_API_KEY or {}, or NLQ_PROVIDER=disabled",
                provider,
                provider.key_variable().unwrap_or("NLQ_API_KEY")
            )));
        }

        let backend = BackendConfig {
            provider,
            api_key,
            model: get("NLQ_MODEL").unwrap_or_else(|| provider.default_model().to_string()),
            base_url: get("NLQ_BASE_URL")
                .unwrap_or_else(|| provider.default_base_url().to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: Duration::from_secs(parse_or(&get, "NLQ_LLM_TIMEOUT_SECS", 30)?),
            max_tokens: parse_or(&get, "NLQ_MAX_TOKENS", 1024)?,
        };

        let inline_row_limit: usize = parse_or(&get, "NLQ_INLINE_ROW_LIMIT", defaults.inline_row_limit)?;
        if inline_row_limit == 0 {
            return Err(NlqError::Configuration(
                "NLQ_INLINE_ROW_LIMIT must be at least 1".to_string(),
            ));
        }

        let tenant_placeholder =
            get("NLQ_TENANT_PLACEHOLDER").unwrap_or(defaults.tenant_placeholder);

        Ok(Self {
            backend,
            database_url: get("DATABASE_URL"),
            inline_row_limit,
            example_ttl: Duration::from_secs(parse_or(&get, "NLQ_EXAMPLE_TTL_SECS", 300)?),
            history_turns: parse_or(&get, "NLQ_HISTORY_TURNS", defaults.history_turns)?,
            token_delay: Duration::from_millis(parse_or(&get, "NLQ_TOKEN_DELAY_MS", 30)?),
            stream_timeout: Duration::from_secs(parse_or(&get, "NLQ_STREAM_TIMEOUT_SECS", 180)?),
            request_timeout: Duration::from_secs(parse_or(&get, "NLQ_REQUEST_TIMEOUT_SECS", 60)?),
            statement_timeout: Duration::from_millis(parse_or(
                &get,
                "NLQ_STATEMENT_TIMEOUT_MS",
                15_000,
            )?),
            max_prompt_chars: parse_or(&get, "NLQ_MAX_PROMPT_CHARS", defaults.max_prompt_chars)?,
            pattern_fallback: parse_bool_or(&get, "NLQ_PATTERN_FALLBACK", true)?,
            tenant_placeholder,
            schema_path: get("NLQ_SCHEMA_PATH").map(PathBuf::from),
            bind_addr: get("NLQ_BIND").unwrap_or(defaults.bind_addr),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            NlqError::Configuration(format!("{} has an invalid value '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(NlqError::Configuration(format!(
            "{} has an invalid boolean value '{}'",
            key, v
        ))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<EngineConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let err = config_from(&[("NLQ_PROVIDER", "anthropic")]).unwrap_err();
        assert!(matches!(err, NlqError::Configuration(_)));
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn provider_specific_key_is_picked_up() {
        let config = config_from(&[("NLQ_PROVIDER", "gemini"), ("GEMINI_API_KEY", "g-key")]).unwrap();
        assert_eq!(config.backend.provider, ProviderKind::Gemini);
        assert_eq!(config.backend.api_key, "g-key");
        assert_eq!(config.backend.model, "gemini-1.5-flash");
    }

    #[test]
    fn disabled_provider_needs_no_key_and_keeps_defaults() {
        let config = config_from(&[("NLQ_PROVIDER", "disabled")]).unwrap();
        assert_eq!(config.backend.provider, ProviderKind::Disabled);
        assert_eq!(config.inline_row_limit, 100);
        assert_eq!(config.history_turns, 10);
        assert_eq!(config.example_ttl, Duration::from_secs(300));
        assert_eq!(config.tenant_placeholder, DEFAULT_TENANT_PLACEHOLDER);
        assert!(config.pattern_fallback);
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = config_from(&[
            ("NLQ_API_KEY", "k"),
            ("NLQ_BASE_URL", "http://localhost:9000/v1/"),
            ("NLQ_INLINE_ROW_LIMIT", "250"),
            ("NLQ_PATTERN_FALLBACK", "off"),
        ])
        .unwrap();
        assert_eq!(config.backend.provider, ProviderKind::OpenAi);
        assert_eq!(config.backend.base_url, "http://localhost:9000/v1");
        assert_eq!(config.inline_row_limit, 250);
        assert!(!config.pattern_fallback);

        let err = config_from(&[("NLQ_API_KEY", "k"), ("NLQ_TOKEN_DELAY_MS", "fast")]).unwrap_err();
        assert!(err.to_string().contains("NLQ_TOKEN_DELAY_MS"));
        assert!(config_from(&[("NLQ_PROVIDER", "cohere")]).is_err());
    }
}
