//! Runtime configuration
//!
//! Read from the process environment (and `.env` when the binaries load it).

use crate::error::{QueryError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openai_api_key: Option<String>,
    pub llm_model: String,
    pub llm_base_url: String,
    pub llm_timeout: Duration,
    pub database_url: Option<String>,
    pub fragments_path: PathBuf,
    pub fragment_cache_ttl: Duration,
    pub max_attempts: u8,
    pub clarification_threshold: f64,
    pub max_rows: u32,
    pub bind_addr: String,
    pub default_base_fragment: String,
    pub fragment_scope_column: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            llm_model: "gpt-4o-mini".to_string(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_timeout: Duration::from_secs(30),
            database_url: None,
            fragments_path: PathBuf::from("metadata/fragments.json"),
            fragment_cache_ttl: Duration::from_secs(60),
            max_attempts: 3,
            clarification_threshold: 0.7,
            max_rows: 5000,
            bind_addr: "0.0.0.0:8080".to_string(),
            default_base_fragment: "students_base".to_string(),
            fragment_scope_column: "s.SC".to_string(),
        }
    }
}

impl AppConfig {
    /// Build the config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] but with an injectable lookup, so tests
    /// don't have to touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = Self {
            openai_api_key: text("OPENAI_API_KEY"),
            llm_model: text("LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_base_url: text("LLM_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.llm_base_url),
            llm_timeout: parse_or(&lookup, "LLM_TIMEOUT_SECS", 30u64)
                .map(Duration::from_secs)?,
            database_url: text("DATABASE_URL"),
            fragments_path: text("FRAGMENTS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.fragments_path),
            fragment_cache_ttl: parse_or(&lookup, "FRAGMENT_CACHE_TTL_SECS", 60u64)
                .map(Duration::from_secs)?,
            max_attempts: parse_or(&lookup, "MAX_ATTEMPTS", defaults.max_attempts)?,
            clarification_threshold: parse_or(
                &lookup,
                "CLARIFICATION_THRESHOLD",
                defaults.clarification_threshold,
            )?,
            max_rows: parse_or(&lookup, "MAX_ROWS", defaults.max_rows)?,
            bind_addr: text("BIND_ADDR").unwrap_or(defaults.bind_addr),
            default_base_fragment: text("DEFAULT_BASE_FRAGMENT")
                .unwrap_or(defaults.default_base_fragment),
            fragment_scope_column: text("FRAGMENT_SCOPE_COLUMN")
                .unwrap_or(defaults.fragment_scope_column),
        };

        if config.max_attempts == 0 {
            return Err(QueryError::Config("MAX_ATTEMPTS must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&config.clarification_threshold) {
            return Err(QueryError::Config(format!(
                "CLARIFICATION_THRESHOLD must be within [0, 1], got {}",
                config.clarification_threshold
            )));
        }

        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| QueryError::Config(format!("Invalid value for {}: '{}' ({})", key, raw, e))),
        None => Ok(default),
    }
}
