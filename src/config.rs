//! Runtime configuration read from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_PATH` | `autowire.db` |
//! | `SIMILARITY_THRESHOLD` | `0.70` |
//! | `CLUSTER_WINDOW_HOURS` | `72` |
//! | `MERGE_LEASE_SECS` | `600` |
//! | `MERGE_MAX_ATTEMPTS` | `3` |
//! | `MERGE_BACKOFF_SECS` | `2` (doubling, capped at 30) |
//! | `MERGE_CONCURRENCY` | `3` |
//! | `MERGE_TIMEOUT_SECS` | `120` |
//! | `LLM_TYPE` | `ollama` (or `openai`) |
//! | `LLM_MODEL` | `llama3.1` for Ollama, `llama-3.3-70b-versatile` for OpenAI-compatible APIs |
//! | `LLM_TEMPERATURE` | `0.3` |
//! | `OLLAMA_HOST` / `OLLAMA_PORT` | `http://localhost` / `11434` |
//! | `OPENAI_API_KEY` / `OPENAI_BASE_URL` | required for `openai` / provider default |
//! | `NEWS_SOURCES` | semicolon separated list of scraped sites |

use std::time::Duration;

use crate::environment::{get_env_string_or, get_env_var_as_vec, get_env_var_or};
use crate::similarity::DEFAULT_SIMILARITY_THRESHOLD;

pub const DEFAULT_DATABASE_PATH: &str = "autowire.db";

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// A policy without waiting, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_path: String,
    pub similarity_threshold: f64,
    pub cluster_window: chrono::Duration,
    pub lease_ttl: Duration,
    pub retry: RetryPolicy,
    pub max_concurrent_merges: usize,
    /// Per-article character budget in the merge prompt.
    pub max_member_chars: usize,
    pub news_sources: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            cluster_window: chrono::Duration::hours(crate::clustering::DEFAULT_CLUSTER_WINDOW_HOURS),
            lease_ttl: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            max_concurrent_merges: 3,
            max_member_chars: 1500,
            news_sources: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry_defaults = RetryPolicy::default();

        Self {
            database_path: get_env_string_or("DATABASE_PATH", DEFAULT_DATABASE_PATH),
            similarity_threshold: get_env_var_or(
                "SIMILARITY_THRESHOLD",
                defaults.similarity_threshold,
            )
            .clamp(0.0, 1.0),
            cluster_window: cluster_window(get_env_var_or(
                "CLUSTER_WINDOW_HOURS",
                crate::clustering::DEFAULT_CLUSTER_WINDOW_HOURS,
            )),
            lease_ttl: Duration::from_secs(
                get_env_var_or("MERGE_LEASE_SECS", 600u64).clamp(1, MAX_LEASE_SECS),
            ),
            retry: RetryPolicy {
                max_attempts: get_env_var_or("MERGE_MAX_ATTEMPTS", retry_defaults.max_attempts)
                    .max(1),
                base_delay: Duration::from_secs(get_env_var_or("MERGE_BACKOFF_SECS", 2u64)),
                ..retry_defaults
            },
            max_concurrent_merges: get_env_var_or(
                "MERGE_CONCURRENCY",
                defaults.max_concurrent_merges,
            )
            .max(1),
            max_member_chars: defaults.max_member_chars,
            news_sources: get_env_var_as_vec("NEWS_SOURCES", ';'),
        }
    }
}

/// Upper bound for `CLUSTER_WINDOW_HOURS`: one year.
pub const MAX_CLUSTER_WINDOW_HOURS: i64 = 24 * 365;
/// Upper bound for `MERGE_LEASE_SECS`: one day.
pub const MAX_LEASE_SECS: u64 = 24 * 60 * 60;

/// Candidate window from a configured hour count. Values below one hour fall
/// back to the default; values above a year are capped.
pub fn cluster_window(hours: i64) -> chrono::Duration {
    let hours = if hours < 1 {
        crate::clustering::DEFAULT_CLUSTER_WINDOW_HOURS
    } else {
        hours.min(MAX_CLUSTER_WINDOW_HOURS)
    };
    chrono::Duration::hours(hours)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmType {
    Ollama,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub llm_type: LlmType,
    pub model: String,
    pub temperature: f32,
    pub ollama_host: String,
    pub ollama_port: u16,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let llm_type = match get_env_string_or("LLM_TYPE", "ollama")
            .to_lowercase()
            .as_str()
        {
            "openai" => LlmType::OpenAI,
            _ => LlmType::Ollama,
        };
        let default_model = match llm_type {
            LlmType::Ollama => "llama3.1",
            LlmType::OpenAI => "llama-3.3-70b-versatile",
        };

        Self {
            llm_type,
            model: get_env_string_or("LLM_MODEL", default_model),
            temperature: get_env_var_or("LLM_TEMPERATURE", 0.3f32),
            ollama_host: get_env_string_or("OLLAMA_HOST", "http://localhost"),
            ollama_port: get_env_var_or("OLLAMA_PORT", 11434u16),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            openai_base_url: std::env::var("OPENAI_BASE_URL").ok(),
            timeout: Duration::from_secs(get_env_var_or("MERGE_TIMEOUT_SECS", 120u64)),
        }
    }
}
