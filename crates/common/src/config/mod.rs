//! Configuration management for NutriSage services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Provider credentials from their conventional variables
//!   (OPENAI_API_KEY, GROQ_API_KEY, MEM0_API_KEY)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Text-generation model configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Content moderation configuration
    #[serde(default)]
    pub moderation: ModerationConfig,

    /// Evidence retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Long-term user memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Per-identity quota configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Refinement loop configuration
    #[serde(default)]
    pub refinement: RefinementConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Trust the first X-Forwarded-For hop as the client identity
    #[serde(default = "default_enabled")]
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL
    #[serde(default = "default_llm_base")]
    pub api_base: String,

    /// API key (falls back to OPENAI_API_KEY)
    pub api_key: Option<String>,

    /// Model used for generation, critique and query rewriting
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Sampling temperature for answer generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum output tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Use the model to expand queries (otherwise dictionary expansion)
    #[serde(default = "default_enabled")]
    pub llm_query_expansion: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModerationConfig {
    /// OpenAI-compatible API base URL serving the guard model
    #[serde(default = "default_moderation_base")]
    pub api_base: String,

    /// API key (falls back to GROQ_API_KEY)
    pub api_key: Option<String>,

    /// Guard model name
    #[serde(default = "default_moderation_model")]
    pub model: String,

    /// Hazard categories that are let through
    #[serde(default = "default_allowed_categories")]
    pub allowed_categories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Retrieval provider: http, local
    #[serde(default = "default_retrieval_provider")]
    pub provider: String,

    /// Search endpoint for the http provider
    pub endpoint: Option<String>,

    /// Corpus file for the local provider
    pub corpus_path: Option<String>,

    /// Number of passages per retrieval
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Memory provider: mem0, in_memory, none
    #[serde(default = "default_memory_provider")]
    pub provider: String,

    /// mem0 API base URL
    #[serde(default = "default_mem0_base")]
    pub api_base: String,

    /// API key (falls back to MEM0_API_KEY)
    pub api_key: Option<String>,

    /// Maximum memories pulled into the generation context
    #[serde(default = "default_memory_limit")]
    pub search_limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Admitted requests per identity per hour window
    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: u32,

    /// Admitted requests per identity per day window
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,

    /// Counter store: memory, file, redis
    #[serde(default = "default_counter_store")]
    pub store: String,

    /// Path for the file counter store
    #[serde(default = "default_counter_path")]
    pub file_path: String,

    /// Redis URL for the redis counter store
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Global requests per second across all identities (gateway burst guard)
    #[serde(default = "default_global_rps")]
    pub global_requests_per_second: u32,

    /// Global burst capacity
    #[serde(default = "default_burst")]
    pub global_burst: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefinementConfig {
    /// Maximum generate/evaluate rounds per query
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Groundedness pass threshold (0.0 - 1.0)
    #[serde(default = "default_threshold")]
    pub groundedness_threshold: f32,

    /// Precision pass threshold (0.0 - 1.0)
    #[serde(default = "default_threshold")]
    pub precision_threshold: f32,

    /// Upper bound for a single collaborator call in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Retry policy for retrieval and generation
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts per call site, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff interval in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// OpenTelemetry endpoint
    pub otel_endpoint: Option<String>,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 120 }
fn default_llm_base() -> String { "https://api.openai.com/v1".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_temperature() -> f32 { 0.2 }
fn default_max_tokens() -> u32 { 800 }
fn default_moderation_base() -> String { "https://api.groq.com/openai/v1".to_string() }
fn default_moderation_model() -> String { "meta-llama/llama-guard-4-12b".to_string() }
fn default_allowed_categories() -> Vec<String> { vec!["S6".to_string(), "S7".to_string()] }
fn default_retrieval_provider() -> String { "http".to_string() }
fn default_top_k() -> usize { 3 }
fn default_memory_provider() -> String { "in_memory".to_string() }
fn default_mem0_base() -> String { "https://api.mem0.ai".to_string() }
fn default_memory_limit() -> usize { 3 }
fn default_hourly_limit() -> u32 { 10 }
fn default_daily_limit() -> u32 { 25 }
fn default_counter_store() -> String { "file".to_string() }
fn default_counter_path() -> String { "data/usage.json".to_string() }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_global_rps() -> u32 { 20 }
fn default_burst() -> u32 { 40 }
fn default_max_rounds() -> u32 { 3 }
fn default_threshold() -> f32 { 0.7 }
fn default_call_timeout() -> u64 { 20_000 }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 2_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "nutrisage".to_string() }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            trust_forwarded_for: default_enabled(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_llm_base(),
            api_key: None,
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            llm_query_expansion: default_enabled(),
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            api_base: default_moderation_base(),
            api_key: None,
            model: default_moderation_model(),
            allowed_categories: default_allowed_categories(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            provider: default_retrieval_provider(),
            endpoint: None,
            corpus_path: None,
            top_k: default_top_k(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            provider: default_memory_provider(),
            api_base: default_mem0_base(),
            api_key: None,
            search_limit: default_memory_limit(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_limit: default_hourly_limit(),
            daily_limit: default_daily_limit(),
            store: default_counter_store(),
            file_path: default_counter_path(),
            redis_url: default_redis_url(),
            global_requests_per_second: default_global_rps(),
            global_burst: default_burst(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            groundedness_threshold: default_threshold(),
            precision_threshold: default_threshold(),
            call_timeout_ms: default_call_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            otel_endpoint: None,
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            moderation: ModerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            memory: MemoryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            refinement: RefinementConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__RATE_LIMIT__HOURLY_LIMIT=20
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Self = config.try_deserialize()?;
        config.apply_credential_fallbacks();
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Self = config.try_deserialize()?;
        config.apply_credential_fallbacks();
        config.validate()?;
        Ok(config)
    }

    /// Fill missing API keys from the providers' conventional variables
    fn apply_credential_fallbacks(&mut self) {
        fn fallback(slot: &mut Option<String>, var: &str) {
            if slot.as_deref().map_or(true, str::is_empty) {
                *slot = std::env::var(var).ok().filter(|v| !v.is_empty());
            }
        }

        fallback(&mut self.llm.api_key, "OPENAI_API_KEY");
        fallback(&mut self.moderation.api_key, "GROQ_API_KEY");
        fallback(&mut self.memory.api_key, "MEM0_API_KEY");
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let refinement = &self.refinement;
        if refinement.max_rounds == 0 {
            return Err(ConfigError::Message(
                "refinement.max_rounds must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("groundedness_threshold", refinement.groundedness_threshold),
            ("precision_threshold", refinement.precision_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Message(format!(
                    "refinement.{} must be within 0.0..=1.0, got {}",
                    name, value
                )));
            }
        }
        if refinement.retry.max_attempts == 0 {
            return Err(ConfigError::Message(
                "refinement.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.hourly_limit == 0 || self.rate_limit.daily_limit == 0 {
            return Err(ConfigError::Message(
                "rate_limit ceilings must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get the per-call collaborator timeout as Duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.refinement.call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.rate_limit.hourly_limit, 10);
        assert_eq!(config.rate_limit.daily_limit, 25);
        assert_eq!(config.refinement.max_rounds, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_rounds() {
        let mut config = AppConfig::default();
        config.refinement.max_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let mut config = AppConfig::default();
        config.refinement.precision_threshold = 8.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_guard_allows_advice_and_privacy_by_default() {
        let config = AppConfig::default();
        assert_eq!(config.moderation.allowed_categories, vec!["S6", "S7"]);
    }
}
