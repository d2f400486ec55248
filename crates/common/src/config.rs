//! Configuration structures for ChatGate
//!
//! This module defines all configuration types used by the worker and the server.
//! Configurations are loaded from YAML files and can be overridden by environment
//! variables (`CHATGATE__SECTION__KEY`). They are read once at startup and never
//! change afterwards.

use crate::error::{ChatGateError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "CHATGATE";

/// Top-level configuration for ChatGate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Model and tokenizer artifact locations
    #[serde(default)]
    pub model: ModelConfig,

    /// Generation hyperparameters
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Admission and worker pool settings
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory served under `/static`
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    /// Directory holding `index.html`
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
}

/// Model artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory with `config.json` and `model.safetensors`
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Directory with `tokenizer.json` or `vocab.json` plus `merges.txt`, and optionally `tokenizer_config.json`
    #[serde(default = "default_tokenizer_dir")]
    pub tokenizer_dir: PathBuf,
}

/// Generation parameters
///
/// Everything here is fixed at configuration time except `eos_token_id`,
/// which the resource loader fills in exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Sampling temperature (only used when `do_sample` is set)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling threshold (only used when `do_sample` is set)
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Repetition penalty (1.0 = no penalty)
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// Sample instead of greedy argmax
    #[serde(default)]
    pub do_sample: bool,

    /// Random seed for sampling (None = fresh entropy per request)
    #[serde(default)]
    pub seed: Option<u64>,

    /// End-of-sequence / padding token id, resolved at resource load
    #[serde(skip)]
    pub eos_token_id: Option<u32>,
}

/// Admission gate and blocking pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum number of generations running at once
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Number of blocking worker threads (0 = CPU count)
    #[serde(default)]
    pub worker_threads: usize,

    /// Load the model in the background at startup
    #[serde(default)]
    pub preload: bool,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Expose Prometheus metrics on `/metrics`
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8008
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models/Gpt-model")
}

fn default_tokenizer_dir() -> PathBuf {
    PathBuf::from("models/Gpt-tokenizer")
}

fn default_max_new_tokens() -> usize {
    50
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_repetition_penalty() -> f32 {
    1.2
}

fn default_max_concurrent_requests() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            static_dir: default_static_dir(),
            templates_dir: default_templates_dir(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            tokenizer_dir: default_tokenizer_dir(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            do_sample: false,
            seed: None,
            eos_token_id: None,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            worker_threads: 0,
            preload: false,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding with no repetition penalty
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            repetition_penalty: 1.0,
            do_sample: false,
            ..Self::default()
        }
    }

    /// Freeze the end-of-sequence token id into a copy of this config
    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(ChatGateError::config("max_new_tokens must be greater than zero"));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(ChatGateError::config(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        if self.do_sample {
            if !(self.temperature > 0.0) {
                return Err(ChatGateError::config(format!(
                    "temperature must be positive when sampling, got {}",
                    self.temperature
                )));
            }
            if !(self.top_p > 0.0 && self.top_p <= 1.0) {
                return Err(ChatGateError::config(format!(
                    "top_p must be in (0, 1], got {}",
                    self.top_p
                )));
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ChatGateError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config = Self::from_yaml_str(&content)
            .map_err(|e| ChatGateError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        Ok(config)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)
            .map_err(|e| ChatGateError::config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration layered as defaults, then the optional YAML file, then
    /// `CHATGATE__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: AppConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|layered| layered.try_deserialize())
            .map_err(|e| ChatGateError::config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.concurrency.max_concurrent_requests == 0 {
            return Err(ChatGateError::config("max_concurrent_requests must be at least 1"));
        }

        self.generation.validate()
    }

    /// Address the HTTP server binds to
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.bind_address, self.server.port)
            .parse()
            .map_err(|e| ChatGateError::config(format!("Invalid bind address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();

        assert_eq!(config.server.port, 8008);
        assert_eq!(config.model.model_dir, PathBuf::from("models/Gpt-model"));
        assert_eq!(config.model.tokenizer_dir, PathBuf::from("models/Gpt-tokenizer"));
        assert_eq!(config.generation.max_new_tokens, 50);
        assert_eq!(config.generation.repetition_penalty, 1.2);
        assert_eq!(config.concurrency.max_concurrent_requests, 5);
        assert!(config.generation.eos_token_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml_str(
            "server:\n  port: 9000\nconcurrency:\n  max_concurrent_requests: 2\n",
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.concurrency.max_concurrent_requests, 2);
        assert_eq!(config.generation.top_p, 0.9);
    }

    #[test]
    fn test_eos_token_id_not_configurable() {
        let config = AppConfig::from_yaml_str("generation:\n  eos_token_id: 7\n").unwrap();
        assert!(config.generation.eos_token_id.is_none());
    }

    #[test]
    fn test_config_validation_zero_concurrency() {
        let mut config = AppConfig::default();
        config.concurrency.max_concurrent_requests = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_address() {
        let mut config = AppConfig::default();
        config.server.bind_address = "not an address".to_string();

        assert!(matches!(config.validate(), Err(ChatGateError::Config(_))));
    }

    #[test]
    fn test_sampling_parameters_checked_only_when_sampling() {
        let mut generation = GenerationConfig::default();
        generation.top_p = 0.0;
        assert!(generation.validate().is_ok());

        generation.do_sample = true;
        assert!(generation.validate().is_err());
    }

    #[test]
    fn test_with_eos_token_id() {
        let generation = GenerationConfig::greedy(8).with_eos_token_id(50256);
        assert_eq!(generation.eos_token_id, Some(50256));
        assert_eq!(generation.repetition_penalty, 1.0);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "generation:\n  max_new_tokens: 16\n  do_sample: true\n  seed: 42").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.generation.max_new_tokens, 16);
        assert!(config.generation.do_sample);
        assert_eq!(config.generation.seed, Some(42));

        let from_file = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(from_file.generation, config.generation);
    }

    #[test]
    fn test_from_file_missing() {
        let result = AppConfig::from_file("/nonexistent/chatgate.yaml");
        assert!(matches!(result, Err(ChatGateError::Config(_))));
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let shipped = AppConfig::from_yaml_str(include_str!("../../../configs/chatgate.yaml")).unwrap();
        let defaults = AppConfig::default();

        assert_eq!(shipped.generation, defaults.generation);
        assert_eq!(shipped.server.port, defaults.server.port);
        assert_eq!(shipped.concurrency.max_concurrent_requests, 5);
    }
}
