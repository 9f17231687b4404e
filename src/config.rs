//! Batch configuration loaded from `vlm-batch.toml`.
//!
//! [`BatchConfig`] holds every tunable. Fields missing from the file use
//! defaults. `VLM_*` environment variables (a `.env` file is honored) take
//! precedence over the file; CLI flags are applied last by the binary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::PoolError;
use crate::executor::ValidationPolicy;
use crate::ledger::Pricing;
use crate::orchestrator::PoolSettings;
use crate::scoring::ClientSettings;
use crate::source::DEFAULT_EXTENSIONS;
use crate::state_machine::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "vlm-batch.toml";

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Chat-completions endpoint of the scoring service.
    pub api_endpoint: String,
    pub api_token: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-attempt limit, including the response body.
    pub request_timeout_secs: u64,
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub validation_policy: ValidationPolicy,
    pub shutdown_grace_secs: u64,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    /// Input file extensions, matched case-insensitively.
    pub extensions: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let pricing = Pricing::default();
        Self {
            api_endpoint: String::new(),
            api_token: String::new(),
            model_name: String::new(),
            max_tokens: 16_384,
            temperature: 0.3,
            request_timeout_secs: 180,
            max_concurrency: 50_000,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.1,
            validation_policy: ValidationPolicy::default(),
            shutdown_grace_secs: 30,
            input_price_per_million: pricing.input_per_million,
            output_price_per_million: pricing.output_per_million,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// Keeps the token out of logs and panic messages.
impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("api_endpoint", &self.api_endpoint)
            .field("api_token", &mask_token(&self.api_token))
            .field("model_name", &self.model_name)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("jitter", &self.jitter)
            .field("validation_policy", &self.validation_policy)
            .field("shutdown_grace_secs", &self.shutdown_grace_secs)
            .field("input_price_per_million", &self.input_price_per_million)
            .field("output_price_per_million", &self.output_price_per_million)
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// `abcd…wxyz` for long tokens, `***` otherwise.
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "***".into();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

impl BatchConfig {
    /// Load `path` (or `vlm-batch.toml` in the working directory), then apply
    /// `.env` and process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path.is_some();
        let path: PathBuf = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<BatchConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else if explicit {
            anyhow::bail!("config file {} not found", path.display());
        } else {
            Self::default()
        };

        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from `VLM_*` variables resolved through `lookup`.
    /// Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), PoolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("VLM_API_ENDPOINT") {
            self.api_endpoint = v;
        }
        if let Some(v) = get("VLM_API_TOKEN") {
            self.api_token = v;
        }
        if let Some(v) = get("VLM_MODEL_NAME") {
            self.model_name = v;
        }
        if let Some(v) = get("VLM_MAX_TOKENS") {
            self.max_tokens = parse_var("VLM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("VLM_TEMPERATURE") {
            self.temperature = parse_var("VLM_TEMPERATURE", &v)?;
        }
        if let Some(v) = get("VLM_TIMEOUT") {
            self.request_timeout_secs = parse_var("VLM_TIMEOUT", &v)?;
        }
        if let Some(v) = get("VLM_CONCURRENT_LIMIT") {
            self.max_concurrency = parse_var("VLM_CONCURRENT_LIMIT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.api_endpoint.trim().is_empty() {
            return Err(PoolError::Config(
                "api_endpoint is not set (VLM_API_ENDPOINT)".into(),
            ));
        }
        if self.api_token.trim().is_empty() {
            return Err(PoolError::Config(
                "api_token is not set (VLM_API_TOKEN)".into(),
            ));
        }
        if self.model_name.trim().is_empty() {
            return Err(PoolError::Config(
                "model_name is not set (VLM_MODEL_NAME)".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(PoolError::Config("max_concurrency must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(PoolError::Config("max_attempts must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(PoolError::Config(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            endpoint: self.api_endpoint.clone(),
            api_token: self.api_token.clone(),
            model: self.model_name.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            request_timeout: self.request_timeout(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            ..RetryPolicy::default()
        }
        .with_jitter(self.jitter)
    }

    pub fn pool_settings(&self, force_rerun: bool) -> PoolSettings {
        PoolSettings {
            max_concurrency: self.max_concurrency,
            max_attempts: self.max_attempts,
            force_rerun,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn pricing(&self) -> Pricing {
        Pricing {
            input_per_million: self.input_price_per_million,
            output_per_million: self.output_price_per_million,
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PoolError> {
    value
        .trim()
        .parse()
        .map_err(|_| PoolError::Config(format!("{key}: invalid value {value:?}")))
}
