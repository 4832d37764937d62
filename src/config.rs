//! Configuration for the proxy.
//!
//! Layered: typed defaults, an optional YAML file, then environment
//! variable overrides for the handful of settings operators actually flip
//! at deploy time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Ceiling and safety margin for one model family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimits {
    pub input_tokens_per_minute: u64,
    pub output_tokens_per_minute: u64,
    pub requests_per_minute: u64,
    pub safety_factor: f64,
}

impl ModelLimits {
    pub fn safe_input_tokens_per_minute(&self) -> u64 {
        (self.input_tokens_per_minute as f64 * self.safety_factor).floor() as u64
    }

    pub fn safe_requests_per_minute(&self) -> u64 {
        (self.requests_per_minute as f64 * self.safety_factor).floor() as u64
    }
}

/// Bounded-retry backoff parameters for the upstream caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_millis: u64,
    pub max_delay_millis: u64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_millis: 500,
            max_delay_millis: 30_000,
            jitter_fraction: 0.2,
        }
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_addr: String,
    pub log_level: String,
    pub upstream_url: String,
    pub upstream_credential: String,
    pub max_concurrent: usize,
    pub daily_tokens_per_tenant: u64,
    pub max_request_wait_millis: u64,
    pub model_limits: HashMap<String, ModelLimits>,
    pub forbidden_models: Vec<String>,
    pub downgrade_to: HashMap<String, String>,
    pub retry: RetryPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let mut model_limits = HashMap::new();
        model_limits.insert(
            "opus-4".to_string(),
            ModelLimits {
                input_tokens_per_minute: 30_000,
                output_tokens_per_minute: 8_000,
                requests_per_minute: 30,
                safety_factor: 0.75,
            },
        );
        model_limits.insert(
            "sonnet-4".to_string(),
            ModelLimits {
                input_tokens_per_minute: 80_000,
                output_tokens_per_minute: 16_000,
                requests_per_minute: 60,
                safety_factor: 0.75,
            },
        );
        model_limits.insert(
            "default".to_string(),
            ModelLimits {
                input_tokens_per_minute: 40_000,
                output_tokens_per_minute: 8_000,
                requests_per_minute: 40,
                safety_factor: 0.75,
            },
        );

        let mut downgrade_to = HashMap::new();
        downgrade_to.insert("opus-4".to_string(), "sonnet-4".to_string());

        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            upstream_url: "https://api.anthropic.com/v1/messages".to_string(),
            upstream_credential: String::new(),
            max_concurrent: 5,
            daily_tokens_per_tenant: 500_000,
            max_request_wait_millis: 60_000,
            model_limits,
            forbidden_models: vec!["opus-4".to_string()],
            downgrade_to,
            retry: RetryPolicy::default(),
        }
    }
}

impl ProxyConfig {
    /// Look up the configured limits for a family, falling back to `default`.
    pub fn limits_for(&self, family: &str) -> &ModelLimits {
        self.model_limits
            .get(family)
            .or_else(|| self.model_limits.get("default"))
            .expect("config must define a \"default\" model family")
    }

    /// Whether `family` is in the forbidden list and should be downgraded,
    /// returning the fallback family to use in its place.
    pub fn downgrade_for(&self, family: &str) -> Option<&str> {
        if self.forbidden_models.iter().any(|f| f == family) {
            self.downgrade_to.get(family).map(String::as_str)
        } else {
            None
        }
    }

    /// Load configuration: explicit path, then `~/.config/anthropic-proxy/config.yml`,
    /// then `./anthropic-proxy.yml`, then environment overrides on top of defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::load_from_file(path)
                .context(format!("failed to load config from {}", path.display()))?
        } else if let Some(config_dir) = dirs::config_dir() {
            let primary = config_dir.join("anthropic-proxy").join("config.yml");
            if primary.exists() {
                Self::load_from_file(&primary)?
            } else {
                let fallback = PathBuf::from("anthropic-proxy.yml");
                if fallback.exists() {
                    Self::load_from_file(&fallback)?
                } else {
                    tracing::info!("no config file found, using defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).context("failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("failed to parse config file")?;
        tracing::info!(path = %path.as_ref().display(), "loaded config from file");
        Ok(config)
    }

    /// Environment variables take precedence over file and defaults, per §6.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("UPSTREAM_URL") {
            self.upstream_url = v;
        }
        if let Ok(v) = std::env::var("UPSTREAM_CREDENTIAL") {
            self.upstream_credential = v;
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL").or_else(|_| std::env::var("RUST_LOG")) {
            self.log_level = v;
        }
        if let Ok(factor) = std::env::var("SAFETY_FACTOR").ok().and_then(|v| v.parse::<f64>().ok()).ok_or(()) {
            for limits in self.model_limits.values_mut() {
                limits.safety_factor = factor;
            }
        }
        if let Ok(v) = env_u32("MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Ok(v) = env_usize("MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Ok(v) = env_u64("DAILY_TOKEN_BUDGET_PER_TENANT") {
            self.daily_tokens_per_tenant = v;
        }
        if let Ok(v) = env_u64("MAX_REQUEST_WAIT_MILLIS") {
            self.max_request_wait_millis = v;
        }
        if let Ok(raw) = std::env::var("MODEL_LIMITS") {
            match serde_json::from_str::<HashMap<String, ModelLimits>>(&raw) {
                Ok(limits) => self.model_limits.extend(limits),
                Err(e) => tracing::warn!(error = %e, "ignoring malformed MODEL_LIMITS"),
            }
        }
        if let Ok(raw) = std::env::var("FORBIDDEN_MODELS") {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(models) => self.forbidden_models = models,
                Err(_) => {
                    self.forbidden_models = raw.split(',').map(|s| s.trim().to_string()).collect();
                }
            }
        }
    }
}

fn env_u64(name: &str) -> std::result::Result<u64, ()> {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).ok_or(())
}

fn env_u32(name: &str) -> std::result::Result<u32, ()> {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).ok_or(())
}

fn env_usize(name: &str) -> std::result::Result<usize, ()> {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).ok_or(())
}
