use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Per-session knobs. Everything except `max_iterations` and `stream` is
/// forwarded to the backend untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Backend request timeout in seconds.
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_iterations: default_max_iterations(),
            max_tokens: None,
            timeout_secs: default_timeout(),
            stream: false,
            system_prompt: None,
        }
    }
}

impl SessionConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Iteration limit used by the loop; never below one.
    pub fn iteration_limit(&self) -> usize {
        self.max_iterations.max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_timeout()))
    }
}

fn default_model() -> String {
    "gpt-oss:20b".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_iterations() -> usize {
    5
}

fn default_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl AgentConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|err| AgentError::Config(format!("Failed to parse configuration: {err}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_overrides(|key| env::var(key).ok());
        Ok(cfg)
    }

    /// Apply `HQ_*` overrides. Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("HQ_MODEL") {
            self.session.model = model;
        }
        if let Some(parsed) = lookup("HQ_TEMPERATURE").and_then(|v| v.parse::<f32>().ok()) {
            self.session.temperature = parsed;
        }
        if let Some(parsed) = lookup("HQ_MAX_ITERATIONS").and_then(|v| v.parse::<usize>().ok()) {
            self.session.max_iterations = parsed;
        }
        if let Some(parsed) = lookup("HQ_MAX_TOKENS").and_then(|v| v.parse::<u32>().ok()) {
            self.session.max_tokens = Some(parsed);
        }
        if let Some(parsed) = lookup("HQ_TIMEOUT_SECS").and_then(|v| v.parse::<f64>().ok()) {
            self.session.timeout_secs = parsed;
        }
        if let Some(parsed) = lookup("HQ_STREAM").and_then(|v| v.parse::<bool>().ok()) {
            self.session.stream = parsed;
        }
        if let Some(url) = lookup("HQ_BASE_URL") {
            self.backend.base_url = url;
        }
        if let Some(key) = lookup("HQ_API_KEY") {
            self.backend.api_key = Some(key);
        }
    }
}
