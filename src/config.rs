use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::{CallParams, ChatMessage};
use crate::error::FarmError;

/// Config file read from the working directory when `APIFARM_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "apifarm.toml";

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8081";
pub const DEFAULT_MODEL: &str = "meta/llama-3.1-8b-instruct";
pub const DEFAULT_CONCURRENCY: usize = 200;

/// Prompt sent by the stress run. Short so the server does little work per call.
pub const DEFAULT_PROMPT: &str = "What is 1+1? Answer briefly.";

#[derive(Clone)]
pub struct Config {
    pub server_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Number of requests in a stress run.
    pub requests: usize,
    pub concurrency: usize,
    pub timeout: Duration,
    pub prompt: String,
}

/// On-disk layout. Every key is optional; missing keys keep their default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    requests: Option<usize>,
    concurrency: Option<usize>,
    timeout_ms: Option<u64>,
    prompt: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 5000,
            requests: 10_000,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_millis(600_000),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_url", &self.server_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("requests", &self.requests)
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Defaults, then the TOML file, then `APIFARM_*` environment variables.
    pub fn load() -> Result<Self, FarmError> {
        let path = match env::var("APIFARM_CONFIG") {
            Ok(p) => Some(PathBuf::from(p)),
            Err(_) => {
                let p = PathBuf::from(DEFAULT_CONFIG_FILE);
                p.exists().then_some(p)
            }
        };

        let file = match path {
            Some(p) => Some(read_file(&p)?),
            None => None,
        };

        Self::from_sources(file.as_deref(), |key| env::var(key).ok())
    }

    /// Merge an optional TOML document and an environment lookup over the defaults.
    pub fn from_sources(
        toml_src: Option<&str>,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, FarmError> {
        let mut config = Config::default();

        if let Some(src) = toml_src {
            let file: FileConfig =
                toml::from_str(src).map_err(|e| FarmError::Config(format!("invalid config file: {e}")))?;
            config.apply_file(file);
        }

        if let Some(v) = env_lookup("APIFARM_SERVER_URL") {
            config.server_url = v;
        }
        if let Some(v) = env_lookup("APIFARM_API_KEY") {
            config.api_key = (!v.trim().is_empty()).then_some(v);
        }
        if let Some(v) = env_lookup("APIFARM_MODEL") {
            config.model = v;
        }
        if let Some(v) = env_lookup("APIFARM_TEMPERATURE") {
            config.temperature = parse_var("APIFARM_TEMPERATURE", &v)?;
        }
        if let Some(v) = env_lookup("APIFARM_MAX_TOKENS") {
            config.max_tokens = parse_var("APIFARM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = env_lookup("APIFARM_REQUESTS") {
            config.requests = parse_var("APIFARM_REQUESTS", &v)?;
        }
        if let Some(v) = env_lookup("APIFARM_CONCURRENCY") {
            config.concurrency = parse_var("APIFARM_CONCURRENCY", &v)?;
        }
        if let Some(v) = env_lookup("APIFARM_TIMEOUT_MS") {
            config.timeout = Duration::from_millis(parse_var("APIFARM_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = env_lookup("APIFARM_PROMPT") {
            config.prompt = v;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.server_url {
            self.server_url = v;
        }
        if let Some(v) = file.api_key {
            self.api_key = (!v.trim().is_empty()).then_some(v);
        }
        if let Some(v) = file.model {
            self.model = v;
        }
        if let Some(v) = file.temperature {
            self.temperature = v;
        }
        if let Some(v) = file.max_tokens {
            self.max_tokens = v;
        }
        if let Some(v) = file.requests {
            self.requests = v;
        }
        if let Some(v) = file.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = file.timeout_ms {
            self.timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.prompt {
            self.prompt = v;
        }
    }

    pub fn validate(&self) -> Result<(), FarmError> {
        if self.server_url.trim().is_empty() {
            return Err(FarmError::Config("server_url must not be empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(FarmError::Config("concurrency must be at least 1".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(FarmError::Config("timeout_ms must be positive".to_string()));
        }
        self.call_params()
            .validate()
            .map_err(|e| FarmError::Config(e.user_message()))
    }

    pub fn call_params(&self) -> CallParams {
        CallParams::new(self.model.clone(), self.temperature, self.max_tokens)
    }

    /// `requests` copies of the configured prompt as a single user turn.
    pub fn stress_messages(&self) -> Vec<Vec<ChatMessage>> {
        let base = vec![ChatMessage::user(self.prompt.clone())];
        vec![base; self.requests]
    }
}

fn read_file(path: &Path) -> Result<String, FarmError> {
    std::fs::read_to_string(path)
        .map_err(|e| FarmError::Config(format!("failed to read {}: {e}", path.display())))
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, FarmError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| FarmError::Config(format!("{key}={value:?}: {e}")))
}
