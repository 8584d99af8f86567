use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub inference_url: String,
    pub inference_model: String,
    pub inference_api_key: Option<String>,
    pub inference_timeout_seconds: u64,
    pub inference_max_tokens: u32,
    pub inference_temperature: f32,
    pub data_dir: PathBuf,
    pub broker_topic: String,
    pub consumer_group: String,
    pub poll_timeout_ms: u64,
    pub max_in_flight: usize,
    pub history_window: usize,
    pub cache_capacity: u64,
    pub session_ttl_days: u64,
    pub owner_ttl_days: u64,
    pub history_cas_retries: u32,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset keys take defaults;
    /// set but malformed values are errors.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let max_in_flight = match get("MAX_IN_FLIGHT", "auto").as_str() {
            "auto" => Self::auto_detect_in_flight(),
            raw => parse_value("MAX_IN_FLIGHT", raw)?,
        };

        Ok(Self {
            inference_url: get("INFERENCE_URL", "http://127.0.0.1:8081"),
            inference_model: get("INFERENCE_MODEL", "default"),
            inference_api_key: lookup("INFERENCE_API_KEY").filter(|key| !key.trim().is_empty()),
            inference_timeout_seconds: parse_value(
                "INFERENCE_TIMEOUT_SECONDS",
                &get("INFERENCE_TIMEOUT_SECONDS", "120"),
            )?,
            inference_max_tokens: parse_value(
                "INFERENCE_MAX_TOKENS",
                &get("INFERENCE_MAX_TOKENS", "1024"),
            )?,
            inference_temperature: parse_value(
                "INFERENCE_TEMPERATURE",
                &get("INFERENCE_TEMPERATURE", "0.1"),
            )?,
            data_dir: PathBuf::from(get("DATA_DIR", "./data")),
            broker_topic: get("BROKER_TOPIC", "assistant-requests"),
            consumer_group: get("CONSUMER_GROUP", "sqlpilot-workers"),
            poll_timeout_ms: parse_value("POLL_TIMEOUT_MS", &get("POLL_TIMEOUT_MS", "1000"))?,
            max_in_flight,
            history_window: parse_value("HISTORY_WINDOW", &get("HISTORY_WINDOW", "20"))?,
            cache_capacity: parse_value("CACHE_CAPACITY", &get("CACHE_CAPACITY", "10000"))?,
            session_ttl_days: parse_value("SESSION_TTL_DAYS", &get("SESSION_TTL_DAYS", "30"))?,
            owner_ttl_days: parse_value("OWNER_TTL_DAYS", &get("OWNER_TTL_DAYS", "365"))?,
            history_cas_retries: parse_value(
                "HISTORY_CAS_RETRIES",
                &get("HISTORY_CAS_RETRIES", "8"),
            )?,
        })
    }

    fn auto_detect_in_flight() -> usize {
        (num_cpus::get() * 2).clamp(2, 32)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_seconds)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_days * 24 * 60 * 60)
    }

    pub fn owner_ttl(&self) -> Duration {
        Duration::from_secs(self.owner_ttl_days * 24 * 60 * 60)
    }

    pub fn conversation_db_path(&self) -> PathBuf {
        self.data_dir.join("conversations.db")
    }

    pub fn broker_db_path(&self) -> PathBuf {
        self.data_dir.join("broker.db")
    }

    /// Session cache shared by ingress and worker processes.
    pub fn cache_db_path(&self) -> PathBuf {
        self.data_dir.join("session_cache.db")
    }

    pub fn print_config(&self) {
        info!("Configuration:");
        info!(
            "  Inference: {} (model {}, timeout {}s, max tokens {}, temperature {})",
            self.inference_url,
            self.inference_model,
            self.inference_timeout_seconds,
            self.inference_max_tokens,
            self.inference_temperature
        );
        info!(
            "  Inference API key: {}",
            if self.inference_api_key.is_some() { "<redacted>" } else { "<none>" }
        );
        info!("  Data dir: {}", self.data_dir.display());
        info!(
            "  Broker: topic {}, group {}, poll timeout {}ms, max in flight {}",
            self.broker_topic, self.consumer_group, self.poll_timeout_ms, self.max_in_flight
        );
        info!(
            "  Session cache: {}, session TTL {}d, owner TTL {}d, history window {}, CAS retries {}",
            self.cache_db_path().display(),
            self.session_ttl_days,
            self.owner_ttl_days,
            self.history_window,
            self.history_cas_retries
        );
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value {:?} for {}", raw, key))
}
