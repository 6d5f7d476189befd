use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

pub const DEFAULT_MODEL_NAME: &str = "maziyarpanahi/mistral-7b-instruct-v0.3";

#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
  Memory,
  Redis { url: String },
}

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  pub client_secret: String,
  pub store: StoreBackend,
  pub worker_ttl: Duration,
  pub dispatch_timeout: Duration,
  pub callback_timeout: Duration,
  pub task_deadline: Duration,
  pub sweep_interval: Duration,
  pub validation_enabled: bool,
  pub max_validation_rounds: u32,
  pub default_model_name: String,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let secs = |key: &str, default: u64| {
      Duration::from_secs(lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default))
    };
    // Periods must be non-zero; zero falls back like an unparsable value.
    let period = |key: &str, default: u64| match secs(key, default) {
      d if d.is_zero() => Duration::from_secs(default),
      d => d,
    };

    let client_secret = lookup("CLIENT_SECRET")
      .filter(|s| !s.is_empty())
      .ok_or_else(|| anyhow!("CLIENT_SECRET must be set"))?;

    let store = match lookup("STORE_BACKEND").as_deref().unwrap_or("memory") {
      "memory" => StoreBackend::Memory,
      "redis" => StoreBackend::Redis {
        url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
      },
      other => bail!("unknown STORE_BACKEND '{}', expected memory or redis", other),
    };

    Ok(Self {
      server_port: lookup("SERVER_PORT")
        .unwrap_or_else(|| "8080".into())
        .parse()
        .unwrap_or(8080),
      client_secret,
      store,
      worker_ttl: period("WORKER_TTL_SECS", 180),
      dispatch_timeout: secs("DISPATCH_TIMEOUT_SECS", 20),
      callback_timeout: secs("CALLBACK_TIMEOUT_SECS", 10),
      task_deadline: secs("TASK_DEADLINE_SECS", 600),
      sweep_interval: period("SWEEP_INTERVAL_SECS", 15),
      validation_enabled: lookup("VALIDATION_ENABLED")
        .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
        .unwrap_or(true),
      max_validation_rounds: lookup("MAX_VALIDATION_ROUNDS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(3),
      default_model_name: lookup("DEFAULT_MODEL_NAME").unwrap_or_else(|| DEFAULT_MODEL_NAME.into()),
    })
  }
}
