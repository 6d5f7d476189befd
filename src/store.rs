//! Worker record persistence.
//!
//! Two interchangeable backends share one liveness rule: a record whose
//! `last_update` is older than the configured TTL is gone. The memory store
//! sweeps lazily on read, Redis expires keys natively.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::Worker;
use crate::retry::{with_retry, RetryPolicy};

pub const KEY_PREFIX: &str = "worker:";

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("redis error: {0}")]
  Redis(#[from] redis::RedisError),
  #[error("corrupt worker record at {key}: {source}")]
  Corrupt {
    key: String,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusySwap {
  Swapped(Worker),
  Conflict(Worker),
  Missing,
}

#[async_trait]
pub trait ClientStore: Send + Sync {
  async fn register(&self, worker: Worker) -> Result<Worker, StoreError>;
  async fn get(&self, id: &Uuid) -> Result<Option<Worker>, StoreError>;
  async fn all(&self) -> Result<Vec<Worker>, StoreError>;
  async fn delete(&self, id: &Uuid) -> Result<Option<Worker>, StoreError>;
  /// Touches `ping` (when given) and `last_update`, never `busy`.
  async fn refresh(&self, id: &Uuid, ping: Option<u32>) -> Result<Option<Worker>, StoreError>;
  async fn swap_busy(&self, id: &Uuid, expected: bool, busy: bool) -> Result<BusySwap, StoreError>;
}

fn expired(last_update: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
  // Negative ages (clock skew) convert to an error and count as live.
  (now - last_update).to_std().map(|age| age > ttl).unwrap_or(false)
}

pub struct MemoryClientStore {
  workers: RwLock<HashMap<Uuid, Worker>>,
  ttl: Duration,
}

impl MemoryClientStore {
  pub fn new(ttl: Duration) -> Self {
    Self {
      workers: RwLock::new(HashMap::new()),
      ttl,
    }
  }

  fn live(&self, worker: &Worker) -> bool {
    !expired(worker.last_update, Utc::now(), self.ttl)
  }
}

#[async_trait]
impl ClientStore for MemoryClientStore {
  async fn register(&self, mut worker: Worker) -> Result<Worker, StoreError> {
    worker.last_update = Utc::now();
    self.workers.write().insert(worker.id, worker.clone());
    Ok(worker)
  }

  async fn get(&self, id: &Uuid) -> Result<Option<Worker>, StoreError> {
    Ok(self.workers.read().get(id).filter(|w| self.live(w)).cloned())
  }

  async fn all(&self) -> Result<Vec<Worker>, StoreError> {
    let now = Utc::now();
    let mut workers = self.workers.write();
    let before = workers.len();
    workers.retain(|_, w| !expired(w.last_update, now, self.ttl));
    if workers.len() < before {
      debug!("Swept {} expired workers", before - workers.len());
    }
    Ok(workers.values().cloned().collect())
  }

  async fn delete(&self, id: &Uuid) -> Result<Option<Worker>, StoreError> {
    Ok(self.workers.write().remove(id).filter(|w| self.live(w)))
  }

  async fn refresh(&self, id: &Uuid, ping: Option<u32>) -> Result<Option<Worker>, StoreError> {
    let mut workers = self.workers.write();
    let Some(worker) = workers.get_mut(id) else {
      return Ok(None);
    };
    if expired(worker.last_update, Utc::now(), self.ttl) {
      workers.remove(id);
      return Ok(None);
    }
    if ping.is_some() {
      worker.ping = ping;
    }
    worker.last_update = Utc::now();
    Ok(Some(worker.clone()))
  }

  async fn swap_busy(&self, id: &Uuid, expected: bool, busy: bool) -> Result<BusySwap, StoreError> {
    let mut workers = self.workers.write();
    let swap = match workers.get_mut(id) {
      Some(worker) if expired(worker.last_update, Utc::now(), self.ttl) => None,
      Some(worker) if worker.busy != expected => Some(BusySwap::Conflict(worker.clone())),
      Some(worker) => {
        worker.busy = busy;
        Some(BusySwap::Swapped(worker.clone()))
      }
      None => Some(BusySwap::Missing),
    };
    Ok(swap.unwrap_or_else(|| {
      workers.remove(id);
      BusySwap::Missing
    }))
  }
}

const SWAP_BUSY_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {0, ''} end
local worker = cjson.decode(raw)
if worker.busy ~= (ARGV[1] == '1') then return {1, raw} end
worker.busy = (ARGV[2] == '1')
local encoded = cjson.encode(worker)
redis.call('SET', KEYS[1], encoded, 'KEEPTTL')
return {2, encoded}
"#;

const REFRESH_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {0, ''} end
local worker = cjson.decode(raw)
if ARGV[1] ~= '' then worker.ping = tonumber(ARGV[1]) end
worker.lastUpdate = ARGV[2]
local encoded = cjson.encode(worker)
redis.call('SET', KEYS[1], encoded, 'EX', ARGV[3])
return {2, encoded}
"#;

pub fn worker_key(id: &Uuid) -> String {
  format!("{}{}", KEY_PREFIX, id)
}

fn decode(key: &str, raw: &str) -> Result<Worker, StoreError> {
  serde_json::from_str(raw).map_err(|source| StoreError::Corrupt { key: key.to_string(), source })
}

fn encode(worker: &Worker) -> String {
  // Worker has no map keys or non-finite floats, so serialization cannot fail.
  serde_json::to_string(worker).unwrap_or_default()
}

/// Shared store backed by Redis; keys are `worker:<id>` with a TTL.
pub struct RedisClientStore {
  conn: ConnectionManager,
  ttl: Duration,
  swap_script: Script,
  refresh_script: Script,
}

impl RedisClientStore {
  pub async fn connect(url: &str, ttl: Duration, retry: &RetryPolicy) -> Result<Self, StoreError> {
    let client = redis::Client::open(url)?;
    let conn = with_retry(retry, || ConnectionManager::new(client.clone()), |e: &redis::RedisError| {
      warn!("Redis connection attempt failed: {}", e);
      true
    })
      .await?;
    info!("Connected to worker store at {}", url);
    Ok(Self {
      conn,
      ttl,
      swap_script: Script::new(SWAP_BUSY_LUA),
      refresh_script: Script::new(REFRESH_LUA),
    })
  }

  fn ttl_secs(&self) -> u64 {
    self.ttl.as_secs().max(1)
  }

  fn scripted(key: &str, code: i64, raw: String) -> Result<Option<Worker>, StoreError> {
    match code {
      0 => Ok(None),
      _ => decode(key, &raw).map(Some),
    }
  }
}

#[async_trait]
impl ClientStore for RedisClientStore {
  async fn register(&self, mut worker: Worker) -> Result<Worker, StoreError> {
    worker.last_update = Utc::now();
    let mut conn = self.conn.clone();
    let _: () = redis::cmd("SET")
      .arg(worker_key(&worker.id))
      .arg(encode(&worker))
      .arg("EX")
      .arg(self.ttl_secs())
      .query_async(&mut conn)
      .await?;
    Ok(worker)
  }

  async fn get(&self, id: &Uuid) -> Result<Option<Worker>, StoreError> {
    let key = worker_key(id);
    let mut conn = self.conn.clone();
    let raw: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
    raw.map(|raw| decode(&key, &raw)).transpose()
  }

  async fn all(&self) -> Result<Vec<Worker>, StoreError> {
    let mut conn = self.conn.clone();
    let pattern = format!("{}*", KEY_PREFIX);
    let mut keys = BTreeSet::new();
    let mut cursor: u64 = 0;
    loop {
      let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(&pattern)
        .arg("COUNT")
        .arg(100)
        .query_async(&mut conn)
        .await?;
      keys.extend(batch);
      if next == 0 {
        break;
      }
      cursor = next;
    }
    if keys.is_empty() {
      return Ok(vec![]);
    }

    let mut pipe = redis::pipe();
    for key in &keys {
      pipe.cmd("GET").arg(key);
    }
    let raws: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

    // Keys that expired between SCAN and GET come back empty.
    keys.iter()
      .zip(raws)
      .filter_map(|(key, raw)| raw.map(|raw| decode(key, &raw)))
      .collect()
  }

  async fn delete(&self, id: &Uuid) -> Result<Option<Worker>, StoreError> {
    let key = worker_key(id);
    let mut conn = self.conn.clone();
    let raw: Option<String> = redis::cmd("GETDEL").arg(&key).query_async(&mut conn).await?;
    raw.map(|raw| decode(&key, &raw)).transpose()
  }

  async fn refresh(&self, id: &Uuid, ping: Option<u32>) -> Result<Option<Worker>, StoreError> {
    let key = worker_key(id);
    let mut conn = self.conn.clone();
    let (code, raw): (i64, String) = self.refresh_script
      .key(&key)
      .arg(ping.map(|p| p.to_string()).unwrap_or_default())
      .arg(Utc::now().to_rfc3339())
      .arg(self.ttl_secs())
      .invoke_async(&mut conn)
      .await?;
    Self::scripted(&key, code, raw)
  }

  async fn swap_busy(&self, id: &Uuid, expected: bool, busy: bool) -> Result<BusySwap, StoreError> {
    let key = worker_key(id);
    let mut conn = self.conn.clone();
    let (code, raw): (i64, String) = self.swap_script
      .key(&key)
      .arg(if expected { "1" } else { "0" })
      .arg(if busy { "1" } else { "0" })
      .invoke_async(&mut conn)
      .await?;
    Ok(match (code, Self::scripted(&key, code, raw)?) {
      (1, Some(current)) => BusySwap::Conflict(current),
      (_, Some(updated)) => BusySwap::Swapped(updated),
      (_, None) => BusySwap::Missing,
    })
  }
}
