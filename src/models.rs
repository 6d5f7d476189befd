use std::sync::LazyLock;

use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use regex::Regex;

pub const DEFAULT_COUNT: u32 = 5;
pub const MAX_COUNT: u32 = 50;

static HTTP_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").expect("valid url regex"));
static MODEL_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w./:@-]+$").expect("valid model regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
  pub id: Uuid,
  pub address: String,
  pub model_name: String,
  pub ping: Option<u32>,
  pub busy: bool,
  pub last_update: DateTime<Utc>,
}

impl Worker {
  pub fn new(address: String, model_name: String) -> Self {
    Self {
      id: Uuid::new_v4(),
      address,
      model_name,
      ping: None,
      busy: false,
      last_update: Utc::now(),
    }
  }

  /// Joins `path` onto the worker address without doubling slashes.
  pub fn endpoint(&self, path: &str) -> String {
    format!("{}/{}", self.address.trim_end_matches('/'), path.trim_start_matches('/'))
  }
}

/// A seed or recommended book, as workers and callers exchange it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
  pub id: String,
  pub title: String,
  pub author: String,
  #[serde(default)]
  pub year: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub genre: String,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub cover: String,
  #[serde(default)]
  pub photos: Vec<String>,
  #[serde(default)]
  pub pages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Queued,
  Processing,
  Done,
  Failed,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Done | TaskStatus::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Queued => "queued",
      TaskStatus::Processing => "processing",
      TaskStatus::Done => "done",
      TaskStatus::Failed => "failed",
    }
  }
}

impl std::fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Which round trip the assigned worker is currently serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
  Generation,
  Validation,
}

/// How a `done` task was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  Validated,
  Unvalidated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
  pub seed_items: Vec<Book>,
  pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackTarget {
  pub url: String,
  pub caller_id: String,
  pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: Uuid,
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub request: GenerationRequest,
  /// Final result once `done`; while processing, the latest unconfirmed candidate.
  pub result: Option<Vec<Book>>,
  pub callback: CallbackTarget,
  pub worker_id: Option<Uuid>,
  pub stage: Option<Stage>,
  pub outcome: Option<Outcome>,
  pub error: Option<String>,
  pub excluded: Vec<String>,
  pub validation_rounds: u32,
  /// Workers that already generated for this task.
  #[serde(skip)]
  pub generators: Vec<Uuid>,
}

impl Task {
  pub fn new(request: GenerationRequest, callback: CallbackTarget) -> Self {
    Self {
      id: Uuid::new_v4(),
      status: TaskStatus::Queued,
      created_at: Utc::now(),
      completed_at: None,
      request,
      result: None,
      callback,
      worker_id: None,
      stage: None,
      outcome: None,
      error: None,
      excluded: vec![],
      validation_rounds: 0,
      generators: vec![],
    }
  }

  /// Best-effort answer: the current candidate minus anything a validator rejected.
  pub fn best_effort(&self) -> Vec<Book> {
    self.result
      .iter()
      .flatten()
      .filter(|book| !self.excluded.contains(&book.id))
      .take(self.request.count as usize)
      .cloned()
      .collect()
  }
}

// Inbound payloads

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWorker {
  pub address: String,
  pub model_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
  pub id: Uuid,
  pub ping: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGeneration {
  pub seed_items: Vec<Book>,
  pub count: Option<u32>,
  pub callback_url: String,
  pub caller_id: String,
  pub correlation_id: String,
}

impl RegisterWorker {
  pub fn validate(&self) -> Result<(), String> {
    if !HTTP_URL.is_match(&self.address) {
      return Err(format!("address '{}' is not an http(s) URL", self.address));
    }
    match &self.model_name {
      Some(name) if !MODEL_NAME.is_match(name) => Err(format!("invalid modelName '{}'", name)),
      _ => Ok(()),
    }
  }
}

impl NewGeneration {
  /// Checks the submission and splits it into the task request and callback target.
  pub fn into_parts(self) -> Result<(GenerationRequest, CallbackTarget), String> {
    if self.seed_items.is_empty() {
      return Err("seedItems must not be empty".into());
    }
    let count = self.count.unwrap_or(DEFAULT_COUNT);
    if !(1..=MAX_COUNT).contains(&count) {
      return Err(format!("count must be between 1 and {}", MAX_COUNT));
    }
    if !HTTP_URL.is_match(&self.callback_url) {
      return Err(format!("callbackUrl '{}' is not an http(s) URL", self.callback_url));
    }
    if self.caller_id.trim().is_empty() {
      return Err("callerId must not be empty".into());
    }
    Ok((
      GenerationRequest { seed_items: self.seed_items, count },
      CallbackTarget { url: self.callback_url, caller_id: self.caller_id, correlation_id: self.correlation_id },
    ))
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
  pub task_id: Uuid,
  pub result: Option<Vec<Book>>,
  pub ok: Option<bool>,
  #[serde(default)]
  pub invalid: Vec<String>,
}

// Outbound payloads

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
  pub task_id: Uuid,
  pub request: JobRequest,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
  pub seed_items: Vec<Book>,
  pub count: u32,
  pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationJob {
  pub task_id: Uuid,
  pub candidates: Vec<Book>,
  pub request: GenerationRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
  pub caller_id: String,
  pub correlation_id: String,
  pub task_id: Uuid,
  pub status: TaskStatus,
  pub validated: bool,
  pub recommendations: Vec<Book>,
  pub error: Option<String>,
}

impl CallbackPayload {
  pub fn for_task(task: &Task) -> Self {
    Self {
      caller_id: task.callback.caller_id.clone(),
      correlation_id: task.callback.correlation_id.clone(),
      task_id: task.id,
      status: task.status,
      validated: task.outcome == Some(Outcome::Validated),
      recommendations: task.result.clone().unwrap_or_default(),
      error: task.error.clone(),
    }
  }
}

impl GenerationJob {
  pub fn for_task(task: &Task) -> Self {
    Self {
      task_id: task.id,
      request: JobRequest {
        seed_items: task.request.seed_items.clone(),
        count: task.request.count,
        exclude: task.excluded.clone(),
      },
    }
  }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
  pub task_id: Uuid,
  pub status: SubmitStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStatus {
  Accepted,
  Queued,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
  pub alive: bool,
  pub uptime_seconds: u64,
  pub worker_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
  pub active_workers: usize,
  pub avg_ping: f64,
  pub busy_workers: usize,
}

impl Metrics {
  pub fn from_workers(workers: &[Worker]) -> Self {
    let pings: Vec<u32> = workers.iter().filter_map(|w| w.ping).collect();
    let avg_ping = if pings.is_empty() {
      0.0
    } else {
      pings.iter().map(|p| *p as f64).sum::<f64>() / pings.len() as f64
    };
    Self {
      active_workers: workers.len(),
      avg_ping,
      busy_workers: workers.iter().filter(|w| w.busy).count(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn book(id: &str) -> Book {
    Book {
      id: id.into(),
      title: format!("title {}", id),
      author: "author".into(),
      year: String::new(),
      description: String::new(),
      genre: String::new(),
      tags: vec![],
      cover: String::new(),
      photos: vec![],
      pages: 0,
    }
  }

  #[test]
  fn worker_serializes_camel_case_with_null_ping() {
    let worker = Worker::new("http://w1".into(), "m1".into());
    let json = serde_json::to_value(&worker).unwrap();
    assert_eq!(json["modelName"], "m1");
    assert!(json["ping"].is_null());
    assert_eq!(json["busy"], false);
    assert!(json.get("lastUpdate").is_some());
  }

  #[test]
  fn endpoint_joins_without_double_slash() {
    let worker = Worker::new("http://w1:9000/".into(), "m1".into());
    assert_eq!(worker.endpoint("/generate/"), "http://w1:9000/generate/");
  }

  #[test]
  fn book_optional_fields_default() {
    let parsed: Book = serde_json::from_str(r#"{"id":"1","title":"Dune","author":"Herbert"}"#).unwrap();
    assert_eq!(parsed.pages, 0);
    assert!(parsed.tags.is_empty());
  }

  #[test]
  fn best_effort_drops_excluded_and_caps_count() {
    let mut task = Task::new(
      GenerationRequest { seed_items: vec![book("s")], count: 2 },
      CallbackTarget { url: "http://cb".into(), caller_id: "u".into(), correlation_id: "r".into() },
    );
    task.result = Some(vec![book("a"), book("b"), book("c")]);
    task.excluded = vec!["a".into()];
    let ids: Vec<String> = task.best_effort().into_iter().map(|b| b.id).collect();
    assert_eq!(ids, vec!["b", "c"]);
  }

  #[test]
  fn registration_requires_http_address() {
    let ok = RegisterWorker { address: "http://10.0.0.7:8000".into(), model_name: Some("org/model-7b".into()) };
    assert!(ok.validate().is_ok());
    let bare_ip = RegisterWorker { address: "10.0.0.7".into(), model_name: None };
    assert!(bare_ip.validate().is_err());
    let bad_model = RegisterWorker { address: "http://w1".into(), model_name: Some("rm -rf /".into()) };
    assert!(bad_model.validate().is_err());
  }

  #[test]
  fn submission_defaults_count_and_checks_bounds() {
    let submission = |count| NewGeneration {
      seed_items: vec![book("s")],
      count,
      callback_url: "https://backend.example/lm/callback".into(),
      caller_id: "user-1".into(),
      correlation_id: "req-1".into(),
    };
    let (request, callback) = submission(None).into_parts().unwrap();
    assert_eq!(request.count, DEFAULT_COUNT);
    assert_eq!(callback.correlation_id, "req-1");
    assert!(submission(Some(0)).into_parts().is_err());
    assert!(submission(Some(MAX_COUNT + 1)).into_parts().is_err());

    let mut empty = submission(None);
    empty.seed_items.clear();
    assert!(empty.into_parts().is_err());
  }

  #[test]
  fn metrics_average_only_recorded_pings() {
    let mut a = Worker::new("http://a".into(), "m".into());
    a.ping = Some(10);
    let mut b = Worker::new("http://b".into(), "m".into());
    b.busy = true;
    let metrics = Metrics::from_workers(&[a, b]);
    assert_eq!(metrics.active_workers, 2);
    assert_eq!(metrics.busy_workers, 1);
    assert_eq!(metrics.avg_ping, 10.0);
  }
}
