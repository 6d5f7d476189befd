use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{CallbackPayload, CallbackTarget, GenerationJob, ValidationJob, Worker};
use crate::retry::{with_retry, RetryPolicy};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error)]
pub enum MessagingError {
  #[error("request to {url} failed: {source}")]
  Transport {
    url: String,
    #[source]
    source: reqwest::Error,
  },
  #[error("{url} answered {status}")]
  Status { url: String, status: u16 },
}

impl MessagingError {
  /// True when the request never reached the peer, so resending cannot duplicate work.
  pub fn is_unsent(&self) -> bool {
    matches!(self, MessagingError::Transport { source, .. } if source.is_connect())
  }
}

/// Outbound HTTP to workers and to external callback receivers.
#[derive(Clone)]
pub struct Messenger {
  client: Client,
  api_key: String,
  dispatch_timeout: Duration,
  callback_timeout: Duration,
  retry: RetryPolicy,
}

impl Messenger {
  pub fn new(api_key: String, dispatch_timeout: Duration, callback_timeout: Duration, retry: RetryPolicy) -> Self {
    Self {
      client: Client::new(),
      api_key,
      dispatch_timeout,
      callback_timeout,
      retry,
    }
  }

  async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T, timeout: Duration, authed: bool) -> Result<(), MessagingError> {
    let mut request = self.client.post(url).timeout(timeout).json(body);
    if authed {
      request = request.header(API_KEY_HEADER, &self.api_key);
    }
    let response = request
      .send()
      .await
      .map_err(|source| MessagingError::Transport { url: url.to_string(), source })?;
    if !response.status().is_success() {
      return Err(MessagingError::Status { url: url.to_string(), status: response.status().as_u16() });
    }
    debug!("POST {} -> {}", url, response.status());
    Ok(())
  }

  async fn post_to_worker<T: Serialize>(&self, url: String, body: &T) -> Result<(), MessagingError> {
    with_retry(&self.retry, || self.post(&url, body, self.dispatch_timeout, true), |e: &MessagingError| {
      let retry = e.is_unsent();
      if retry {
        warn!("{}; retrying", e);
      }
      retry
    })
      .await
  }

  pub async fn send_generate(&self, worker: &Worker, job: &GenerationJob) -> Result<(), MessagingError> {
    self.post_to_worker(worker.endpoint("generate/"), job).await
  }

  pub async fn send_validate(&self, worker: &Worker, job: &ValidationJob) -> Result<(), MessagingError> {
    self.post_to_worker(worker.endpoint("validate/"), job).await
  }

  /// Exactly one attempt; the caller decides what a failure means.
  pub async fn deliver_callback(&self, target: &CallbackTarget, payload: &CallbackPayload) -> Result<(), MessagingError> {
    self.post(&target.url, payload, self.callback_timeout, false).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{GenerationRequest, JobRequest, TaskStatus};
  use httpmock::prelude::*;
  use uuid::Uuid;

  fn messenger() -> Messenger {
    let retry = RetryPolicy { base_delay_ms: 1, max_retries: 2, max_delay: Duration::from_millis(5) };
    Messenger::new("secret".into(), Duration::from_secs(2), Duration::from_secs(2), retry)
  }

  fn job() -> GenerationJob {
    GenerationJob {
      task_id: Uuid::new_v4(),
      request: JobRequest { seed_items: vec![], count: 5, exclude: vec!["x".into()] },
    }
  }

  #[tokio::test]
  async fn generate_posts_job_with_api_key() {
    let server = MockServer::start_async().await;
    let job = job();
    let mock = server.mock_async(|when, then| {
      when.method(POST)
        .path("/generate/")
        .header(API_KEY_HEADER, "secret")
        .json_body_partial(format!(r#"{{"taskId":"{}","request":{{"exclude":["x"]}}}}"#, job.task_id));
      then.status(200);
    }).await;
    let worker = Worker::new(server.base_url(), "m".into());

    messenger().send_generate(&worker, &job).await.unwrap();
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn worker_error_status_is_not_retried() {
    let server = MockServer::start_async().await;
    let mock = server.mock_async(|when, then| {
      when.method(POST).path("/validate/");
      then.status(503);
    }).await;
    let worker = Worker::new(server.base_url(), "m".into());
    let job = ValidationJob {
      task_id: Uuid::new_v4(),
      candidates: vec![],
      request: GenerationRequest { seed_items: vec![], count: 1 },
    };

    let err = messenger().send_validate(&worker, &job).await.unwrap_err();
    assert!(matches!(err, MessagingError::Status { status: 503, .. }));
    mock.assert_hits_async(1).await;
  }

  #[tokio::test]
  async fn unreachable_worker_is_an_unsent_error() {
    let worker = Worker::new("http://127.0.0.1:1".into(), "m".into());
    let err = messenger().send_generate(&worker, &job()).await.unwrap_err();
    assert!(err.is_unsent());
  }

  #[tokio::test]
  async fn callback_is_attempted_once() {
    let server = MockServer::start_async().await;
    let mock = server.mock_async(|when, then| {
      when.method(POST).path("/cb").json_body_partial(r#"{"callerId":"user","status":"done"}"#);
      then.status(500);
    }).await;
    let target = CallbackTarget { url: server.url("/cb"), caller_id: "user".into(), correlation_id: "r".into() };
    let payload = CallbackPayload {
      caller_id: "user".into(),
      correlation_id: "r".into(),
      task_id: Uuid::new_v4(),
      status: TaskStatus::Done,
      validated: true,
      recommendations: vec![],
      error: None,
    };

    assert!(messenger().deliver_callback(&target, &payload).await.is_err());
    mock.assert_hits_async(1).await;
  }
}
