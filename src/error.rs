use std::convert::Infallible;

use serde::Serialize;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

use crate::store::StoreError;
use crate::tasks::TaskError;

#[derive(Debug, Error)]
pub enum CoordinatorError {
  #[error("{0} not found")]
  NotFound(String),
  #[error("no workers registered")]
  NoCapacity,
  #[error("dispatch of task {task_id} failed: {reason}")]
  DispatchFailure { task_id: Uuid, reason: String },
  #[error("task {0} is already finished")]
  AlreadyTerminal(Uuid),
  #[error("report for task {0} does not match its current assignment")]
  StaleReport(Uuid),
  #[error("invalid request: {0}")]
  BadRequest(String),
  #[error("invalid or missing api key")]
  Unauthorized,
  #[error("worker store unavailable: {0}")]
  Store(#[from] StoreError),
}

impl warp::reject::Reject for CoordinatorError {}

impl From<TaskError> for CoordinatorError {
  fn from(err: TaskError) -> Self {
    match err {
      TaskError::NotFound(id) => CoordinatorError::NotFound(format!("task {}", id)),
      TaskError::Terminal { id, .. } => CoordinatorError::AlreadyTerminal(id),
      TaskError::Stale(id) => CoordinatorError::StaleReport(id),
    }
  }
}

impl CoordinatorError {
  pub fn status_code(&self) -> StatusCode {
    match self {
      CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
      CoordinatorError::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
      CoordinatorError::DispatchFailure { .. } => StatusCode::BAD_GATEWAY,
      CoordinatorError::AlreadyTerminal(_) | CoordinatorError::StaleReport(_) => StatusCode::CONFLICT,
      CoordinatorError::BadRequest(_) => StatusCode::BAD_REQUEST,
      CoordinatorError::Unauthorized => StatusCode::UNAUTHORIZED,
      CoordinatorError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      CoordinatorError::NotFound(_) => "not_found",
      CoordinatorError::NoCapacity => "no_capacity",
      CoordinatorError::DispatchFailure { .. } => "dispatch_failure",
      CoordinatorError::AlreadyTerminal(_) | CoordinatorError::StaleReport(_) => "conflict",
      CoordinatorError::BadRequest(_) => "bad_request",
      CoordinatorError::Unauthorized => "unauthorized",
      CoordinatorError::Store(_) => "store_unavailable",
    }
  }

  fn task_id(&self) -> Option<Uuid> {
    match self {
      CoordinatorError::DispatchFailure { task_id, .. } => Some(*task_id),
      CoordinatorError::AlreadyTerminal(id) | CoordinatorError::StaleReport(id) => Some(*id),
      _ => None,
    }
  }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
  pub status: &'static str,
  pub error: &'static str,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub task_id: Option<Uuid>,
}

fn reply(code: StatusCode, kind: &'static str, message: String, task_id: Option<Uuid>) -> warp::reply::Response {
  let body = ErrorBody { status: "error", error: kind, message, task_id };
  warp::reply::with_status(warp::reply::json(&body), code).into_response()
}

/// Turns every rejection into the structured JSON error shape.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  if let Some(e) = err.find::<CoordinatorError>() {
    if let CoordinatorError::Store(inner) = e {
      error!("Worker store failure: {}", inner);
    }
    return Ok(reply(e.status_code(), e.kind(), e.to_string(), e.task_id()));
  }
  if err.is_not_found() {
    return Ok(reply(StatusCode::NOT_FOUND, "not_found", "no such route".into(), None));
  }
  if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    return Ok(reply(StatusCode::BAD_REQUEST, "bad_request", e.to_string(), None));
  }
  if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    return Ok(reply(StatusCode::BAD_REQUEST, "bad_request", e.to_string(), None));
  }
  if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "method not allowed".into(), None));
  }
  if let Some(e) = err.find::<warp::reject::UnsupportedMediaType>() {
    return Ok(reply(StatusCode::UNSUPPORTED_MEDIA_TYPE, "bad_request", e.to_string(), None));
  }
  if let Some(e) = err.find::<warp::reject::PayloadTooLarge>() {
    return Ok(reply(StatusCode::PAYLOAD_TOO_LARGE, "bad_request", e.to_string(), None));
  }
  error!("Unhandled rejection: {:?}", err);
  Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error".into(), None))
}
