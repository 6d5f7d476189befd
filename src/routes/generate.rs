use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::Filter;

use super::{with_api_key, with_ctx};
use crate::context::AppContext;
use crate::error::CoordinatorError;
use crate::models::{NewGeneration, ResultReport, SubmitStatus, TaskStatus};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
  pub task_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportAck {
  status: &'static str,
  task_id: Uuid,
  task_status: TaskStatus,
}

pub fn generate_routes(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  submit_route(ctx.clone())
    .or(status_route(ctx.clone()))
    .or(list_route(ctx.clone()))
    .or(result_route(ctx))
}

fn submit_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("generate")
    .and(warp::post())
    .and(with_api_key(ctx.config.client_secret.clone()))
    .and(warp::body::json())
    .and(with_ctx(ctx))
    .and_then(handle_submit)
}

fn status_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("generate" / "status")
    .and(warp::get())
    .and(warp::query::<TaskQuery>())
    .and(with_ctx(ctx))
    .and_then(handle_status)
}

fn list_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("generate" / "tasks")
    .and(warp::get())
    .and(with_ctx(ctx))
    .map(|ctx: AppContext| warp::reply::json(&ctx.tasks.all()))
}

fn result_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("generate" / "result")
    .and(warp::post())
    .and(with_api_key(ctx.config.client_secret.clone()))
    .and(warp::body::json())
    .and(with_ctx(ctx))
    .and_then(handle_result)
}

async fn handle_submit(body: NewGeneration, ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  let response = ctx.dispatcher.submit(body).await.map_err(warp::reject::custom)?;
  let code = match response.status {
    SubmitStatus::Accepted => StatusCode::OK,
    SubmitStatus::Queued => StatusCode::ACCEPTED,
  };
  Ok(warp::reply::with_status(warp::reply::json(&response), code))
}

async fn handle_status(query: TaskQuery, ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  let task = ctx.tasks
    .get(&query.task_id)
    .ok_or_else(|| warp::reject::custom(CoordinatorError::NotFound(format!("task {}", query.task_id))))?;
  Ok(warp::reply::json(&task))
}

async fn handle_result(body: ResultReport, ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  let task = ctx.dispatcher.handle_report(body).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&ReportAck { status: "ok", task_id: task.id, task_status: task.status }))
}
