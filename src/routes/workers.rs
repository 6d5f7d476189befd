use uuid::Uuid;
use warp::http::StatusCode;
use warp::Filter;

use super::{with_api_key, with_ctx};
use crate::context::AppContext;
use crate::error::CoordinatorError;
use crate::models::{Heartbeat, RegisterWorker};

pub fn worker_routes(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  register_route(ctx.clone())
    .or(heartbeat_route(ctx.clone()))
    .or(best_route(ctx.clone()))
    .or(list_route(ctx.clone()))
    .or(remove_route(ctx))
}

fn register_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("workers" / "register")
    .and(warp::post())
    .and(with_api_key(ctx.config.client_secret.clone()))
    .and(warp::body::json())
    .and(with_ctx(ctx))
    .and_then(handle_register)
}

fn heartbeat_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("workers" / "heartbeat")
    .and(warp::post())
    .and(with_api_key(ctx.config.client_secret.clone()))
    .and(warp::body::json())
    .and(with_ctx(ctx))
    .and_then(handle_heartbeat)
}

fn list_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("workers")
    .and(warp::get())
    .and(with_ctx(ctx))
    .and_then(handle_list)
}

fn best_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("workers" / "best")
    .and(warp::get())
    .and(with_ctx(ctx))
    .and_then(handle_best)
}

fn remove_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("workers" / Uuid)
    .and(warp::delete())
    .and(with_api_key(ctx.config.client_secret.clone()))
    .and(with_ctx(ctx))
    .and_then(handle_remove)
}

async fn handle_register(body: RegisterWorker, ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  body.validate().map_err(|e| warp::reject::custom(CoordinatorError::BadRequest(e)))?;
  let worker = ctx.registry
    .register(body.address, body.model_name)
    .await
    .map_err(|e| warp::reject::custom(CoordinatorError::from(e)))?;
  Ok(warp::reply::with_status(warp::reply::json(&worker), StatusCode::CREATED))
}

async fn handle_heartbeat(body: Heartbeat, ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  // A negative ping means the worker could not measure; keep the previous one.
  let ping = body.ping.and_then(|p| u32::try_from(p).ok());
  let worker = ctx.registry
    .heartbeat(&body.id, ping)
    .await
    .map_err(|e| warp::reject::custom(CoordinatorError::from(e)))?
    .ok_or_else(|| warp::reject::custom(CoordinatorError::NotFound(format!("worker {}", body.id))))?;
  Ok(warp::reply::json(&worker))
}

async fn handle_list(ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  let workers = ctx.registry
    .get_all()
    .await
    .map_err(|e| warp::reject::custom(CoordinatorError::from(e)))?;
  Ok(warp::reply::json(&workers))
}

async fn handle_best(ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  let worker = ctx.registry
    .get_best()
    .await
    .map_err(|e| warp::reject::custom(CoordinatorError::from(e)))?
    .ok_or_else(|| warp::reject::custom(CoordinatorError::NotFound("idle worker".into())))?;
  Ok(warp::reply::json(&worker))
}

async fn handle_remove(id: Uuid, ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  let worker = ctx.registry
    .remove(&id)
    .await
    .map_err(|e| warp::reject::custom(CoordinatorError::from(e)))?
    .ok_or_else(|| warp::reject::custom(CoordinatorError::NotFound(format!("worker {}", id))))?;
  Ok(warp::reply::json(&worker))
}
