use warp::Filter;

use super::with_ctx;
use crate::context::AppContext;
use crate::error::CoordinatorError;
use crate::models::{Health, Metrics};

pub fn health_routes(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("health")
    .and(warp::get())
    .and(with_ctx(ctx.clone()))
    .and_then(handle_health)
    .or(warp::path!("health" / "metrics")
      .and(warp::get())
      .and(with_ctx(ctx))
      .and_then(handle_metrics))
}

async fn handle_health(ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  let workers = ctx.registry
    .get_all()
    .await
    .map_err(|e| warp::reject::custom(CoordinatorError::from(e)))?;
  Ok(warp::reply::json(&Health {
    alive: true,
    uptime_seconds: ctx.started_at.elapsed().as_secs(),
    worker_count: workers.len(),
  }))
}

async fn handle_metrics(ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  let workers = ctx.registry
    .get_all()
    .await
    .map_err(|e| warp::reject::custom(CoordinatorError::from(e)))?;
  Ok(warp::reply::json(&Metrics::from_workers(&workers)))
}
