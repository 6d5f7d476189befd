use std::convert::Infallible;

use warp::Filter;

use crate::context::AppContext;
use crate::error::{handle_rejection, CoordinatorError};
use crate::messaging::API_KEY_HEADER;

pub mod generate;
pub mod health;
pub mod sse;
pub mod workers;

pub fn routes(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  workers::worker_routes(ctx.clone())
    .or(sse::events_route(ctx.clone()))
    .or(generate::generate_routes(ctx.clone()))
    .or(health::health_routes(ctx))
    .recover(handle_rejection)
}

pub(crate) fn with_ctx(ctx: AppContext) -> impl Filter<Extract = (AppContext,), Error = Infallible> + Clone {
  warp::any().map(move || ctx.clone())
}

/// Rejects the request unless `x-api-key` carries the shared secret.
pub(crate) fn with_api_key(secret: String) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
  warp::header::optional::<String>(API_KEY_HEADER)
    .and_then(move |key: Option<String>| {
      let authorized = key.as_deref() == Some(secret.as_str());
      async move {
        if authorized {
          Ok(())
        } else {
          Err(warp::reject::custom(CoordinatorError::Unauthorized))
        }
      }
    })
    .untuple_one()
}
