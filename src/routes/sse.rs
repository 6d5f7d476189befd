use std::time::Duration;

use futures::stream;
use warp::sse::Event;
use warp::Filter;

use super::generate::TaskQuery;
use super::with_ctx;
use crate::context::AppContext;
use crate::error::CoordinatorError;

const TICK: Duration = Duration::from_secs(1);

pub fn events_route(ctx: AppContext) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("generate" / "events")
    .and(warp::get())
    .and(warp::query::<TaskQuery>())
    .and(with_ctx(ctx))
    .and_then(handle_events)
}

/// Streams a `status` event per tick until the task reaches a terminal state.
async fn handle_events(query: TaskQuery, ctx: AppContext) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = query.task_id;
  if ctx.tasks.get(&task_id).is_none() {
    return Err(warp::reject::custom(CoordinatorError::NotFound(format!("task {}", task_id))));
  }

  let ticks = tokio::time::interval(TICK);
  let events = stream::unfold((ctx, ticks, false), move |(ctx, mut ticks, finished)| async move {
    if finished {
      return None;
    }
    ticks.tick().await;
    let task = ctx.tasks.get(&task_id)?;
    let finished = task.status.is_terminal();
    let event = Event::default().event("status").json_data(&task);
    Some((event, (ctx, ticks, finished)))
  });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(events)))
}
