//! Background tick that fails overdue tasks and drains the pending queue.

use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::context::AppContext;

pub async fn run(ctx: AppContext) {
  let interval = ctx.config.sweep_interval;
  let deadline = ctx.config.task_deadline;
  info!("Sweeper started (every {:?}, task deadline {:?})", interval, deadline);

  let mut ticks = IntervalStream::new(tokio::time::interval(interval));
  while ticks.next().await.is_some() {
    sweep_once(&ctx).await;
  }
}

pub async fn sweep_once(ctx: &AppContext) -> usize {
  let expired = ctx.dispatcher.expire_overdue(ctx.config.task_deadline).await;
  let waiting = ctx.queue.len().await;
  if waiting > 0 {
    debug!("Sweeper draining {} queued tasks", waiting);
    ctx.dispatcher.drain_queue().await;
  }
  expired
}
