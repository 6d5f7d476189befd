use std::collections::BinaryHeap;
use std::cmp::Ordering;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A task waiting for an idle worker.
#[derive(Debug, Clone)]
pub struct QueuedTask {
  pub task_id: Uuid,
  pub created_at: DateTime<Utc>,
}

impl Eq for QueuedTask {}

impl PartialEq for QueuedTask {
  fn eq(&self, other: &Self) -> bool {
    self.created_at == other.created_at && self.task_id == other.task_id
  }
}

impl PartialOrd for QueuedTask {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

// Reversed so the max-heap pops the oldest task first.
impl Ord for QueuedTask {
  fn cmp(&self, other: &Self) -> Ordering {
    other.created_at
      .cmp(&self.created_at)
      .then_with(|| other.task_id.cmp(&self.task_id))
  }
}

#[derive(Default)]
pub struct PendingQueue {
  queue: Mutex<BinaryHeap<QueuedTask>>,
}

impl PendingQueue {
  pub fn new() -> Self {
    Self {
      queue: Mutex::new(BinaryHeap::new()),
    }
  }

  /// Re-pushing a popped task keeps its place because order follows `created_at`.
  pub async fn push(&self, task: QueuedTask) {
    self.queue.lock().await.push(task);
  }

  pub async fn pop(&self) -> Option<QueuedTask> {
    self.queue.lock().await.pop()
  }

  pub async fn len(&self) -> usize {
    self.queue.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.queue.lock().await.is_empty()
  }
}
