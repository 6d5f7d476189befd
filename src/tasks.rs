//! Task records and their lifecycle: `queued -> processing -> {done, failed}`.
//!
//! Every transition takes the per-key lock of the map entry, so mutations of
//! a single task are serialized. Terminal tasks are frozen.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::{Book, CallbackTarget, GenerationRequest, Outcome, Stage, Task, TaskStatus};

#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
  #[error("task {0} not found")]
  NotFound(Uuid),
  #[error("task {id} is already {status}")]
  Terminal { id: Uuid, status: TaskStatus },
  #[error("task {0} has moved on since the report was read")]
  Stale(Uuid),
}

/// The assignment a report answers: which worker, in which stage and round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
  pub worker_id: Uuid,
  pub stage: Stage,
  pub round: u32,
}

impl Holder {
  pub fn of(task: &Task) -> Option<Self> {
    match (task.worker_id, task.stage) {
      (Some(worker_id), Some(stage)) if task.status == TaskStatus::Processing => {
        Some(Self { worker_id, stage, round: task.validation_rounds })
      }
      _ => None,
    }
  }
}

fn held_by(task: &Task, holder: Holder) -> Result<(), TaskError> {
  if Holder::of(task) == Some(holder) {
    Ok(())
  } else {
    Err(TaskError::Stale(task.id))
  }
}

#[derive(Default)]
pub struct TaskStore {
  tasks: DashMap<Uuid, Task>,
}

impl TaskStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn create(&self, request: GenerationRequest, callback: CallbackTarget) -> Task {
    let task = Task::new(request, callback);
    self.tasks.insert(task.id, task.clone());
    info!("Task {} created ({} seed items, count {})", task.id, task.request.seed_items.len(), task.request.count);
    task
  }

  pub fn get(&self, id: &Uuid) -> Option<Task> {
    self.tasks.get(id).map(|t| t.value().clone())
  }

  pub fn all(&self) -> Vec<Task> {
    let mut tasks: Vec<Task> = self.tasks.iter().map(|t| t.value().clone()).collect();
    tasks.sort_by_key(|t| t.created_at);
    tasks
  }

  fn update<F>(&self, id: &Uuid, mutate: F) -> Result<Task, TaskError>
  where
    F: FnOnce(&mut Task) -> Result<(), TaskError>,
  {
    let mut entry = self.tasks.get_mut(id).ok_or(TaskError::NotFound(*id))?;
    let task = entry.value_mut();
    if task.status.is_terminal() {
      return Err(TaskError::Terminal { id: *id, status: task.status });
    }
    mutate(task)?;
    Ok(task.clone())
  }

  /// Hands an unassigned task to `worker_id`. Fails if another worker holds it.
  pub fn assign(&self, id: &Uuid, worker_id: Uuid, stage: Stage) -> Result<Task, TaskError> {
    self.update(id, |task| {
      if task.worker_id.is_some() {
        return Err(TaskError::Stale(task.id));
      }
      task.status = TaskStatus::Processing;
      task.worker_id = Some(worker_id);
      task.stage = Some(stage);
      if stage == Stage::Generation {
        task.generators.push(worker_id);
      }
      Ok(())
    })
  }

  pub fn record_candidate(&self, id: &Uuid, holder: Holder, candidate: Vec<Book>) -> Result<Task, TaskError> {
    self.update(id, |task| {
      held_by(task, holder)?;
      if holder.stage != Stage::Generation {
        return Err(TaskError::Stale(task.id));
      }
      task.result = Some(candidate);
      task.worker_id = None;
      task.stage = None;
      Ok(())
    })
  }

  /// Folds a rejection into the exclusion set and detaches the current worker.
  pub fn reject(&self, id: &Uuid, holder: Holder, invalid: &[String]) -> Result<Task, TaskError> {
    self.update(id, |task| {
      held_by(task, holder)?;
      for item in invalid {
        if !task.excluded.contains(item) {
          task.excluded.push(item.clone());
        }
      }
      task.validation_rounds += 1;
      task.worker_id = None;
      task.stage = None;
      Ok(())
    })
  }

  /// Completes as validated; without a fresh result the stored candidate stands.
  pub fn confirm(&self, id: &Uuid, holder: Holder, result: Option<Vec<Book>>) -> Result<Task, TaskError> {
    let task = self.update(id, |task| {
      held_by(task, holder)?;
      if result.is_some() {
        task.result = result;
      } else if task.result.is_none() {
        task.result = Some(vec![]);
      }
      task.status = TaskStatus::Done;
      task.outcome = Some(Outcome::Validated);
      task.completed_at = Some(Utc::now());
      task.worker_id = None;
      task.stage = None;
      Ok(())
    })?;
    info!("Task {} done (validated)", task.id);
    Ok(task)
  }

  pub fn complete(&self, id: &Uuid, result: Vec<Book>, outcome: Outcome) -> Result<Task, TaskError> {
    let task = self.update(id, |task| {
      task.result = Some(result);
      task.status = TaskStatus::Done;
      task.outcome = Some(outcome);
      task.completed_at = Some(Utc::now());
      task.worker_id = None;
      task.stage = None;
      Ok(())
    })?;
    info!("Task {} done ({:?})", task.id, outcome);
    Ok(task)
  }

  pub fn fail(&self, id: &Uuid, reason: impl Into<String>) -> Result<Task, TaskError> {
    self.abandon(id, reason).map(|(task, _)| task)
  }

  /// Fails the task and returns the worker it was detached from, if any.
  pub fn abandon(&self, id: &Uuid, reason: impl Into<String>) -> Result<(Task, Option<Uuid>), TaskError> {
    let reason = reason.into();
    let mut detached = None;
    let task = self.update(id, |task| {
      detached = task.worker_id.take();
      task.status = TaskStatus::Failed;
      task.error = Some(reason);
      task.completed_at = Some(Utc::now());
      task.stage = None;
      Ok(())
    })?;
    info!("Task {} failed: {}", task.id, task.error.as_deref().unwrap_or_default());
    Ok((task, detached))
  }

  /// Ids of non-terminal tasks created more than `deadline` ago.
  pub fn overdue(&self, deadline: Duration) -> Vec<Uuid> {
    let now = Utc::now();
    self.tasks
      .iter()
      .filter(|t| !t.status.is_terminal())
      .filter(|t| (now - t.created_at).to_std().map(|age| age > deadline).unwrap_or(false))
      .map(|t| t.id)
      .collect()
  }
}
