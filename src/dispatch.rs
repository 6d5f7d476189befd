//! Dispatch and validation relay for generation tasks.
//!
//! A task is created queued, handed to the best idle worker, and from then
//! on advanced by the reports that worker (and, when validation is enabled,
//! a second worker) posts back. A report is answered as soon as its task
//! transition is applied; callbacks, follow-up dispatches and queue drains
//! run in the background.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::messaging::Messenger;
use crate::models::{
  Book, CallbackPayload, GenerationJob, NewGeneration, Outcome, ResultReport, Stage, SubmitResponse,
  SubmitStatus, Task, TaskStatus, ValidationJob,
};
use crate::registry::WorkerRegistry;
use crate::task_queue::{PendingQueue, QueuedTask};
use crate::tasks::{Holder, TaskStore};

#[derive(Debug, PartialEq)]
enum Assignment {
  Dispatched(Uuid),
  NoIdleWorker,
  Failed(String),
}

#[derive(Clone)]
pub struct Dispatcher {
  registry: Arc<WorkerRegistry>,
  tasks: Arc<TaskStore>,
  queue: Arc<PendingQueue>,
  messenger: Messenger,
  validation_enabled: bool,
  max_validation_rounds: u32,
}

impl Dispatcher {
  pub fn new(
    registry: Arc<WorkerRegistry>,
    tasks: Arc<TaskStore>,
    queue: Arc<PendingQueue>,
    messenger: Messenger,
    validation_enabled: bool,
    max_validation_rounds: u32,
  ) -> Self {
    Self {
      registry,
      tasks,
      queue,
      messenger,
      validation_enabled,
      max_validation_rounds,
    }
  }

  pub async fn submit(&self, submission: NewGeneration) -> Result<SubmitResponse, CoordinatorError> {
    let (request, callback) = submission.into_parts().map_err(CoordinatorError::BadRequest)?;
    if self.registry.get_all().await?.is_empty() {
      warn!("Rejecting generation request from {}: no workers registered", callback.caller_id);
      return Err(CoordinatorError::NoCapacity);
    }

    let task = self.tasks.create(request, callback);
    match self.assign_generation(&task.id).await? {
      Assignment::Dispatched(_) => Ok(SubmitResponse { task_id: task.id, status: SubmitStatus::Accepted }),
      Assignment::NoIdleWorker => {
        self.queue.push(QueuedTask { task_id: task.id, created_at: task.created_at }).await;
        info!("Task {} queued: all workers busy", task.id);
        Ok(SubmitResponse { task_id: task.id, status: SubmitStatus::Queued })
      }
      Assignment::Failed(reason) => {
        if let Err(e) = self.tasks.fail(&task.id, reason.clone()) {
          warn!("Could not mark task {} failed: {}", task.id, e);
        }
        Err(CoordinatorError::DispatchFailure { task_id: task.id, reason })
      }
    }
  }

  // Only workers that have not generated for this task yet are eligible.
  async fn assign_generation(&self, task_id: &Uuid) -> Result<Assignment, CoordinatorError> {
    let task = self.tasks.get(task_id).ok_or_else(|| CoordinatorError::NotFound(format!("task {}", task_id)))?;
    let exclude: HashSet<Uuid> = task.generators.iter().copied().collect();
    let Some(ticket) = self.registry.claim_best(&exclude).await? else {
      return Ok(Assignment::NoIdleWorker);
    };

    let worker_id = ticket.worker_id();
    let task = match self.tasks.assign(task_id, worker_id, Stage::Generation) {
      Ok(task) => task,
      Err(e) => {
        self.registry.release(ticket).await?;
        return Err(e.into());
      }
    };

    let sent = self.messenger.send_generate(ticket.worker(), &GenerationJob::for_task(&task)).await;
    match sent {
      Ok(()) => {
        info!("Task {} dispatched to worker {}", task_id, worker_id);
        Ok(Assignment::Dispatched(worker_id))
      }
      Err(e) => {
        warn!("Dispatch of task {} to worker {} failed: {}", task_id, worker_id, e);
        self.registry.release(ticket).await?;
        Ok(Assignment::Failed(e.to_string()))
      }
    }
  }

  /// Applies a worker's report: a candidate, an acceptance or a rejection.
  ///
  /// The report is matched against the task's current holder. A report that
  /// no longer matches (a retried POST, a verdict for an earlier round) is
  /// refused with `StaleReport` and changes nothing.
  pub async fn handle_report(&self, report: ResultReport) -> Result<Task, CoordinatorError> {
    let task = self.tasks
      .get(&report.task_id)
      .ok_or_else(|| CoordinatorError::NotFound(format!("task {}", report.task_id)))?;
    if task.status.is_terminal() {
      return Err(CoordinatorError::AlreadyTerminal(task.id));
    }
    let holder = Holder::of(&task).ok_or(CoordinatorError::StaleReport(task.id))?;

    match report.ok {
      Some(_) if self.validation_enabled && holder.stage != Stage::Validation => {
        Err(CoordinatorError::StaleReport(task.id))
      }
      Some(true) => self.accept(&task.id, holder, report.result).await,
      Some(false) => self.reject(&task.id, holder, &report.invalid).await,
      None if holder.stage == Stage::Validation => {
        Err(CoordinatorError::BadRequest("a validation verdict needs 'ok'".into()))
      }
      None => {
        let candidate = report
          .result
          .ok_or_else(|| CoordinatorError::BadRequest("a candidate report needs 'result'".into()))?;
        self.on_candidate(&task.id, holder, candidate).await
      }
    }
  }

  async fn accept(&self, task_id: &Uuid, holder: Holder, result: Option<Vec<Book>>) -> Result<Task, CoordinatorError> {
    let done = self.tasks.confirm(task_id, holder, result)?;
    self.release_worker(Some(holder.worker_id)).await;
    self.notify(&done);
    self.spawn_drain();
    Ok(done)
  }

  async fn on_candidate(&self, task_id: &Uuid, holder: Holder, candidate: Vec<Book>) -> Result<Task, CoordinatorError> {
    let task = self.tasks.record_candidate(task_id, holder, candidate)?;
    self.release_worker(Some(holder.worker_id)).await;

    if !self.validation_enabled {
      let done = self.finish_unvalidated(task_id).await?;
      self.spawn_drain();
      return Ok(done);
    }
    let (task_id, generator) = (task.id, holder.worker_id);
    self.in_background(task_id, move |dispatcher| async move {
      dispatcher.relay_validation(&task_id, generator).await
    });
    Ok(task)
  }

  /// Sends the stored candidate to a worker other than its generator.
  async fn relay_validation(&self, task_id: &Uuid, generator: Uuid) -> Result<Task, CoordinatorError> {
    let exclude: HashSet<Uuid> = [generator].into_iter().collect();
    let Some(ticket) = self.registry.claim_best(&exclude).await? else {
      info!("No idle validator for task {}; accepting candidate unvalidated", task_id);
      return self.finish_unvalidated(task_id).await;
    };

    let validator_id = ticket.worker_id();
    let task = match self.tasks.assign(task_id, validator_id, Stage::Validation) {
      Ok(task) => task,
      Err(e) => {
        self.registry.release(ticket).await?;
        return Err(e.into());
      }
    };
    let job = ValidationJob {
      task_id: task.id,
      candidates: task.result.clone().unwrap_or_default(),
      request: task.request.clone(),
    };

    let sent = self.messenger.send_validate(ticket.worker(), &job).await;
    match sent {
      Ok(()) => {
        info!("Task {} sent to worker {} for validation", task.id, validator_id);
        Ok(task)
      }
      Err(e) => {
        warn!("Validation request for task {} to worker {} failed: {}", task.id, validator_id, e);
        self.registry.release(ticket).await?;
        self.finish_unvalidated(&task.id).await
      }
    }
  }

  async fn reject(&self, task_id: &Uuid, holder: Holder, invalid: &[String]) -> Result<Task, CoordinatorError> {
    let task = self.tasks.reject(task_id, holder, invalid)?;
    self.release_worker(Some(holder.worker_id)).await;
    info!("Task {} rejected (round {}, {} items excluded)", task.id, task.validation_rounds, task.excluded.len());

    if task.validation_rounds >= self.max_validation_rounds {
      info!("Task {} reached {} validation rounds", task.id, self.max_validation_rounds);
      let done = self.finish_unvalidated(&task.id).await?;
      self.spawn_drain();
      return Ok(done);
    }
    let task_id = task.id;
    self.in_background(task_id, move |dispatcher| async move { dispatcher.regenerate(&task_id).await });
    Ok(task)
  }

  async fn regenerate(&self, task_id: &Uuid) -> Result<Task, CoordinatorError> {
    match self.assign_generation(task_id).await? {
      Assignment::Dispatched(_) => self.tasks
        .get(task_id)
        .ok_or_else(|| CoordinatorError::NotFound(format!("task {}", task_id))),
      Assignment::NoIdleWorker => {
        info!("No other idle worker for task {}; using best effort", task_id);
        self.finish_unvalidated(task_id).await
      }
      Assignment::Failed(_) => self.finish_unvalidated(task_id).await,
    }
  }

  async fn finish_unvalidated(&self, task_id: &Uuid) -> Result<Task, CoordinatorError> {
    let task = self.tasks
      .get(task_id)
      .ok_or_else(|| CoordinatorError::NotFound(format!("task {}", task_id)))?;
    let done = self.tasks.complete(task_id, task.best_effort(), Outcome::Unvalidated)?;
    self.notify(&done);
    Ok(done)
  }

  async fn release_worker(&self, worker_id: Option<Uuid>) {
    let Some(id) = worker_id else { return };
    if let Err(e) = self.registry.release_id(&id).await {
      error!("Failed to release worker {}: {}", id, e);
    }
  }

  fn notify(&self, task: &Task) {
    let messenger = self.messenger.clone();
    let target = task.callback.clone();
    let payload = CallbackPayload::for_task(task);
    tokio::spawn(async move {
      match messenger.deliver_callback(&target, &payload).await {
        Ok(()) => info!("Callback for task {} delivered to {}", payload.task_id, target.url),
        Err(e) => warn!("Callback for task {} not delivered: {}", payload.task_id, e),
      }
    });
  }

  fn spawn_drain(&self) {
    let dispatcher = self.clone();
    tokio::spawn(async move { dispatcher.drain_queue().await });
  }

  fn in_background<F, Fut>(&self, task_id: Uuid, work: F)
  where
    F: FnOnce(Dispatcher) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Task, CoordinatorError>> + Send + 'static,
  {
    let dispatcher = self.clone();
    tokio::spawn(async move {
      if let Err(e) = work(dispatcher.clone()).await {
        error!("Follow-up for task {} failed: {}", task_id, e);
      }
      dispatcher.drain_queue().await;
    });
  }

  /// Dispatches queued tasks, oldest first, until the pool runs out of idle workers.
  pub async fn drain_queue(&self) {
    while let Some(entry) = self.queue.pop().await {
      match self.tasks.get(&entry.task_id) {
        Some(task) if task.status == TaskStatus::Queued => {}
        _ => continue,
      }
      match self.assign_generation(&entry.task_id).await {
        Ok(Assignment::Dispatched(_)) => continue,
        Ok(Assignment::NoIdleWorker) => {
          self.queue.push(entry).await;
          break;
        }
        Ok(Assignment::Failed(reason)) => match self.tasks.fail(&entry.task_id, reason) {
          Ok(task) => self.notify(&task),
          Err(e) => warn!("Could not fail task {}: {}", entry.task_id, e),
        },
        Err(e) => {
          error!("Queued task {} could not be dispatched: {}", entry.task_id, e);
          self.queue.push(entry).await;
          break;
        }
      }
    }
  }

  pub async fn expire_overdue(&self, deadline: Duration) -> usize {
    let mut expired = 0;
    for id in self.tasks.overdue(deadline) {
      match self.tasks.abandon(&id, "deadline exceeded") {
        Ok((task, worker)) => {
          self.release_worker(worker).await;
          self.notify(&task);
          expired += 1;
        }
        Err(e) => debug!("Task {} settled before expiry: {}", id, e),
      }
    }
    if expired > 0 {
      info!("Expired {} overdue tasks", expired);
    }
    expired
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{CallbackTarget, GenerationRequest, Worker};
  use crate::retry::RetryPolicy;
  use crate::store::{BusySwap, ClientStore, MemoryClientStore, StoreError};
  use async_trait::async_trait;
  use httpmock::prelude::*;
  use httpmock::Mock;

  struct Fixture {
    registry: Arc<WorkerRegistry>,
    tasks: Arc<TaskStore>,
    queue: Arc<PendingQueue>,
    dispatcher: Dispatcher,
  }

  // Suspends before every store call, the way a networked backend does.
  struct YieldingStore(MemoryClientStore);

  #[async_trait]
  impl ClientStore for YieldingStore {
    async fn register(&self, worker: Worker) -> Result<Worker, StoreError> {
      tokio::task::yield_now().await;
      self.0.register(worker).await
    }
    async fn get(&self, id: &Uuid) -> Result<Option<Worker>, StoreError> {
      tokio::task::yield_now().await;
      self.0.get(id).await
    }
    async fn all(&self) -> Result<Vec<Worker>, StoreError> {
      tokio::task::yield_now().await;
      self.0.all().await
    }
    async fn delete(&self, id: &Uuid) -> Result<Option<Worker>, StoreError> {
      tokio::task::yield_now().await;
      self.0.delete(id).await
    }
    async fn refresh(&self, id: &Uuid, ping: Option<u32>) -> Result<Option<Worker>, StoreError> {
      tokio::task::yield_now().await;
      self.0.refresh(id, ping).await
    }
    async fn swap_busy(&self, id: &Uuid, expected: bool, busy: bool) -> Result<BusySwap, StoreError> {
      tokio::task::yield_now().await;
      self.0.swap_busy(id, expected, busy).await
    }
  }

  fn fixture_with(store: Arc<dyn ClientStore>, validation_enabled: bool, max_rounds: u32) -> Fixture {
    let registry = Arc::new(WorkerRegistry::new(store, "m"));
    let tasks = Arc::new(TaskStore::new());
    let queue = Arc::new(PendingQueue::new());
    let retry = RetryPolicy { base_delay_ms: 1, max_retries: 1, max_delay: Duration::from_millis(5) };
    let messenger = Messenger::new("secret".into(), Duration::from_secs(2), Duration::from_secs(2), retry);
    let dispatcher = Dispatcher::new(registry.clone(), tasks.clone(), queue.clone(), messenger, validation_enabled, max_rounds);
    Fixture { registry, tasks, queue, dispatcher }
  }

  fn fixture(validation_enabled: bool, max_rounds: u32) -> Fixture {
    fixture_with(Arc::new(MemoryClientStore::new(Duration::from_secs(60))), validation_enabled, max_rounds)
  }

  fn book(id: &str) -> Book {
    serde_json::from_value(serde_json::json!({"id": id, "title": id, "author": "a"})).unwrap()
  }

  fn submission(callback_url: String) -> NewGeneration {
    NewGeneration {
      seed_items: vec![book("seed")],
      count: Some(2),
      callback_url,
      caller_id: "user-1".into(),
      correlation_id: "req-1".into(),
    }
  }

  fn candidate(task_id: Uuid, ids: &[&str]) -> ResultReport {
    ResultReport { task_id, result: Some(ids.iter().map(|id| book(id)).collect()), ok: None, invalid: vec![] }
  }

  fn verdict(task_id: Uuid, ok: bool, invalid: &[&str]) -> ResultReport {
    ResultReport { task_id, result: None, ok: Some(ok), invalid: invalid.iter().map(|s| s.to_string()).collect() }
  }

  async fn accepting_worker(server: &MockServer) {
    server.mock_async(|when, then| {
      when.method(POST).path("/generate/");
      then.status(200);
    }).await;
    server.mock_async(|when, then| {
      when.method(POST).path("/validate/");
      then.status(200);
    }).await;
  }

  async fn wait_for_task<P: Fn(&Task) -> bool>(tasks: &TaskStore, id: &Uuid, ready: P) -> Task {
    for _ in 0..200 {
      let task = tasks.get(id).unwrap();
      if ready(&task) {
        return task;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached the expected state: {:?}", id, tasks.get(id));
  }

  async fn wait_for_hits(mock: &Mock<'_>, hits: usize) {
    for _ in 0..200 {
      if mock.hits_async().await >= hits {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    mock.assert_hits_async(hits).await;
  }

  async fn all_idle(registry: &WorkerRegistry) -> bool {
    for _ in 0..200 {
      if registry.get_all().await.unwrap().iter().all(|w| !w.busy) {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[tokio::test]
  async fn no_workers_means_no_capacity_and_no_task() {
    let f = fixture(true, 3);
    let err = f.dispatcher.submit(submission("http://cb.local/x".into())).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NoCapacity));
    assert!(f.tasks.all().is_empty());
  }

  #[tokio::test]
  async fn dispatch_failure_rolls_back_busy_flag() {
    let f = fixture(true, 3);
    let worker = MockServer::start_async().await;
    worker.mock_async(|when, then| {
      when.method(POST).path("/generate/");
      then.status(500);
    }).await;
    let w = f.registry.register(worker.base_url(), None).await.unwrap();

    let err = f.dispatcher.submit(submission("http://cb.local/x".into())).await.unwrap_err();
    let CoordinatorError::DispatchFailure { task_id, .. } = err else { panic!("expected dispatch failure") };

    assert_eq!(f.tasks.get(&task_id).unwrap().status, TaskStatus::Failed);
    assert_eq!(f.registry.get_best().await.unwrap().unwrap().id, w.id);
  }

  #[tokio::test]
  async fn busy_pool_queues_then_drains_on_release() {
    let f = fixture(false, 3);
    let worker = MockServer::start_async().await;
    accepting_worker(&worker).await;
    let callback = MockServer::start_async().await;
    let cb = callback.mock_async(|when, then| {
      when.method(POST).path("/cb");
      then.status(200);
    }).await;
    f.registry.register(worker.base_url(), None).await.unwrap();

    let first = f.dispatcher.submit(submission(callback.url("/cb"))).await.unwrap();
    let second = f.dispatcher.submit(submission(callback.url("/cb"))).await.unwrap();
    assert_eq!(first.status, SubmitStatus::Accepted);
    assert_eq!(second.status, SubmitStatus::Queued);
    assert_eq!(f.queue.len().await, 1);

    let done = f.dispatcher.handle_report(candidate(first.task_id, &["a"])).await.unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.outcome, Some(Outcome::Unvalidated));

    wait_for_task(&f.tasks, &second.task_id, |t| t.status == TaskStatus::Processing).await;
    assert!(f.queue.is_empty().await);
    wait_for_hits(&cb, 1).await;
  }

  #[tokio::test]
  async fn candidate_is_relayed_to_another_worker() {
    let f = fixture(true, 3);
    let generator = MockServer::start_async().await;
    accepting_worker(&generator).await;
    let validator = MockServer::start_async().await;
    accepting_worker(&validator).await;
    let g = f.registry.register(generator.base_url(), None).await.unwrap();
    let v = f.registry.register(validator.base_url(), None).await.unwrap();
    f.registry.heartbeat(&g.id, Some(1)).await.unwrap();
    f.registry.heartbeat(&v.id, Some(2)).await.unwrap();

    let submitted = f.dispatcher.submit(submission("http://127.0.0.1:1/cb".into())).await.unwrap();
    let recorded = f.dispatcher.handle_report(candidate(submitted.task_id, &["a", "b"])).await.unwrap();
    assert_eq!(recorded.status, TaskStatus::Processing);
    assert_eq!(recorded.result.as_ref().map(|r| r.len()), Some(2));

    let task = wait_for_task(&f.tasks, &submitted.task_id, |t| t.stage == Some(Stage::Validation)).await;
    assert_eq!(task.worker_id, Some(v.id));
    assert!(!f.registry.get(&g.id).await.unwrap().unwrap().busy);
    assert!(f.registry.get(&v.id).await.unwrap().unwrap().busy);
  }

  #[tokio::test]
  async fn rejection_without_spare_worker_degrades_to_best_effort() {
    let f = fixture(true, 3);
    let generator = MockServer::start_async().await;
    accepting_worker(&generator).await;
    let validator = MockServer::start_async().await;
    accepting_worker(&validator).await;
    let callback = MockServer::start_async().await;
    let cb = callback.mock_async(|when, then| {
      when.method(POST).path("/cb").json_body_partial(r#"{"status":"done","validated":false}"#);
      then.status(200);
    }).await;
    let g = f.registry.register(generator.base_url(), None).await.unwrap();
    let v = f.registry.register(validator.base_url(), None).await.unwrap();
    f.registry.heartbeat(&g.id, Some(1)).await.unwrap();
    f.registry.heartbeat(&v.id, Some(2)).await.unwrap();

    let id = f.dispatcher.submit(submission(callback.url("/cb"))).await.unwrap().task_id;
    f.dispatcher.handle_report(candidate(id, &["a", "b", "c"])).await.unwrap();
    wait_for_task(&f.tasks, &id, |t| t.stage == Some(Stage::Validation)).await;

    // The validator rejects "a"; the only worker that has not generated yet
    // is the validator itself, so it takes the second generation round.
    f.dispatcher.handle_report(verdict(id, false, &["a"])).await.unwrap();
    let task = wait_for_task(&f.tasks, &id, |t| t.stage == Some(Stage::Generation)).await;
    assert_eq!(task.worker_id, Some(v.id));

    f.dispatcher.handle_report(candidate(id, &["c", "d"])).await.unwrap();
    let task = wait_for_task(&f.tasks, &id, |t| t.stage == Some(Stage::Validation)).await;
    assert_eq!(task.worker_id, Some(g.id));

    // Both workers have generated now, so a second rejection ends the loop.
    f.dispatcher.handle_report(verdict(id, false, &["d"])).await.unwrap();
    let done = wait_for_task(&f.tasks, &id, |t| t.status.is_terminal()).await;
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.outcome, Some(Outcome::Unvalidated));
    assert_eq!(done.validation_rounds, 2);
    assert_eq!(done.result.unwrap().into_iter().map(|b| b.id).collect::<Vec<_>>(), vec!["c"]);
    assert!(all_idle(&f.registry).await);
    wait_for_hits(&cb, 1).await;
  }

  #[tokio::test]
  async fn overlapping_candidate_reports_claim_one_validator() {
    let store = Arc::new(YieldingStore(MemoryClientStore::new(Duration::from_secs(60))));
    let f = fixture_with(store, true, 3);
    let mut servers = vec![];
    for ping in 1..=3 {
      let server = MockServer::start_async().await;
      accepting_worker(&server).await;
      let w = f.registry.register(server.base_url(), None).await.unwrap();
      f.registry.heartbeat(&w.id, Some(ping)).await.unwrap();
      servers.push(server);
    }

    let id = f.dispatcher.submit(submission("http://127.0.0.1:1/cb".into())).await.unwrap().task_id;
    let (first, second) = tokio::join!(
      f.dispatcher.handle_report(candidate(id, &["a"])),
      f.dispatcher.handle_report(candidate(id, &["a"])),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes.iter().any(|r| matches!(r, Err(CoordinatorError::StaleReport(_)))));

    wait_for_task(&f.tasks, &id, |t| t.stage == Some(Stage::Validation)).await;
    let busy = f.registry.get_all().await.unwrap().into_iter().filter(|w| w.busy).count();
    assert_eq!(busy, 1);

    let done = f.dispatcher.handle_report(verdict(id, true, &[])).await.unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert!(all_idle(&f.registry).await);
  }

  #[tokio::test]
  async fn late_verdict_from_previous_validator_is_refused() {
    let f = fixture(true, 3);
    let mut servers = vec![];
    for ping in 1..=3 {
      let server = MockServer::start_async().await;
      accepting_worker(&server).await;
      let w = f.registry.register(server.base_url(), None).await.unwrap();
      f.registry.heartbeat(&w.id, Some(ping)).await.unwrap();
      servers.push(server);
    }

    let id = f.dispatcher.submit(submission("http://127.0.0.1:1/cb".into())).await.unwrap().task_id;
    f.dispatcher.handle_report(candidate(id, &["a", "b"])).await.unwrap();
    wait_for_task(&f.tasks, &id, |t| t.stage == Some(Stage::Validation)).await;
    f.dispatcher.handle_report(verdict(id, false, &["a"])).await.unwrap();
    let regenerating = wait_for_task(&f.tasks, &id, |t| t.stage == Some(Stage::Generation)).await;

    // The same rejection delivered again while the new generator works.
    let late = f.dispatcher.handle_report(verdict(id, false, &["b"])).await;
    assert!(matches!(late, Err(CoordinatorError::StaleReport(_))));
    let late = f.dispatcher.handle_report(verdict(id, true, &[])).await;
    assert!(matches!(late, Err(CoordinatorError::StaleReport(_))));

    let task = f.tasks.get(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.worker_id, regenerating.worker_id);
    assert_eq!(task.excluded, vec!["a"]);
    assert_eq!(task.validation_rounds, 1);
  }

  #[tokio::test]
  async fn report_for_a_queued_task_is_refused() {
    let f = fixture(true, 3);
    let task = f.tasks.create(
      GenerationRequest { seed_items: vec![book("s")], count: 1 },
      CallbackTarget { url: "http://127.0.0.1:1/cb".into(), caller_id: "u".into(), correlation_id: "r".into() },
    );
    let report = candidate(task.id, &["x"]);
    assert!(matches!(f.dispatcher.handle_report(report).await, Err(CoordinatorError::StaleReport(_))));
    assert_eq!(f.tasks.get(&task.id).unwrap().status, TaskStatus::Queued);
  }

  #[tokio::test]
  async fn late_report_on_finished_task_is_a_conflict() {
    let f = fixture(false, 3);
    let task = f.tasks.create(
      GenerationRequest { seed_items: vec![book("s")], count: 1 },
      CallbackTarget { url: "http://127.0.0.1:1/cb".into(), caller_id: "u".into(), correlation_id: "r".into() },
    );
    f.tasks.complete(&task.id, vec![book("x")], Outcome::Validated).unwrap();

    let late = ResultReport { task_id: task.id, result: Some(vec![book("y")]), ok: Some(true), invalid: vec![] };
    assert!(matches!(f.dispatcher.handle_report(late).await, Err(CoordinatorError::AlreadyTerminal(_))));
    assert_eq!(f.tasks.get(&task.id).unwrap().result, Some(vec![book("x")]));
  }

  #[tokio::test]
  async fn overdue_tasks_fail_and_free_their_worker() {
    let f = fixture(true, 3);
    let worker = MockServer::start_async().await;
    accepting_worker(&worker).await;
    let w = f.registry.register(worker.base_url(), None).await.unwrap();
    let submitted = f.dispatcher.submit(submission("http://127.0.0.1:1/cb".into())).await.unwrap();
    assert!(f.registry.get(&w.id).await.unwrap().unwrap().busy);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(f.dispatcher.expire_overdue(Duration::from_millis(5)).await, 1);

    let task = f.tasks.get(&submitted.task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("deadline exceeded"));
    assert!(!f.registry.get(&w.id).await.unwrap().unwrap().busy);
  }
}
