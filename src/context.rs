use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use tracing::info;

use crate::config::{Config, StoreBackend};
use crate::dispatch::Dispatcher;
use crate::messaging::Messenger;
use crate::registry::WorkerRegistry;
use crate::retry::RetryPolicy;
use crate::store::{ClientStore, MemoryClientStore, RedisClientStore};
use crate::task_queue::PendingQueue;
use crate::tasks::TaskStore;

/// Shared state handed to every route and background loop.
#[derive(Clone)]
pub struct AppContext {
  pub config: Arc<Config>,
  pub registry: Arc<WorkerRegistry>,
  pub tasks: Arc<TaskStore>,
  pub queue: Arc<PendingQueue>,
  pub dispatcher: Arc<Dispatcher>,
  pub started_at: Instant,
}

impl AppContext {
  /// Connects the configured worker store and wires everything on top of it.
  pub async fn build(config: Config) -> anyhow::Result<Self> {
    let store: Arc<dyn ClientStore> = match &config.store {
      StoreBackend::Memory => {
        info!("Using in-memory worker store");
        Arc::new(MemoryClientStore::new(config.worker_ttl))
      }
      StoreBackend::Redis { url } => {
        info!("Using redis worker store at {}", url);
        let store = RedisClientStore::connect(url, config.worker_ttl, &RetryPolicy::default())
          .await
          .with_context(|| format!("connecting to redis at {}", url))?;
        Arc::new(store)
      }
    };
    Ok(Self::with_store(config, store))
  }

  pub fn with_store(config: Config, store: Arc<dyn ClientStore>) -> Self {
    let registry = Arc::new(WorkerRegistry::new(store, config.default_model_name.clone()));
    let tasks = Arc::new(TaskStore::new());
    let queue = Arc::new(PendingQueue::new());
    let messenger = Messenger::new(
      config.client_secret.clone(),
      config.dispatch_timeout,
      config.callback_timeout,
      RetryPolicy::default(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
      registry.clone(),
      tasks.clone(),
      queue.clone(),
      messenger,
      config.validation_enabled,
      config.max_validation_rounds,
    ));

    Self {
      config: Arc::new(config),
      registry,
      tasks,
      queue,
      dispatcher,
      started_at: Instant::now(),
    }
  }
}
