pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod messaging;
pub mod models;
pub mod registry;
pub mod retry;
pub mod routes;
pub mod store;
pub mod sweeper;
pub mod task_queue;
pub mod tasks;
