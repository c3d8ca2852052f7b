// Postgres storage layer for the queued task system

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryTaskStore;
pub use models::*;
pub use postgres::PostgresTaskStore;
pub use store::{NotificationStream, StoreError, TaskStore};
