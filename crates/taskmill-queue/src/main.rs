use std::sync::Arc;

use anyhow::Result;
use taskmill_queue::{
    FunctionRegistry, HookRegistry, QueueConfig, QueueWorkerManager, QueuedTasks,
    ScheduledTaskRegistry,
};
use taskmill_storage::{PostgresTaskStore, TaskStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskmill_queue=info,taskmill_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("taskmill-queued starting...");

    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL environment variable required");

    let store = PostgresTaskStore::from_url(&database_url).await?;
    store.migrate().await?;
    tracing::info!("database connection established");

    let config = QueueConfig::from_env();
    let functions = Arc::new(FunctionRegistry::new());
    let hooks = Arc::new(HookRegistry::new());
    let scheduled = Arc::new(ScheduledTaskRegistry::new(&config));

    // Task functions and scheduled definitions are registered here by the
    // embedding application before the manager starts.

    let tasks = QueuedTasks::new(Arc::new(store) as Arc<dyn TaskStore>, hooks, functions);
    let manager = QueueWorkerManager::new(config, tasks, scheduled);

    manager.run().await?;
    Ok(())
}
