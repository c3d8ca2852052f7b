//! Queue worker manager
//!
//! Per-process orchestrator. On startup it installs the notification
//! trigger, registers the server record, and runs four loops:
//!
//! - L1 notification listener: LISTEN on the queue channel plus a steady
//!   tick, for instant reactivity
//! - L2 fallback polling: guarantees progress if notifications are lost
//! - L3 heartbeat: refreshes this server's worker record every 30 seconds
//! - L4 cron scheduler: materializes scheduled tasks at minute boundaries
//!
//! Ready-task selection is FIFO over due `enqueued` rows, with a sibling
//! gate (at most one child of a given parent per tick) and cascading of a
//! parent's terminal failure or cancellation to its descendants.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use taskmill_storage::{FleetView, QueuedTask, TaskFailure, TaskState, TaskStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::pool::{PoolStats, WorkerPool};
use crate::scheduler::{CronScheduler, ScheduledTaskRegistry};
use crate::tasks::QueuedTasks;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct ManagerCounters {
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    notifications_received: AtomicU64,
    polling_cycles: AtomicU64,
}

/// Point-in-time view of manager activity.
#[derive(Debug, Clone)]
pub struct ManagerSnapshot {
    pub is_running: bool,
    pub uptime_seconds: Option<f64>,
    pub max_workers: usize,
    pub pool: PoolStats,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub notifications_received: u64,
    pub polling_cycles: u64,
}

struct ManagerInner {
    config: QueueConfig,
    store: Arc<dyn TaskStore>,
    tasks: QueuedTasks,
    pool: WorkerPool,
    scheduled: Arc<ScheduledTaskRegistry>,
    server_name: String,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    started_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
    counters: ManagerCounters,
    loops: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// The per-process queue orchestrator.
#[derive(Clone)]
pub struct QueueWorkerManager {
    inner: Arc<ManagerInner>,
}

impl QueueWorkerManager {
    pub fn new(
        config: QueueConfig,
        tasks: QueuedTasks,
        scheduled: Arc<ScheduledTaskRegistry>,
    ) -> Self {
        let store = tasks.store();
        let pool = WorkerPool::new(
            config.max_workers,
            config.worker_idle_timeout,
            Arc::clone(&store),
            tasks.hooks(),
            tasks.functions(),
        );
        let server_name = config.resolved_server_name();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                tasks,
                pool,
                scheduled,
                server_name,
                shutdown_tx,
                running: AtomicBool::new(false),
                started_at: parking_lot::Mutex::new(None),
                counters: ManagerCounters::default(),
                loops: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// A receiver that flips to true when shutdown is initiated.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Start the manager: install the DB trigger, register the server, and
    /// spawn the four loops.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("worker manager is already running");
            return Ok(());
        }

        info!(
            server_name = %self.inner.server_name,
            max_workers = self.inner.config.max_workers,
            "starting queue worker manager"
        );

        if let Err(e) = self
            .inner
            .store
            .install_notify_trigger(&self.inner.config.notify_channel)
            .await
        {
            self.inner.running.store(false, Ordering::SeqCst);
            error!(error = %e, "failed to initialize database, aborting startup");
            return Err(e.into());
        }

        self.inner
            .store
            .register_server(
                &self.inner.server_name,
                self.inner.config.max_workers as i32,
                Some(env!("CARGO_PKG_VERSION")),
            )
            .await?;

        *self.inner.started_at.lock() = Some(Utc::now());

        let mut loops = self.inner.loops.lock();
        loops.push(tokio::spawn(notification_listener(
            Arc::clone(&self.inner),
            self.inner.shutdown_tx.subscribe(),
        )));
        loops.push(tokio::spawn(fallback_polling(
            Arc::clone(&self.inner),
            self.inner.shutdown_tx.subscribe(),
        )));
        loops.push(tokio::spawn(heartbeat_loop(
            Arc::clone(&self.inner),
            self.inner.shutdown_tx.subscribe(),
        )));
        loops.push(tokio::spawn(
            CronScheduler::new(
                Arc::clone(&self.inner.scheduled),
                self.inner.tasks.clone(),
                self.inner.shutdown_tx.subscribe(),
            )
            .run(),
        ));

        info!("queue worker manager started");
        Ok(())
    }

    /// Start, then block until an interrupt/terminate signal (or an
    /// explicit `stop` elsewhere), then shut down gracefully.
    pub async fn run(&self) -> Result<(), QueueError> {
        self.start().await?;

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for interrupt signal");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to install terminate handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("interrupt received, initiating graceful shutdown"),
            _ = terminate => info!("terminate received, initiating graceful shutdown"),
            _ = shutdown_rx.changed() => {}
        }

        self.stop().await;
        Ok(())
    }

    /// Graceful shutdown: cancel the loops, drain the pool, and mark the
    /// server stopped.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("stopping queue worker manager");
        let _ = self.inner.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.loops.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "manager loop ended abnormally");
                }
            }
        }

        self.inner.pool.shutdown();

        if let Err(e) = self
            .inner
            .store
            .mark_server_stopped(&self.inner.server_name)
            .await
        {
            error!(error = %e, "failed to mark server stopped");
        }

        info!("queue worker manager stopped");
    }

    /// One assignment tick. Returns the number of tasks handed to workers.
    pub async fn process_pending_tasks(&self) -> usize {
        process_pending(&self.inner).await
    }

    pub async fn stats(&self) -> ManagerSnapshot {
        let uptime = (*self.inner.started_at.lock())
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0);
        ManagerSnapshot {
            is_running: self.is_running(),
            uptime_seconds: uptime,
            max_workers: self.inner.config.max_workers,
            pool: self.inner.pool.stats(),
            tasks_processed: self.inner.counters.tasks_processed.load(Ordering::Relaxed),
            tasks_failed: self.inner.counters.tasks_failed.load(Ordering::Relaxed),
            notifications_received: self
                .inner
                .counters
                .notifications_received
                .load(Ordering::Relaxed),
            polling_cycles: self.inner.counters.polling_cycles.load(Ordering::Relaxed),
        }
    }

    /// Aggregate view over all alive servers.
    pub async fn fleet_view(&self) -> Result<FleetView, QueueError> {
        Ok(self.inner.store.fleet_view().await?)
    }
}

/// L1: LISTEN on the queue channel; scan on every notification and on a
/// steady tick.
async fn notification_listener(inner: Arc<ManagerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    if !inner.config.use_postgresql_notify {
        info!("notification listener disabled in config");
        return;
    }

    let mut stream = match inner.store.subscribe(&inner.config.notify_channel).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "notification listener error, falling back to polling only");
            return;
        }
    };

    info!(channel = %inner.config.notify_channel, "notification listener started");

    loop {
        tokio::select! {
            notification = stream.recv() => match notification {
                Some(n) => {
                    inner.counters.notifications_received.fetch_add(1, Ordering::Relaxed);
                    debug!(task_id = n.task_id, "received task notification");
                    process_pending(&inner).await;
                }
                None => {
                    warn!("notification stream closed, falling back to polling only");
                    break;
                }
            },
            _ = tokio::time::sleep(inner.config.polling_interval) => {
                process_pending(&inner).await;
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// L2: fixed-interval scan to guarantee progress without notifications.
async fn fallback_polling(inner: Arc<ManagerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    info!(
        interval_s = inner.config.fallback_polling_interval.as_secs(),
        "fallback polling started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(inner.config.fallback_polling_interval) => {
                inner.counters.polling_cycles.fetch_add(1, Ordering::Relaxed);
                process_pending(&inner).await;
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// L3: refresh this server's worker record.
async fn heartbeat_loop(inner: Arc<ManagerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    info!(interval_s = HEARTBEAT_INTERVAL.as_secs(), "heartbeat started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                let stats = inner.pool.stats();
                if let Err(e) = inner
                    .store
                    .update_server_stats(
                        &inner.server_name,
                        stats.busy_workers as i32,
                        stats.idle_workers as i32,
                        true,
                    )
                    .await
                {
                    error!(error = %e, "heartbeat update failed");
                } else {
                    debug!(
                        active = stats.busy_workers,
                        idle = stats.idle_workers,
                        "heartbeat"
                    );
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// One tick: select ready tasks in FIFO order and assign them to workers.
async fn process_pending(inner: &Arc<ManagerInner>) -> usize {
    let enqueued = match inner.store.list_due_enqueued(Utc::now()).await {
        Ok(tasks) => tasks,
        Err(e) => {
            error!(error = %e, "error loading enqueued tasks");
            return 0;
        }
    };
    if enqueued.is_empty() {
        return 0;
    }

    let total = enqueued.len();
    let mut processed_parent_ids: HashSet<i64> = HashSet::new();
    let mut ready: Vec<QueuedTask> = Vec::new();

    for task in enqueued {
        let Some(parent_id) = task.parent_task_id else {
            ready.push(task);
            continue;
        };

        // Sibling gate: one child per parent per tick, so siblings cannot
        // race the parent recheck.
        if processed_parent_ids.contains(&parent_id) {
            debug!(task_id = task.id, parent_id, "sibling already assigned this tick");
            continue;
        }

        match inner.store.get_task(parent_id).await {
            Ok(Some(parent)) => match parent.state {
                TaskState::Done => {
                    processed_parent_ids.insert(parent_id);
                    ready.push(task);
                }
                TaskState::Failed | TaskState::Cancelled => {
                    info!(
                        task_id = task.id,
                        parent_id,
                        parent_state = %parent.state,
                        "cascading parent terminal state to child"
                    );
                    cascade_parent_failure(inner, &task, &parent).await;
                }
                _ => {
                    debug!(
                        task_id = task.id,
                        parent_id,
                        parent_state = %parent.state,
                        "parent not ready, task waits"
                    );
                }
            },
            Ok(None) => {
                debug!(task_id = task.id, parent_id, "parent row missing, task waits");
            }
            Err(e) => {
                error!(task_id = task.id, parent_id, error = %e, "error loading parent");
            }
        }
    }

    debug!(ready = ready.len(), total, "ready tasks this tick");

    let mut assigned = 0;
    for task in ready {
        let Some(worker) = inner.pool.get_available_worker() else {
            debug!("no workers available, remaining tasks wait for the next tick");
            break;
        };

        assigned += 1;
        debug!(
            task_id = task.id,
            worker_id = %worker.worker_id(),
            "assigning task to worker"
        );
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let report = worker.run_task(task).await;
            if report.is_success() {
                inner.counters.tasks_processed.fetch_add(1, Ordering::Relaxed);
            } else {
                inner.counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    task_id = report.task_id,
                    worker_id = %report.worker_id,
                    error = report.error.as_deref().unwrap_or("unknown"),
                    "task failed in worker"
                );
            }
            inner.pool.return_worker(worker);
        });
    }

    assigned
}

/// Transition a child according to its parent's terminal state, then
/// recursively cascade to the child's own descendants.
async fn cascade_parent_failure(
    inner: &Arc<ManagerInner>,
    child: &QueuedTask,
    parent: &QueuedTask,
) {
    let result = match parent.state {
        TaskState::Failed => {
            let failure = TaskFailure::new(
                "ParentTaskFailed",
                format!("Parent task {} failed", parent.id),
            )
            .with_info(format!(
                "Parent task '{}' failed, cascading to child",
                parent.name
            ));
            inner.store.mark_failed(child.id, &failure).await
        }
        TaskState::Cancelled => inner.store.mark_cancelled(child.id).await,
        _ => return,
    };

    match result {
        Ok(()) => {
            info!(
                child_id = child.id,
                parent_id = parent.id,
                state = %parent.state,
                "cascaded parent state to child"
            );
            let mut cascaded = child.clone();
            cascaded.state = parent.state;
            cascade_to_children(Arc::clone(inner), cascaded).await;
        }
        Err(e) => {
            error!(child_id = child.id, error = %e, "error cascading parent failure");
        }
    }
}

/// Recursively cascade a task's terminal state to all of its children in
/// `enqueued` or `doing`. An in-flight child's terminal state is
/// overridden here; the worker's second parent recheck enforces the same
/// outcome if the two race.
fn cascade_to_children(inner: Arc<ManagerInner>, parent: QueuedTask) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let children = match inner.store.list_children(parent.id).await {
            Ok(children) => children,
            Err(e) => {
                error!(parent_id = parent.id, error = %e, "error loading children for cascade");
                return;
            }
        };

        for child in children {
            if !matches!(child.state, TaskState::Enqueued | TaskState::Doing) {
                continue;
            }

            let result = match parent.state {
                TaskState::Failed => {
                    let failure = TaskFailure::new(
                        "ParentTaskFailed",
                        format!("Parent task {} failed", parent.id),
                    )
                    .with_info(format!(
                        "Parent task '{}' failed, cascading to child",
                        parent.name
                    ));
                    inner.store.mark_failed(child.id, &failure).await
                }
                TaskState::Cancelled => inner.store.mark_cancelled(child.id).await,
                _ => return,
            };

            match result {
                Ok(()) => {
                    info!(
                        child_id = child.id,
                        was = %child.state,
                        now = %parent.state,
                        "cascaded state to descendant"
                    );
                    let mut cascaded = child;
                    cascaded.state = parent.state;
                    cascade_to_children(Arc::clone(&inner), cascaded).await;
                }
                Err(e) => {
                    error!(child_id = child.id, error = %e, "error cascading to descendant");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use crate::hooks::HookRegistry;
    use crate::tasks::TaskCall;
    use serde_json::json;
    use taskmill_storage::{InMemoryTaskStore, NewTask};

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        functions: Arc<FunctionRegistry>,
        tasks: QueuedTasks,
        manager: QueueWorkerManager,
    }

    fn fixture(config: QueueConfig) -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let functions = Arc::new(FunctionRegistry::new());
        let tasks = QueuedTasks::new(
            store.clone() as Arc<dyn TaskStore>,
            Arc::new(HookRegistry::new()),
            Arc::clone(&functions),
        );
        let scheduled = Arc::new(ScheduledTaskRegistry::new(&config));
        let manager = QueueWorkerManager::new(config, tasks.clone(), scheduled);
        Fixture {
            store,
            functions,
            tasks,
            manager,
        }
    }

    async fn wait_for_state(
        store: &InMemoryTaskStore,
        task_id: i64,
        state: TaskState,
    ) -> QueuedTask {
        for _ in 0..200 {
            if let Some(task) = store.get_task(task_id).await.unwrap() {
                if task.state == state {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} never reached {state}");
    }

    #[tokio::test]
    async fn parentless_task_is_ready_in_the_same_tick() {
        let fx = fixture(QueueConfig::default().with_server_name("t"));
        fx.functions.register("m", "ok", |_a, _k| async move { Ok(json!(null)) });

        let task = fx
            .tasks
            .add_task_blocking(TaskCall::new("m", "ok"), None)
            .await
            .unwrap();

        let assigned = fx.manager.process_pending_tasks().await;
        assert_eq!(assigned, 1);
        wait_for_state(&fx.store, task.id, TaskState::Done).await;
    }

    #[tokio::test]
    async fn child_waits_until_parent_done() {
        let fx = fixture(QueueConfig::default().with_server_name("t"));
        fx.functions.register("m", "ok", |_a, _k| async move { Ok(json!(null)) });

        let parent = fx
            .tasks
            .add_task_blocking(TaskCall::new("m", "ok"), None)
            .await
            .unwrap();
        let child = fx
            .tasks
            .add_task_blocking(TaskCall::new("m", "ok"), Some(parent.id))
            .await
            .unwrap();

        // First tick assigns only the parent.
        let assigned = fx.manager.process_pending_tasks().await;
        assert_eq!(assigned, 1);
        let parent_row = wait_for_state(&fx.store, parent.id, TaskState::Done).await;

        let assigned = fx.manager.process_pending_tasks().await;
        assert_eq!(assigned, 1);
        let child_row = wait_for_state(&fx.store, child.id, TaskState::Done).await;

        // Parent finished before the child started.
        assert!(parent_row.date_done.unwrap() <= child_row.date_started.unwrap());
    }

    #[tokio::test]
    async fn sibling_gate_promotes_one_child_per_tick() {
        let fx = fixture(QueueConfig::default().with_server_name("t"));
        fx.functions.register("m", "ok", |_a, _k| async move { Ok(json!(null)) });

        let parent = fx
            .tasks
            .add_task_blocking(TaskCall::new("m", "ok"), None)
            .await
            .unwrap();
        fx.store.mark_doing(parent.id).await.unwrap();
        fx.store.mark_done(parent.id).await.unwrap();

        let first = fx
            .tasks
            .add_task_blocking(TaskCall::new("m", "ok"), Some(parent.id))
            .await
            .unwrap();
        let second = fx
            .tasks
            .add_task_blocking(TaskCall::new("m", "ok"), Some(parent.id))
            .await
            .unwrap();

        let assigned = fx.manager.process_pending_tasks().await;
        assert_eq!(assigned, 1);

        wait_for_state(&fx.store, first.id, TaskState::Done).await;
        assert_eq!(
            fx.store.get_task(second.id).await.unwrap().unwrap().state,
            TaskState::Enqueued
        );

        let assigned = fx.manager.process_pending_tasks().await;
        assert_eq!(assigned, 1);
        wait_for_state(&fx.store, second.id, TaskState::Done).await;
    }

    #[tokio::test]
    async fn cascade_fails_descendants_of_failed_parent() {
        let fx = fixture(QueueConfig::default().with_server_name("t"));

        let parent = fx
            .store
            .create_task(NewTask::new("m", "parent"))
            .await
            .unwrap();
        let child = fx
            .store
            .create_task(NewTask {
                parent_task_id: Some(parent.id),
                ..NewTask::new("m", "child")
            })
            .await
            .unwrap();
        let grandchild = fx
            .store
            .create_task(NewTask {
                parent_task_id: Some(child.id),
                ..NewTask::new("m", "grandchild")
            })
            .await
            .unwrap();

        fx.store
            .mark_failed(parent.id, &TaskFailure::new("RuntimeError", "boom"))
            .await
            .unwrap();

        let assigned = fx.manager.process_pending_tasks().await;
        assert_eq!(assigned, 0);

        let child_row = fx.store.get_task(child.id).await.unwrap().unwrap();
        assert_eq!(child_row.state, TaskState::Failed);
        assert_eq!(child_row.exception_name.as_deref(), Some("ParentTaskFailed"));
        assert!(child_row
            .exception_message
            .as_deref()
            .unwrap()
            .contains(&parent.id.to_string()));

        let grandchild_row = fx.store.get_task(grandchild.id).await.unwrap().unwrap();
        assert_eq!(grandchild_row.state, TaskState::Failed);
        assert_eq!(
            grandchild_row.exception_name.as_deref(),
            Some("ParentTaskFailed")
        );
    }

    #[tokio::test]
    async fn cascade_matches_cancelled_parent_and_covers_doing_children() {
        let fx = fixture(QueueConfig::default().with_server_name("t"));

        let parent = fx
            .store
            .create_task(NewTask::new("m", "parent"))
            .await
            .unwrap();
        let child = fx
            .store
            .create_task(NewTask {
                parent_task_id: Some(parent.id),
                ..NewTask::new("m", "child")
            })
            .await
            .unwrap();
        let running_grandchild = fx
            .store
            .create_task(NewTask {
                parent_task_id: Some(child.id),
                ..NewTask::new("m", "grandchild")
            })
            .await
            .unwrap();
        fx.store.mark_doing(running_grandchild.id).await.unwrap();

        fx.store.mark_cancelled(parent.id).await.unwrap();
        fx.manager.process_pending_tasks().await;

        assert_eq!(
            fx.store.get_task(child.id).await.unwrap().unwrap().state,
            TaskState::Cancelled
        );
        assert_eq!(
            fx.store
                .get_task(running_grandchild.id)
                .await
                .unwrap()
                .unwrap()
                .state,
            TaskState::Cancelled
        );
    }

    #[tokio::test]
    async fn saturated_pool_assigns_fifo_prefix() {
        let config = QueueConfig::default()
            .with_server_name("t")
            .with_max_workers(2);
        let fx = fixture(config);
        fx.functions.register("m", "slow", |_a, _k| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!(null))
        });

        let mut ids = Vec::new();
        for _ in 0..5 {
            let task = fx
                .tasks
                .add_task_blocking(TaskCall::new("m", "slow"), None)
                .await
                .unwrap();
            ids.push(task.id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let assigned = fx.manager.process_pending_tasks().await;
        assert_eq!(assigned, 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        // The two oldest submissions are running; the rest still wait.
        let counts = fx.store.counts_by_state().await.unwrap();
        assert_eq!(counts.doing, 2);
        assert_eq!(counts.enqueued, 3);
        for (i, id) in ids.iter().enumerate() {
            let task = fx.store.get_task(*id).await.unwrap().unwrap();
            if i < 2 {
                assert_eq!(task.state, TaskState::Doing);
            } else {
                assert_eq!(task.state, TaskState::Enqueued);
            }
        }
    }

    #[tokio::test]
    async fn stats_reflect_outcomes() {
        let fx = fixture(QueueConfig::default().with_server_name("t"));
        fx.functions.register("m", "ok", |_a, _k| async move { Ok(json!(null)) });
        fx.functions.register("m", "bad", |_a, _k| async move {
            Err(crate::error::TaskError::new("RuntimeError", "no"))
        });

        let ok = fx
            .tasks
            .add_task_blocking(TaskCall::new("m", "ok"), None)
            .await
            .unwrap();
        let bad = fx
            .tasks
            .add_task_blocking(TaskCall::new("m", "bad"), None)
            .await
            .unwrap();

        fx.manager.process_pending_tasks().await;
        wait_for_state(&fx.store, ok.id, TaskState::Done).await;
        wait_for_state(&fx.store, bad.id, TaskState::Failed).await;

        // Counters are bumped after the terminal write; allow a beat.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = fx.manager.stats().await;
        assert_eq!(snapshot.tasks_processed, 1);
        assert_eq!(snapshot.tasks_failed, 1);
    }

    #[tokio::test]
    async fn start_and_stop_maintain_server_record() {
        let config = QueueConfig::default()
            .with_server_name("lifecycle-test")
            .with_max_workers(3);
        let fx = fixture(config);

        fx.manager.start().await.unwrap();
        assert!(fx.manager.is_running());

        let record = fx.store.get_server("lifecycle-test").await.unwrap().unwrap();
        assert!(record.is_running);
        assert_eq!(record.max_workers, 3);

        let view = fx.manager.fleet_view().await.unwrap();
        assert_eq!(view.servers, 1);
        assert_eq!(view.max_workers, 3);

        fx.manager.stop().await;
        assert!(!fx.manager.is_running());

        let record = fx.store.get_server("lifecycle-test").await.unwrap().unwrap();
        assert!(!record.is_running);
        assert_eq!(record.total_workers(), 0);

        let view = fx.manager.fleet_view().await.unwrap();
        assert_eq!(view.servers, 0);
    }
}
