//! In-memory implementation of TaskStore for testing
//!
//! Mirrors the PostgreSQL implementation's semantics, including the
//! notification broadcast fired whenever a row lands in state `enqueued`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::models::*;
use crate::store::{NotificationStream, StoreError, TaskStore};

struct MemInner {
    tasks: HashMap<i64, QueuedTask>,
    logs: Vec<QueuedTaskLog>,
    servers: HashMap<String, WorkerRecord>,
    next_task_id: i64,
    next_log_id: i64,
    next_server_id: i64,
}

/// In-memory task store.
///
/// Primarily for tests: same contract as `PostgresTaskStore`, no database
/// required. Notifications are delivered over a broadcast channel.
pub struct InMemoryTaskStore {
    inner: RwLock<MemInner>,
    notify_tx: broadcast::Sender<TaskNotification>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(MemInner {
                tasks: HashMap::new(),
                logs: Vec::new(),
                servers: HashMap::new(),
                next_task_id: 1,
                next_log_id: 1,
                next_server_id: 1,
            }),
            notify_tx,
        }
    }

    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }

    pub fn log_count(&self) -> usize {
        self.inner.read().logs.len()
    }

    /// Clear all data (for testing).
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.tasks.clear();
        inner.logs.clear();
        inner.servers.clear();
    }

    fn notify_enqueued(&self, task: &QueuedTask) {
        let notification = TaskNotification {
            task_id: task.id,
            state: task.state.to_string(),
            module_name: task.module_name.clone(),
            function_name: task.function_name.clone(),
            created_at: task.created_at.to_rfc3339(),
        };
        // No receivers is fine.
        let _ = self.notify_tx.send(notification);
    }

    fn with_task<T>(
        &self,
        id: i64,
        f: impl FnOnce(&mut QueuedTask) -> T,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.write();
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        let out = f(task);
        task.updated_at = Utc::now();
        Ok(out)
    }
}

fn execution_time(started: Option<DateTime<Utc>>, ended: DateTime<Utc>) -> f64 {
    match started {
        Some(started) => (ended - started).num_milliseconds() as f64 / 1000.0,
        None => 0.0,
    }
}

/// Remove a task and, transitively, every descendant (the in-memory
/// equivalent of the ON DELETE CASCADE constraint).
fn remove_with_descendants(inner: &mut MemInner, id: i64) -> bool {
    if inner.tasks.remove(&id).is_none() {
        return false;
    }
    let children: Vec<i64> = inner
        .tasks
        .values()
        .filter(|t| t.parent_task_id == Some(id))
        .map(|t| t.id)
        .collect();
    for child in children {
        remove_with_descendants(inner, child);
    }
    inner.logs.retain(|log| log.task_id != id);
    true
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, new: NewTask) -> Result<QueuedTask, StoreError> {
        let now = Utc::now();
        let task = {
            let mut inner = self.inner.write();
            let id = inner.next_task_id;
            inner.next_task_id += 1;

            let task = QueuedTask {
                id,
                name: new.resolved_name(),
                module_name: new.module_name,
                function_name: new.function_name,
                serialized_function: new.serialized_function,
                state: TaskState::Enqueued,
                args: new.args,
                kwargs: new.kwargs,
                context: new.context,
                parent_task_id: new.parent_task_id,
                exception_name: None,
                exception_message: None,
                exception_info: None,
                execution_time: 0.0,
                auto_remove: new.auto_remove,
                date_enqueued: Some(new.date_enqueued.unwrap_or(now)),
                date_started: None,
                date_stopped: None,
                date_ended: None,
                date_done: None,
                date_cancelled: None,
                date_failed: None,
                created_at: now,
                updated_at: now,
            };
            inner.tasks.insert(id, task.clone());
            task
        };

        self.notify_enqueued(&task);
        Ok(task)
    }

    async fn get_task(&self, id: i64) -> Result<Option<QueuedTask>, StoreError> {
        Ok(self.inner.read().tasks.get(&id).cloned())
    }

    async fn delete_task(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        Ok(remove_with_descendants(&mut inner, id))
    }

    async fn pending_count(&self) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Enqueued)
            .count() as i64)
    }

    async fn counts_by_state(&self) -> Result<TaskStateCounts, StoreError> {
        let inner = self.inner.read();
        let mut counts = TaskStateCounts::default();
        for task in inner.tasks.values() {
            counts.total += 1;
            match task.state {
                TaskState::Enqueued => counts.enqueued += 1,
                TaskState::Waiting => counts.waiting += 1,
                TaskState::Doing => counts.doing += 1,
                TaskState::Stopped => counts.stopped += 1,
                TaskState::Done => counts.done += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn list_due_enqueued(&self, now: DateTime<Utc>) -> Result<Vec<QueuedTask>, StoreError> {
        let inner = self.inner.read();
        let mut due: Vec<QueuedTask> = inner
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Enqueued && t.date_enqueued.is_some_and(|d| d <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.date_enqueued, t.id));
        Ok(due)
    }

    async fn list_children(&self, parent_id: i64) -> Result<Vec<QueuedTask>, StoreError> {
        let inner = self.inner.read();
        let mut children: Vec<QueuedTask> = inner
            .tasks
            .values()
            .filter(|t| t.parent_task_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|t| t.id);
        Ok(children)
    }

    async fn has_active_by_name(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .any(|t| t.name == name && t.state.is_active()))
    }

    async fn clear_pending(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let pending: Vec<i64> = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Enqueued)
            .map(|t| t.id)
            .collect();
        let count = pending.len() as u64;
        for id in pending {
            remove_with_descendants(&mut inner, id);
        }
        Ok(count)
    }

    async fn mark_doing(&self, id: i64) -> Result<(), StoreError> {
        self.with_task(id, |task| {
            task.state = TaskState::Doing;
            task.date_started = Some(Utc::now());
            task.date_stopped = None;
            task.date_done = None;
            task.date_cancelled = None;
            task.date_failed = None;
            task.date_ended = None;
            task.exception_name = None;
            task.exception_message = None;
            task.exception_info = None;
        })
    }

    async fn mark_done(&self, id: i64) -> Result<(), StoreError> {
        self.with_task(id, |task| {
            let now = Utc::now();
            task.state = TaskState::Done;
            task.date_done = Some(now);
            task.date_ended = Some(now);
            task.execution_time = execution_time(task.date_started, now);
        })
    }

    async fn mark_failed(&self, id: i64, failure: &TaskFailure) -> Result<(), StoreError> {
        self.with_task(id, |task| {
            let now = Utc::now();
            task.state = TaskState::Failed;
            task.exception_name = Some(failure.exception_name.clone());
            task.exception_message = Some(failure.exception_message.clone());
            task.exception_info = failure.exception_info.clone();
            task.date_failed = Some(now);
            task.date_ended = Some(now);
            task.execution_time = execution_time(task.date_started, now);
        })
    }

    async fn mark_cancelled(&self, id: i64) -> Result<(), StoreError> {
        self.with_task(id, |task| {
            let now = Utc::now();
            task.state = TaskState::Cancelled;
            task.date_cancelled = Some(now);
            task.date_ended = Some(now);
            task.execution_time = execution_time(task.date_started, now);
        })
    }

    async fn mark_stopped(&self, id: i64) -> Result<(), StoreError> {
        self.with_task(id, |task| {
            let now = Utc::now();
            task.state = TaskState::Stopped;
            task.date_stopped = Some(now);
            task.date_ended = Some(now);
            task.execution_time = execution_time(task.date_started, now);
        })
    }

    async fn mark_waiting(&self, id: i64) -> Result<(), StoreError> {
        self.with_task(id, |task| {
            task.state = TaskState::Waiting;
        })
    }

    async fn requeue(&self, id: i64) -> Result<QueuedTask, StoreError> {
        let task = self.with_task(id, |task| {
            task.state = TaskState::Enqueued;
            task.date_enqueued = Some(Utc::now());
            task.date_started = None;
            task.date_stopped = None;
            task.date_ended = None;
            task.date_done = None;
            task.date_cancelled = None;
            task.date_failed = None;
            task.execution_time = 0.0;
            task.exception_name = None;
            task.exception_message = None;
            task.exception_info = None;
            task.clone()
        })?;

        // The Postgres trigger fires for updates landing in `enqueued` too.
        self.notify_enqueued(&task);
        Ok(task)
    }

    async fn update_context(
        &self,
        id: i64,
        context: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.with_task(id, |task| {
            task.context = context.clone();
        })
    }

    async fn insert_log(&self, log: NewTaskLog) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let id = inner.next_log_id;
        inner.next_log_id += 1;
        inner.logs.push(QueuedTaskLog {
            id,
            task_id: log.task_id,
            log_type: log.log_type,
            logged_at: Utc::now(),
            name: log.name,
            message: log.message,
            info: log.info,
        });
        Ok(())
    }

    async fn list_logs(&self, task_id: i64) -> Result<Vec<QueuedTaskLog>, StoreError> {
        Ok(self
            .inner
            .read()
            .logs
            .iter()
            .filter(|log| log.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn register_server(
        &self,
        server_name: &str,
        max_workers: i32,
        version: Option<&str>,
    ) -> Result<WorkerRecord, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        if let Some(record) = inner.servers.get_mut(server_name) {
            record.max_workers = max_workers;
            record.is_running = true;
            record.started_at = Some(now);
            record.last_heartbeat = now;
            record.version = version.map(String::from);
            record.updated_at = now;
            return Ok(record.clone());
        }

        let id = inner.next_server_id;
        inner.next_server_id += 1;
        let record = WorkerRecord {
            id,
            server_name: server_name.to_string(),
            max_workers,
            active_workers: 0,
            idle_workers: 0,
            is_running: true,
            last_heartbeat: now,
            started_at: Some(now),
            version: version.map(String::from),
            created_at: now,
            updated_at: now,
        };
        inner.servers.insert(server_name.to_string(), record.clone());
        Ok(record)
    }

    async fn update_server_stats(
        &self,
        server_name: &str,
        active_workers: i32,
        idle_workers: i32,
        is_running: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let record = inner
            .servers
            .get_mut(server_name)
            .ok_or_else(|| StoreError::ServerNotFound(server_name.to_string()))?;
        let now = Utc::now();
        record.active_workers = active_workers;
        record.idle_workers = idle_workers;
        record.is_running = is_running;
        record.last_heartbeat = now;
        record.updated_at = now;
        Ok(())
    }

    async fn mark_server_stopped(&self, server_name: &str) -> Result<(), StoreError> {
        self.update_server_stats(server_name, 0, 0, false).await
    }

    async fn get_server(&self, server_name: &str) -> Result<Option<WorkerRecord>, StoreError> {
        Ok(self.inner.read().servers.get(server_name).cloned())
    }

    async fn list_servers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let mut servers: Vec<WorkerRecord> = self.inner.read().servers.values().cloned().collect();
        servers.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        Ok(servers)
    }

    async fn fleet_view(&self) -> Result<FleetView, StoreError> {
        let now = Utc::now();
        let mut servers: Vec<WorkerRecord> = self
            .inner
            .read()
            .servers
            .values()
            .filter(|s| s.is_alive(now))
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.server_name.cmp(&b.server_name));

        let mut view = FleetView {
            servers: servers.len(),
            ..Default::default()
        };
        for server in &servers {
            view.max_workers += i64::from(server.max_workers);
            view.active_workers += i64::from(server.active_workers);
            view.idle_workers += i64::from(server.idle_workers);
        }
        view.total_workers = view.active_workers + view.idle_workers;
        view.servers_detail = servers;
        Ok(view)
    }

    async fn install_notify_trigger(&self, _channel: &str) -> Result<(), StoreError> {
        // Notifications are native to this store.
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> Result<NotificationStream, StoreError> {
        Ok(NotificationStream::from_receiver(self.notify_tx.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> InMemoryTaskStore {
        InMemoryTaskStore::new()
    }

    fn new_task(module: &str, function: &str) -> NewTask {
        NewTask::new(module, function)
    }

    #[tokio::test]
    async fn create_and_get_task() {
        let store = store();
        let task = store
            .create_task(NewTask {
                args: json!([41]),
                ..new_task("math", "addone")
            })
            .await
            .unwrap();

        assert_eq!(task.state, TaskState::Enqueued);
        assert_eq!(task.name, "math.addone");
        assert!(task.date_enqueued.is_some());
        assert_eq!(task.args, json!([41]));

        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert!(store.get_task(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_transitions_set_dates_and_execution_time() {
        let store = store();
        let task = store.create_task(new_task("m", "f")).await.unwrap();

        store.mark_doing(task.id).await.unwrap();
        let doing = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(doing.state, TaskState::Doing);
        assert!(doing.date_started.is_some());
        assert!(doing.date_ended.is_none());

        store.mark_done(task.id).await.unwrap();
        let done = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Done);
        assert!(done.date_done.is_some());
        assert_eq!(done.date_ended, done.date_done);
        assert!(done.execution_time >= 0.0);
    }

    #[tokio::test]
    async fn mark_failed_records_snapshot() {
        let store = store();
        let task = store.create_task(new_task("m", "f")).await.unwrap();
        store.mark_doing(task.id).await.unwrap();

        let failure = TaskFailure::new("RuntimeError", "boom").with_info("trace");
        store.mark_failed(task.id, &failure).await.unwrap();

        let failed = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.exception_name.as_deref(), Some("RuntimeError"));
        assert_eq!(failed.exception_message.as_deref(), Some("boom"));
        assert_eq!(failed.exception_info.as_deref(), Some("trace"));
        assert_eq!(failed.date_ended, failed.date_failed);
    }

    #[tokio::test]
    async fn mark_doing_clears_prior_failure() {
        let store = store();
        let task = store.create_task(new_task("m", "f")).await.unwrap();
        store
            .mark_failed(task.id, &TaskFailure::new("E", "msg"))
            .await
            .unwrap();

        store.mark_doing(task.id).await.unwrap();
        let doing = store.get_task(task.id).await.unwrap().unwrap();
        assert!(doing.exception_name.is_none());
        assert!(doing.date_failed.is_none());
        assert!(doing.date_ended.is_none());
    }

    #[tokio::test]
    async fn requeue_resets_execution_fields() {
        let store = store();
        let task = store.create_task(new_task("m", "f")).await.unwrap();
        store.mark_doing(task.id).await.unwrap();
        store.mark_stopped(task.id).await.unwrap();

        let requeued = store.requeue(task.id).await.unwrap();
        assert_eq!(requeued.id, task.id);
        assert_eq!(requeued.state, TaskState::Enqueued);
        assert!(requeued.date_started.is_none());
        assert!(requeued.date_stopped.is_none());
        assert!(requeued.date_ended.is_none());
        assert_eq!(requeued.execution_time, 0.0);
    }

    #[tokio::test]
    async fn due_selection_is_fifo_and_excludes_future_rows() {
        let store = store();
        let now = Utc::now();

        let first = store.create_task(new_task("m", "a")).await.unwrap();
        let second = store.create_task(new_task("m", "b")).await.unwrap();
        let future = store
            .create_task(NewTask {
                date_enqueued: Some(now + chrono::Duration::hours(1)),
                ..new_task("m", "later")
            })
            .await
            .unwrap();

        let due = store.list_due_enqueued(Utc::now()).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(!ids.contains(&future.id));
    }

    #[tokio::test]
    async fn waiting_rows_are_not_selected() {
        let store = store();
        let task = store.create_task(new_task("m", "f")).await.unwrap();
        store.mark_waiting(task.id).await.unwrap();

        let due = store.list_due_enqueued(Utc::now()).await.unwrap();
        assert!(due.is_empty());
        assert!(store.has_active_by_name("m.f").await.unwrap());
    }

    #[tokio::test]
    async fn active_by_name_covers_duplicate_suppression_window() {
        let store = store();
        let task = store
            .create_task(NewTask {
                name: Some("daily-rollup".into()),
                ..new_task("jobs", "rollup")
            })
            .await
            .unwrap();

        assert!(store.has_active_by_name("daily-rollup").await.unwrap());

        store.mark_doing(task.id).await.unwrap();
        assert!(store.has_active_by_name("daily-rollup").await.unwrap());

        store.mark_done(task.id).await.unwrap();
        assert!(!store.has_active_by_name("daily-rollup").await.unwrap());
    }

    #[tokio::test]
    async fn delete_cascades_to_descendants() {
        let store = store();
        let parent = store.create_task(new_task("m", "parent")).await.unwrap();
        let child = store
            .create_task(NewTask {
                parent_task_id: Some(parent.id),
                ..new_task("m", "child")
            })
            .await
            .unwrap();
        let grandchild = store
            .create_task(NewTask {
                parent_task_id: Some(child.id),
                ..new_task("m", "grandchild")
            })
            .await
            .unwrap();

        assert!(store.delete_task(parent.id).await.unwrap());
        assert!(store.get_task(child.id).await.unwrap().is_none());
        assert!(store.get_task(grandchild.id).await.unwrap().is_none());
        assert!(!store.delete_task(parent.id).await.unwrap());
    }

    #[tokio::test]
    async fn notifications_fire_for_enqueued_rows() {
        let store = store();
        let mut stream = store.subscribe("queue_new_task").await.unwrap();

        let task = store.create_task(new_task("m", "f")).await.unwrap();
        let n = stream.recv().await.unwrap();
        assert_eq!(n.task_id, task.id);
        assert_eq!(n.state, "enqueued");

        store.mark_doing(task.id).await.unwrap();
        store.mark_stopped(task.id).await.unwrap();
        store.requeue(task.id).await.unwrap();
        let n = stream.recv().await.unwrap();
        assert_eq!(n.task_id, task.id);
    }

    #[tokio::test]
    async fn server_records_and_fleet_view() {
        let store = store();
        store.register_server("s1", 4, Some("0.1.0")).await.unwrap();
        store.register_server("s2", 4, None).await.unwrap();

        store.update_server_stats("s1", 2, 1, true).await.unwrap();
        store.update_server_stats("s2", 0, 3, true).await.unwrap();

        let view = store.fleet_view().await.unwrap();
        assert_eq!(view.servers, 2);
        assert_eq!(view.max_workers, 8);
        assert_eq!(view.active_workers, 2);
        assert_eq!(view.idle_workers, 4);
        assert_eq!(view.total_workers, 6);

        store.mark_server_stopped("s1").await.unwrap();
        let view = store.fleet_view().await.unwrap();
        assert_eq!(view.servers, 1);
        assert_eq!(view.servers_detail[0].server_name, "s2");
    }

    #[tokio::test]
    async fn counts_by_state_totals() {
        let store = store();
        let a = store.create_task(new_task("m", "a")).await.unwrap();
        let b = store.create_task(new_task("m", "b")).await.unwrap();
        store.create_task(new_task("m", "c")).await.unwrap();

        store.mark_doing(a.id).await.unwrap();
        store.mark_done(a.id).await.unwrap();
        store
            .mark_failed(b.id, &TaskFailure::new("E", "x"))
            .await
            .unwrap();

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.done, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.enqueued, 1);
    }

    #[tokio::test]
    async fn logs_append_and_list() {
        let store = store();
        let task = store.create_task(new_task("m", "f")).await.unwrap();

        store
            .insert_log(NewTaskLog {
                task_id: task.id,
                log_type: TaskLogLevel::Info,
                name: Some("worker".into()),
                message: Some("started".into()),
                info: None,
            })
            .await
            .unwrap();

        let logs = store.list_logs(task.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message.as_deref(), Some("started"));
    }
}
