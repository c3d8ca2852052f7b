//! PostgreSQL implementation of TaskStore
//!
//! Production persistence with:
//! - Single-row state transitions computed in SQL (dates and execution time
//!   are set in the same UPDATE as the state)
//! - NOTIFY/LISTEN wake-up via an idempotently installed trigger
//! - Transient-error classification for the worker's terminal-write retry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::models::*;
use crate::store::{NotificationStream, StoreError, TaskStore};

const TASK_COLUMNS: &str = "id, name, module_name, function_name, serialized_function, state, \
     args, kwargs, context, parent_task_id, exception_name, exception_message, exception_info, \
     execution_time, auto_remove, date_enqueued, date_started, date_stopped, date_ended, \
     date_done, date_cancelled, date_failed, created_at, updated_at";

const WORKER_COLUMNS: &str = "id, server_name, max_workers, active_workers, idle_workers, \
     is_running, last_heartbeat, started_at, version, created_at, updated_at";

/// PostgreSQL-backed task store.
///
/// All hot-path writes are single-row UPDATEs keyed by id, so concurrent
/// managers only contend at row granularity.
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(classify_db_error)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}

/// Map a sqlx error onto the store taxonomy.
///
/// Serialization conflicts (40001) and deadlocks (40P01) become
/// `Retryable`, recognized by SQLSTATE or by substring in the driver text.
fn classify_db_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if let Some(code) = db_err.code() {
            if code == "40001" || code == "40P01" {
                return StoreError::Retryable(db_err.to_string());
            }
        }
        let text = db_err.message().to_lowercase();
        if text.contains("could not serialize access") || text.contains("deadlock detected") {
            return StoreError::Retryable(db_err.to_string());
        }
    }
    StoreError::Database(e.to_string())
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn create_task(&self, new: NewTask) -> Result<QueuedTask, StoreError> {
        let name = new.resolved_name();
        let sql = format!(
            r#"
            INSERT INTO queued_tasks
                (name, module_name, function_name, serialized_function, state,
                 args, kwargs, context, parent_task_id, auto_remove, date_enqueued)
            VALUES ($1, $2, $3, $4, 'enqueued', $5, $6, $7, $8, $9, COALESCE($10, NOW()))
            RETURNING {TASK_COLUMNS}
            "#
        );

        let task = sqlx::query_as::<_, QueuedTask>(&sql)
            .bind(&name)
            .bind(&new.module_name)
            .bind(&new.function_name)
            .bind(&new.serialized_function)
            .bind(&new.args)
            .bind(&new.kwargs)
            .bind(&new.context)
            .bind(new.parent_task_id)
            .bind(new.auto_remove)
            .bind(new.date_enqueued)
            .fetch_one(&self.pool)
            .await
            .map_err(classify_db_error)?;

        debug!(task_id = task.id, name = %task.name, "created task");
        Ok(task)
    }

    async fn get_task(&self, id: i64) -> Result<Option<QueuedTask>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM queued_tasks WHERE id = $1");
        sqlx::query_as::<_, QueuedTask>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_db_error)
    }

    async fn delete_task(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM queued_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn pending_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM queued_tasks WHERE state = 'enqueued'")
            .fetch_one(&self.pool)
            .await
            .map_err(classify_db_error)?;
        Ok(row.get::<i64, _>("count"))
    }

    async fn counts_by_state(&self) -> Result<TaskStateCounts, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM queued_tasks GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(classify_db_error)?;

        let mut counts = TaskStateCounts::default();
        for row in rows {
            let state: TaskState = row.get("state");
            let count: i64 = row.get("count");
            counts.total += count;
            match state {
                TaskState::Enqueued => counts.enqueued = count,
                TaskState::Waiting => counts.waiting = count,
                TaskState::Doing => counts.doing = count,
                TaskState::Stopped => counts.stopped = count,
                TaskState::Done => counts.done = count,
                TaskState::Failed => counts.failed = count,
                TaskState::Cancelled => counts.cancelled = count,
            }
        }
        Ok(counts)
    }

    async fn list_due_enqueued(&self, now: DateTime<Utc>) -> Result<Vec<QueuedTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM queued_tasks \
             WHERE state = 'enqueued' AND date_enqueued <= $1 \
             ORDER BY date_enqueued ASC"
        );
        sqlx::query_as::<_, QueuedTask>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_db_error)
    }

    async fn list_children(&self, parent_id: i64) -> Result<Vec<QueuedTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM queued_tasks WHERE parent_task_id = $1 ORDER BY id"
        );
        sqlx::query_as::<_, QueuedTask>(&sql)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_db_error)
    }

    async fn has_active_by_name(&self, name: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM queued_tasks \
             WHERE name = $1 AND state IN ('enqueued', 'waiting', 'doing') \
             LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(row.is_some())
    }

    async fn clear_pending(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM queued_tasks WHERE state = 'enqueued'")
            .execute(&self.pool)
            .await
            .map_err(classify_db_error)?;
        Ok(result.rows_affected())
    }

    async fn mark_doing(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_tasks SET state = 'doing',
                date_started = NOW(),
                date_stopped = NULL,
                date_done = NULL,
                date_cancelled = NULL,
                date_failed = NULL,
                date_ended = NULL,
                exception_name = NULL,
                exception_message = NULL,
                exception_info = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn mark_done(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_tasks SET state = 'done',
                date_done = NOW(),
                date_ended = NOW(),
                execution_time = EXTRACT(EPOCH FROM (NOW() - COALESCE(date_started, NOW()))),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, failure: &TaskFailure) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_tasks SET state = 'failed',
                exception_name = $2,
                exception_message = $3,
                exception_info = $4,
                date_failed = NOW(),
                date_ended = NOW(),
                execution_time = EXTRACT(EPOCH FROM (NOW() - COALESCE(date_started, NOW()))),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&failure.exception_name)
        .bind(&failure.exception_message)
        .bind(&failure.exception_info)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn mark_cancelled(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_tasks SET state = 'cancelled',
                date_cancelled = NOW(),
                date_ended = NOW(),
                execution_time = EXTRACT(EPOCH FROM (NOW() - COALESCE(date_started, NOW()))),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn mark_stopped(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_tasks SET state = 'stopped',
                date_stopped = NOW(),
                date_ended = NOW(),
                execution_time = EXTRACT(EPOCH FROM (NOW() - COALESCE(date_started, NOW()))),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn mark_waiting(&self, id: i64) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE queued_tasks SET state = 'waiting', updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn requeue(&self, id: i64) -> Result<QueuedTask, StoreError> {
        let sql = format!(
            r#"
            UPDATE queued_tasks SET state = 'enqueued',
                date_enqueued = NOW(),
                date_started = NULL,
                date_stopped = NULL,
                date_ended = NULL,
                date_done = NULL,
                date_cancelled = NULL,
                date_failed = NULL,
                execution_time = 0,
                exception_name = NULL,
                exception_message = NULL,
                exception_info = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TASK_COLUMNS}
            "#
        );

        sqlx::query_as::<_, QueuedTask>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_db_error)?
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn update_context(
        &self,
        id: i64,
        context: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE queued_tasks SET context = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(context)
                .execute(&self.pool)
                .await
                .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn insert_log(&self, log: NewTaskLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO queued_task_logs (task_id, log_type, name, message, info) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(log.task_id)
        .bind(log.log_type)
        .bind(&log.name)
        .bind(&log.message)
        .bind(&log.info)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(())
    }

    async fn list_logs(&self, task_id: i64) -> Result<Vec<QueuedTaskLog>, StoreError> {
        sqlx::query_as::<_, QueuedTaskLog>(
            "SELECT id, task_id, log_type, logged_at, name, message, info \
             FROM queued_task_logs WHERE task_id = $1 ORDER BY logged_at",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_db_error)
    }

    async fn register_server(
        &self,
        server_name: &str,
        max_workers: i32,
        version: Option<&str>,
    ) -> Result<WorkerRecord, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO queued_task_workers
                (server_name, max_workers, is_running, started_at, last_heartbeat, version)
            VALUES ($1, $2, TRUE, NOW(), NOW(), $3)
            ON CONFLICT (server_name) DO UPDATE SET
                max_workers = EXCLUDED.max_workers,
                is_running = TRUE,
                started_at = NOW(),
                last_heartbeat = NOW(),
                version = EXCLUDED.version,
                updated_at = NOW()
            RETURNING {WORKER_COLUMNS}
            "#
        );

        let record = sqlx::query_as::<_, WorkerRecord>(&sql)
            .bind(server_name)
            .bind(max_workers)
            .bind(version)
            .fetch_one(&self.pool)
            .await
            .map_err(classify_db_error)?;

        info!(server_name, max_workers, "registered server");
        Ok(record)
    }

    async fn update_server_stats(
        &self,
        server_name: &str,
        active_workers: i32,
        idle_workers: i32,
        is_running: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_task_workers SET
                active_workers = $2,
                idle_workers = $3,
                is_running = $4,
                last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE server_name = $1
            "#,
        )
        .bind(server_name)
        .bind(active_workers)
        .bind(idle_workers)
        .bind(is_running)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ServerNotFound(server_name.to_string()));
        }
        Ok(())
    }

    async fn mark_server_stopped(&self, server_name: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queued_task_workers SET
                is_running = FALSE,
                active_workers = 0,
                idle_workers = 0,
                last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE server_name = $1
            "#,
        )
        .bind(server_name)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ServerNotFound(server_name.to_string()));
        }
        Ok(())
    }

    async fn get_server(&self, server_name: &str) -> Result<Option<WorkerRecord>, StoreError> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM queued_task_workers WHERE server_name = $1");
        sqlx::query_as::<_, WorkerRecord>(&sql)
            .bind(server_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_db_error)
    }

    async fn list_servers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM queued_task_workers ORDER BY server_name");
        sqlx::query_as::<_, WorkerRecord>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_db_error)
    }

    async fn fleet_view(&self) -> Result<FleetView, StoreError> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM queued_task_workers \
             WHERE is_running = TRUE AND last_heartbeat >= NOW() - INTERVAL '2 minutes' \
             ORDER BY server_name"
        );
        let servers = sqlx::query_as::<_, WorkerRecord>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_db_error)?;

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

    async fn install_notify_trigger(&self, channel: &str) -> Result<(), StoreError> {
        // The channel name comes from configuration, not user input; it is
        // inlined because pg_notify's channel must be a literal here.
        let function_sql = format!(
            r#"
            CREATE OR REPLACE FUNCTION notify_new_queued_task()
            RETURNS TRIGGER AS $$
            BEGIN
                IF NEW.state = 'enqueued' THEN
                    PERFORM pg_notify('{channel}',
                        json_build_object(
                            'task_id', NEW.id,
                            'state', NEW.state,
                            'module_name', NEW.module_name,
                            'function_name', NEW.function_name,
                            'created_at', NEW.created_at
                        )::text
                    );
                END IF;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;
            "#
        );

        let mut tx = self.pool.begin().await.map_err(classify_db_error)?;

        sqlx::query(&function_sql)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;

        sqlx::query("DROP TRIGGER IF EXISTS queued_task_notify ON queued_tasks")
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;

        sqlx::query(
            "CREATE TRIGGER queued_task_notify \
             AFTER INSERT OR UPDATE ON queued_tasks \
             FOR EACH ROW EXECUTE FUNCTION notify_new_queued_task()",
        )
        .execute(&mut *tx)
        .await
        .map_err(classify_db_error)?;

        tx.commit().await.map_err(classify_db_error)?;

        info!(channel, "installed queue notification trigger");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NotificationStream, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(classify_db_error)?;
        listener.listen(channel).await.map_err(classify_db_error)?;
        debug!(channel, "listening for queue notifications");
        Ok(NotificationStream::from_listener(listener))
    }
}
