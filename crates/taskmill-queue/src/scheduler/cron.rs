//! Cron scheduler
//!
//! Runs as one of the manager's loops: sleeps until the next minute
//! boundary, then materializes a task for every enabled definition whose
//! cron expression matches the current minute. Duplicate suppression is
//! per-name over the active states, so concurrent managers do not
//! double-fire.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use serde_json::Value;
use taskmill_storage::NewTask;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::scheduler::registry::{ScheduledTaskDef, ScheduledTaskRegistry};
use crate::tasks::QueuedTasks;

/// Whether `expr` matches the given minute.
///
/// The next fire time is computed starting one minute before the target;
/// the expression matches iff that next fire time equals the target.
/// 5-field expressions are normalized by prepending a zero seconds field.
pub fn cron_matches(expr: &str, minute: DateTime<Utc>) -> Result<bool, cron::error::Error> {
    let normalized = normalize_cron(expr);
    let schedule = Schedule::from_str(&normalized)?;
    let one_minute_before = minute - ChronoDuration::minutes(1);
    Ok(schedule.after(&one_minute_before).next() == Some(minute))
}

fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Truncate to the start of the minute.
pub fn truncate_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    let secs = dt.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).expect("timestamp in range")
}

/// Evaluates cron expressions at minute boundaries and creates tasks.
pub struct CronScheduler {
    registry: Arc<ScheduledTaskRegistry>,
    tasks: QueuedTasks,
    shutdown_rx: watch::Receiver<bool>,
}

impl CronScheduler {
    pub fn new(
        registry: Arc<ScheduledTaskRegistry>,
        tasks: QueuedTasks,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            tasks,
            shutdown_rx,
        }
    }

    /// Main scheduler loop; returns when shutdown is signaled.
    pub async fn run(mut self) {
        let active = self
            .registry
            .all()
            .iter()
            .filter(|d| self.registry.is_enabled(&d.name))
            .count();
        info!(active, "cron scheduler started");

        loop {
            let now = Utc::now();
            let next_minute = truncate_to_minute(now) + ChronoDuration::minutes(1);
            let sleep_for = (next_minute - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.shutdown_rx.changed() => break,
            }
            if *self.shutdown_rx.borrow() {
                break;
            }

            let minute = truncate_to_minute(Utc::now());
            self.tick(minute).await;
        }

        info!("cron scheduler stopped");
    }

    /// Evaluate all registered definitions against one minute.
    pub async fn tick(&self, minute: DateTime<Utc>) {
        for def in self.registry.all() {
            if !self.registry.is_enabled(&def.name) {
                continue;
            }
            match cron_matches(&def.cron, minute) {
                Ok(true) => {
                    debug!(name = %def.name, %minute, "cron match");
                    self.create_task_if_absent(&def).await;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(name = %def.name, cron = %def.cron, error = %e, "invalid cron expression");
                }
            }
        }
    }

    /// Materialize a task for the definition unless a row with this name
    /// is already active.
    async fn create_task_if_absent(&self, def: &ScheduledTaskDef) {
        match self.tasks.store().has_active_by_name(&def.name).await {
            Ok(true) => {
                debug!(name = %def.name, "skipping cron task, an active row exists");
            }
            Ok(false) => {
                let new = NewTask {
                    name: Some(def.name.clone()),
                    module_name: Some(def.module_name.clone()),
                    function_name: Some(def.function_name.clone()),
                    serialized_function: None,
                    args: Value::Array(vec![]),
                    kwargs: Value::Object(serde_json::Map::new()),
                    context: Value::Object(def.context.clone()),
                    parent_task_id: None,
                    auto_remove: def.auto_remove,
                    date_enqueued: None,
                };
                match self.tasks.create_task(new).await {
                    Ok(task) => {
                        info!(name = %def.name, task_id = task.id, "created cron task");
                    }
                    Err(e) => {
                        error!(name = %def.name, error = %e, "error creating cron task");
                    }
                }
            }
            Err(e) => {
                error!(name = %def.name, error = %e, "duplicate-suppression query failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::functions::FunctionRegistry;
    use crate::hooks::HookRegistry;
    use chrono::TimeZone;
    use serde_json::json;
    use taskmill_storage::{InMemoryTaskStore, TaskState, TaskStore};

    fn minute(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn five_field_expression_matches_exact_minute() {
        assert!(cron_matches("0 3 * * *", minute(3, 0)).unwrap());
        assert!(!cron_matches("0 3 * * *", minute(3, 1)).unwrap());
        assert!(!cron_matches("0 3 * * *", minute(4, 0)).unwrap());
    }

    #[test]
    fn step_expression_matches_on_boundaries() {
        assert!(cron_matches("*/5 * * * *", minute(10, 0)).unwrap());
        assert!(cron_matches("*/5 * * * *", minute(10, 5)).unwrap());
        assert!(!cron_matches("*/5 * * * *", minute(10, 7)).unwrap());
    }

    #[test]
    fn every_minute_matches_everywhere() {
        assert!(cron_matches("* * * * *", minute(23, 59)).unwrap());
    }

    #[test]
    fn malformed_expression_errors() {
        assert!(cron_matches("not a cron", minute(0, 0)).is_err());
    }

    #[test]
    fn truncate_drops_seconds() {
        let dt = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 42).unwrap();
        assert_eq!(truncate_to_minute(dt), minute(9, 30));
    }

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        scheduler: CronScheduler,
        registry: Arc<ScheduledTaskRegistry>,
    }

    fn fixture(config: QueueConfig) -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let tasks = QueuedTasks::new(
            store.clone() as Arc<dyn TaskStore>,
            Arc::new(HookRegistry::new()),
            Arc::new(FunctionRegistry::new()),
        );
        let registry = Arc::new(ScheduledTaskRegistry::new(&config));
        let (_tx, rx) = watch::channel(false);
        Fixture {
            store,
            scheduler: CronScheduler::new(Arc::clone(&registry), tasks, rx),
            registry,
        }
    }

    #[tokio::test]
    async fn tick_materializes_matching_tasks() {
        let fx = fixture(QueueConfig::default());
        fx.registry.register(
            ScheduledTaskDef::new("daily-rollup", "0 3 * * *", "jobs", "rollup")
                .context(serde_json::Map::from_iter([(
                    "_source".to_string(),
                    json!("cron"),
                )]))
                .auto_remove(false),
        );

        fx.scheduler.tick(minute(3, 0)).await;

        let due = fx.store.list_due_enqueued(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "daily-rollup");
        assert_eq!(due[0].context["_source"], json!("cron"));
        assert!(!due[0].auto_remove);

        fx.scheduler.tick(minute(4, 0)).await;
        assert_eq!(fx.store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_suppression_spans_active_states() {
        let fx = fixture(QueueConfig::default());
        fx.registry
            .register(ScheduledTaskDef::new("daily-rollup", "0 3 * * *", "jobs", "rollup"));

        fx.scheduler.tick(minute(3, 0)).await;
        let first = &fx.store.list_due_enqueued(Utc::now()).await.unwrap()[0];
        fx.store.mark_doing(first.id).await.unwrap();

        // Same minute fires again (e.g. a second manager): no new row.
        fx.scheduler.tick(minute(3, 0)).await;
        let counts = fx.store.counts_by_state().await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.doing, 1);

        // Once the previous run finished, the next match fires again.
        fx.store.mark_done(first.id).await.unwrap();
        fx.scheduler.tick(minute(3, 0)).await;
        let counts = fx.store.counts_by_state().await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.enqueued, 1);
    }

    #[tokio::test]
    async fn disabled_definitions_do_not_fire() {
        let config = QueueConfig::default()
            .with_disabled_scheduled_tasks(vec!["daily-rollup".to_string()]);
        let fx = fixture(config);
        fx.registry
            .register(ScheduledTaskDef::new("daily-rollup", "0 3 * * *", "jobs", "rollup"));

        fx.scheduler.tick(minute(3, 0)).await;
        assert_eq!(fx.store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn materialized_tasks_run_like_any_other() {
        let fx = fixture(QueueConfig::default());
        fx.registry
            .register(ScheduledTaskDef::new("tick", "* * * * *", "jobs", "tick"));

        fx.scheduler.tick(minute(12, 30)).await;
        let task = &fx.store.list_due_enqueued(Utc::now()).await.unwrap()[0];
        assert_eq!(task.state, TaskState::Enqueued);
        assert_eq!(task.module_name.as_deref(), Some("jobs"));
        assert_eq!(task.function_name.as_deref(), Some("tick"));
        assert!(task.auto_remove);
    }
}
