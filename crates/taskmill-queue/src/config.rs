//! Queue configuration
//!
//! Read from `QUEUED_TASK_*` environment variables with the documented
//! defaults; every knob also has a `with_*` builder for tests.

use std::time::Duration;

/// Runtime configuration for the queue system.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Worker pool capacity per process.
    pub max_workers: usize,

    /// Seconds a worker may idle before the pool removes it.
    pub worker_idle_timeout: Duration,

    /// Listener tick: how often the notification loop scans even without a
    /// notification.
    pub polling_interval: Duration,

    /// Fallback poll interval, guaranteeing progress if notifications are
    /// lost.
    pub fallback_polling_interval: Duration,

    /// Declared per-task timeout. Not enforced by the runtime loop; user
    /// code may consult it.
    pub task_timeout: Duration,

    /// Declared retry budget, available to user code.
    pub max_retries: u32,

    /// When false, the notification listener is disabled and only the
    /// fallback poll drives the queue.
    pub use_postgresql_notify: bool,

    /// Notification channel name.
    pub notify_channel: String,

    /// Scheduled-task enablement lists; see the registry for precedence.
    pub enabled_scheduled_tasks: Vec<String>,
    pub disabled_scheduled_tasks: Vec<String>,

    /// Server name for worker records; defaults to the hostname.
    pub server_name: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_idle_timeout: Duration::from_secs(60),
            polling_interval: Duration::from_secs(2),
            fallback_polling_interval: Duration::from_secs(30),
            task_timeout: Duration::from_secs(300),
            max_retries: 3,
            use_postgresql_notify: true,
            notify_channel: "queue_new_task".to_string(),
            enabled_scheduled_tasks: vec![],
            disabled_scheduled_tasks: vec![],
            server_name: None,
        }
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl QueueConfig {
    /// Build a configuration from `QUEUED_TASK_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_u64("QUEUED_TASK_MAX_WORKERS") {
            config.max_workers = (n as usize).max(1);
        }
        if let Some(n) = env_u64("QUEUED_TASK_WORKER_IDLE_TIMEOUT") {
            config.worker_idle_timeout = Duration::from_secs(n);
        }
        if let Some(n) = env_u64("QUEUED_TASK_POLLING_INTERVAL") {
            config.polling_interval = Duration::from_secs(n);
        }
        if let Some(n) = env_u64("QUEUED_TASK_FALLBACK_POLLING_INTERVAL") {
            config.fallback_polling_interval = Duration::from_secs(n);
        }
        if let Some(n) = env_u64("QUEUED_TASK_TIMEOUT") {
            config.task_timeout = Duration::from_secs(n);
        }
        if let Some(n) = env_u64("QUEUED_TASK_MAX_RETRIES") {
            config.max_retries = n as u32;
        }
        if let Ok(v) = std::env::var("QUEUED_TASK_USE_POSTGRESQL_NOTIFY") {
            config.use_postgresql_notify = v.trim().eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("QUEUED_TASK_NOTIFY_CHANNEL") {
            if !v.trim().is_empty() {
                config.notify_channel = v.trim().to_string();
            }
        }
        config.enabled_scheduled_tasks = env_list("QUEUED_TASK_ENABLED_SCHEDULED_TASKS");
        config.disabled_scheduled_tasks = env_list("QUEUED_TASK_DISABLED_SCHEDULED_TASKS");
        if let Ok(v) = std::env::var("QUEUED_TASK_SERVER_NAME") {
            if !v.trim().is_empty() {
                config.server_name = Some(v.trim().to_string());
            }
        }

        config
    }

    /// Resolve the server name: explicit config, then hostname, then a
    /// fixed fallback.
    pub fn resolved_server_name(&self) -> String {
        if let Some(name) = &self.server_name {
            return name.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-server".to_string())
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    pub fn with_worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.worker_idle_timeout = timeout;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_fallback_polling_interval(mut self, interval: Duration) -> Self {
        self.fallback_polling_interval = interval;
        self
    }

    pub fn with_notify_channel(mut self, channel: impl Into<String>) -> Self {
        self.notify_channel = channel.into();
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_postgresql_notify(mut self, enabled: bool) -> Self {
        self.use_postgresql_notify = enabled;
        self
    }

    pub fn with_enabled_scheduled_tasks(mut self, names: Vec<String>) -> Self {
        self.enabled_scheduled_tasks = names;
        self
    }

    pub fn with_disabled_scheduled_tasks(mut self, names: Vec<String>) -> Self {
        self.disabled_scheduled_tasks = names;
        self
    }
}
