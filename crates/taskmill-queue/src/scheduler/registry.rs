//! Scheduled-task registry
//!
//! In-process table of cron-bound task definitions keyed by name.
//! Enablement resolves against the configured enabled/disabled lists,
//! highest priority first:
//!
//! 1. Name in the disabled list -> disabled
//! 2. Name in the enabled list -> enabled
//! 3. `all` or `*` in the disabled list -> disabled
//! 4. The definition's own `enabled` flag

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::QueueConfig;

/// Definition of a cron-scheduled task.
#[derive(Debug, Clone)]
pub struct ScheduledTaskDef {
    pub name: String,
    /// 5-field cron expression.
    pub cron: String,
    pub module_name: String,
    pub function_name: String,
    pub description: String,
    /// Default execution context for materialized tasks.
    pub context: Map<String, Value>,
    pub auto_remove: bool,
    pub enabled: bool,
}

impl ScheduledTaskDef {
    pub fn new(
        name: impl Into<String>,
        cron: impl Into<String>,
        module_name: impl Into<String>,
        function_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            module_name: module_name.into(),
            function_name: function_name.into(),
            description: String::new(),
            context: Map::new(),
            auto_remove: true,
            enabled: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn function_path(&self) -> String {
        format!("{}.{}", self.module_name, self.function_name)
    }
}

/// Registry of scheduled-task definitions.
pub struct ScheduledTaskRegistry {
    tasks: RwLock<HashMap<String, ScheduledTaskDef>>,
    enabled_list: Vec<String>,
    disabled_list: Vec<String>,
}

impl ScheduledTaskRegistry {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            enabled_list: config.enabled_scheduled_tasks.clone(),
            disabled_list: config.disabled_scheduled_tasks.clone(),
        }
    }

    pub fn register(&self, def: ScheduledTaskDef) {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&def.name) {
            warn!(name = %def.name, "scheduled task already registered, overwriting");
        }
        debug!(
            name = %def.name,
            cron = %def.cron,
            function = %def.function_path(),
            "registered scheduled task"
        );
        tasks.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<ScheduledTaskDef> {
        self.tasks.read().get(name).cloned()
    }

    /// All definitions, ordered by name for stable iteration.
    pub fn all(&self) -> Vec<ScheduledTaskDef> {
        let mut defs: Vec<ScheduledTaskDef> = self.tasks.read().values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Resolve whether the named task is enabled right now.
    pub fn is_enabled(&self, name: &str) -> bool {
        let Some(def) = self.get(name) else {
            return false;
        };

        if self.disabled_list.iter().any(|n| n == name) {
            return false;
        }
        if self.enabled_list.iter().any(|n| n == name) {
            return true;
        }
        if self.disabled_list.iter().any(|n| n == "all" || n == "*") {
            return false;
        }
        def.enabled
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(enabled: Vec<&str>, disabled: Vec<&str>) -> ScheduledTaskRegistry {
        let config = QueueConfig::default()
            .with_enabled_scheduled_tasks(enabled.into_iter().map(String::from).collect())
            .with_disabled_scheduled_tasks(disabled.into_iter().map(String::from).collect());
        ScheduledTaskRegistry::new(&config)
    }

    #[test]
    fn register_and_lookup() {
        let registry = registry_with(vec![], vec![]);
        registry.register(ScheduledTaskDef::new("rollup", "0 3 * * *", "jobs", "rollup"));

        assert!(registry.contains("rollup"));
        assert_eq!(registry.len(), 1);
        let def = registry.get("rollup").unwrap();
        assert_eq!(def.function_path(), "jobs.rollup");
        assert!(def.auto_remove);
    }

    #[test]
    fn unknown_task_is_disabled() {
        let registry = registry_with(vec![], vec![]);
        assert!(!registry.is_enabled("ghost"));
    }

    #[test]
    fn decorator_flag_is_the_fallback() {
        let registry = registry_with(vec![], vec![]);
        registry.register(ScheduledTaskDef::new("on", "* * * * *", "m", "f"));
        registry.register(ScheduledTaskDef::new("off", "* * * * *", "m", "g").enabled(false));

        assert!(registry.is_enabled("on"));
        assert!(!registry.is_enabled("off"));
    }

    #[test]
    fn explicit_disable_beats_explicit_enable() {
        let registry = registry_with(vec!["job"], vec!["job"]);
        registry.register(ScheduledTaskDef::new("job", "* * * * *", "m", "f"));
        assert!(!registry.is_enabled("job"));
    }

    #[test]
    fn explicit_enable_beats_disable_all() {
        let registry = registry_with(vec!["job"], vec!["all"]);
        registry.register(ScheduledTaskDef::new("job", "* * * * *", "m", "f"));
        registry.register(ScheduledTaskDef::new("other", "* * * * *", "m", "g"));

        assert!(registry.is_enabled("job"));
        assert!(!registry.is_enabled("other"));
    }

    #[test]
    fn star_in_disabled_list_disables_everything_else() {
        let registry = registry_with(vec![], vec!["*"]);
        registry.register(ScheduledTaskDef::new("job", "* * * * *", "m", "f"));
        assert!(!registry.is_enabled("job"));
    }

    #[test]
    fn all_sorted_by_name() {
        let registry = registry_with(vec![], vec![]);
        registry.register(ScheduledTaskDef::new("zeta", "* * * * *", "m", "z"));
        registry.register(ScheduledTaskDef::new("alpha", "* * * * *", "m", "a"));

        let names: Vec<String> = registry.all().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
