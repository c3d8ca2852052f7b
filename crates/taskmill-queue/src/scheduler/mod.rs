//! Cron scheduling and delayed task execution

pub mod cron;
pub mod registry;
pub mod service;

pub use cron::{cron_matches, CronScheduler};
pub use registry::{ScheduledTaskDef, ScheduledTaskRegistry};
pub use service::{RunAt, Scheduler};
