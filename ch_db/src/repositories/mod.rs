//! ABOUTME: Repository modules for all persisted entities
//! ABOUTME: One repository per table, constructed over a shared pool

pub mod cronjobs;
pub mod task_logs;
pub mod tasks;
pub mod workers;
pub mod workflow_executes;
pub mod workflows;
