//! I/O helpers for the orchestration pipeline.

pub mod config;
pub mod evidence;
pub mod executor;
pub mod process;
pub mod prompt;
pub mod session_store;
pub mod sleep;
pub mod task_log;
