//! Core domain models for foreman.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tasks, tiers, judge configuration and the
//! ordered backlog.

pub mod backlog;
pub mod task;

pub use backlog::{Backlog, ProgressSnapshot};
pub use task::{JudgeConfig, Priority, Task, TaskId, TaskStatus, Tier};
