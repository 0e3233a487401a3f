//! Core domain models for delegation runs.
//!
//! This module contains the task data model, the dependency graph that
//! drives scheduling, and the output summarizer.

pub mod dag;
pub mod summary;
pub mod task;

pub use dag::DependencyGraph;
pub use summary::{summarize, DEFAULT_SUMMARY_LIMIT};
pub use task::{display_name, TaskKey, TaskNode, TaskOutput, TaskStatus};
