//! Task execution engine
//!
//! This module provides:
//! - Task bodies, records and the factory used to spawn children
//! - The shared randomized task queue with its in-flight cap
//! - Failure classification
//! - The scheduler and its worker pool

pub mod classifier;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use classifier::{DefaultClassifier, ErrorClassifier, FailureClass};
pub use queue::{Extraction, QueueStats, RequeueOutcome, TaskFactory, TaskLease, TaskQueue};
pub use scheduler::{EngineHandle, RunReport, Scheduler, SchedulerConfig};
pub use task::{TaskBody, TaskContext, TaskId, TaskOutcome, TaskRecord};
