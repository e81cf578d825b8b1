//! Task bodies and task records

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::queue::TaskFactory;
use crate::error::Result;
use crate::models::{ProxyAddress, Record};
use crate::proxy::HttpSession;
use crate::sink::RecordSink;

/// Identity of a task, unique within one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a successful execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The body did its work
    Completed,
    /// The body found nothing to do and produced no records
    Skipped,
}

/// Everything a task body can touch while it runs
pub struct TaskContext<'a> {
    pub task_id: TaskId,
    pub session: &'a HttpSession,
    pub proxy: &'a ProxyAddress,
    pub factory: &'a TaskFactory,
    pub sink: &'a dyn RecordSink,
}

impl TaskContext<'_> {
    /// Enqueue a child task with the default attempt budget
    pub fn spawn<T: TaskBody + 'static>(&self, body: T) -> TaskId {
        self.factory.spawn(body)
    }

    /// Hand a record to the sink
    pub fn emit(&self, record: impl Into<Record>) {
        self.sink.accept(record.into());
    }
}

/// Executable unit of work.
///
/// A body may spawn children through the context, emit records, or fail. Failures
/// are classified by the scheduler; bodies never decide about retries themselves.
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<TaskOutcome>;

    /// Short human-readable identity for logs
    fn describe(&self) -> String {
        "task".to_string()
    }
}

/// A queued unit of work and its remaining attempt budget
pub struct TaskRecord {
    pub id: TaskId,
    pub body: Arc<dyn TaskBody>,
    /// Fractional: transport failures consume less budget than logic failures
    pub attempts_remaining: f64,
    /// Executions started so far
    pub attempts: u32,
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("body", &self.body.describe())
            .field("attempts_remaining", &self.attempts_remaining)
            .field("attempts", &self.attempts)
            .finish()
    }
}
