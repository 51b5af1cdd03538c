use crate::options::Priority;
use crate::task::{TaskId, TaskStatus};

/// Snapshot of a task at one of its transitions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskEvent {
    pub id: TaskId,
    pub priority: Priority,
    pub created_time: f64,
    pub queue_time: f64,
    pub persistent: bool,
    /// Clock time at which the transition happened.
    pub time: f64,
}

/// What one flush call got through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushStats {
    pub ran: usize,
    pub remaining: usize,
    pub pending_async: usize,
    pub suspended: bool,
}

/// Observer for task and flush transitions. Every hook defaults to a no-op.
pub trait Tracer {
    fn on_queued(&self, _event: &TaskEvent) {}

    fn on_run(&self, _event: &TaskEvent) {}

    /// A run finished. `failed` is set when the callback or its future errored.
    fn on_settled(&self, _event: &TaskEvent, _status: TaskStatus, _failed: bool) {}

    fn on_canceled(&self, _event: &TaskEvent) {}

    fn on_flush(&self, _priority: Priority, _time: f64, _stats: &FlushStats) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}
