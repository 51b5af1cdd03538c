use crate::options::Priority;
use crate::task::{TaskId, TaskStatus};
use thiserror::Error;

/// Contract violations and bookkeeping failures raised by the scheduler itself.
///
/// None of these are retried. Usage errors come back from the call that caused
/// them; bookkeeping errors and unobserved callback failures come back from the
/// flush that ran into them.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cannot run task {id} in {status} state")]
    InvalidState { id: TaskId, status: TaskStatus },

    #[error("a preempting task cannot be delayed (delay = {delay}ms)")]
    PreemptWithDelay { delay: f64 },

    #[error("a preempting task cannot be persistent")]
    PreemptWithPersistent,

    #[error("task delay must be a finite, non-negative number of milliseconds (got {0})")]
    InvalidDelay(f64),

    #[error("awaiting task {0} from within its own callback would deadlock")]
    ResultDeadlock(TaskId),

    #[error("task {0} could not be found in its queue")]
    TaskNotFound(TaskId),

    #[error("async task completion mismatch: suspender is {expected:?}, completing task is {actual}")]
    SuspenderMismatch {
        expected: Option<TaskId>,
        actual: TaskId,
    },

    #[error("no flush requestor configured for the {0} lane")]
    MissingFlushRequestor(Priority),

    #[error("task {id} failed and nobody requested its result")]
    Unobserved {
        id: TaskId,
        #[source]
        source: TaskError,
    },
}

/// What a task's result future settles with when it does not produce a value.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task was canceled before it ran.
    #[error("task {id} on the {priority} lane was canceled")]
    Aborted { id: TaskId, priority: Priority },

    /// The callback (or the future it returned) failed.
    #[error(transparent)]
    Failed(anyhow::Error),

    #[error("task {0} returned a future but is configured as synchronous")]
    UnexpectedAsync(TaskId),

    #[error("result of task {0} was already taken")]
    ResultTaken(TaskId),

    /// The failure was raised by the flush because nobody was observing the task.
    #[error("task {0} failed before its result was requested")]
    Surfaced(TaskId),
}

impl TaskError {
    pub fn is_abort(&self) -> bool {
        matches!(self, TaskError::Aborted { .. })
    }
}
