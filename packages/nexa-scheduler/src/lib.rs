//! Cooperative, lane-partitioned task scheduling for the Nexa runtime.
//!
//! A [`Scheduler`] owns three [`TaskQueue`]s (render, macro-task and
//! post-render). Each queue runs its tasks when the host calls
//! [`TaskQueue::flush`], which it asks for through a [`FlushRequestor`].
//! Everything here is single-threaded: queues and tasks are `!Send` and must
//! stay on the thread that created them.

pub mod error;
pub mod options;
pub mod platform;
pub mod queue;
#[cfg(feature = "tokio")]
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod trace;

pub use error::{SchedulerError, TaskError};
pub use options::{AsyncMode, LaneConfig, Priority, QueueTaskOptions, SchedulerConfig, TickSource};
pub use platform::{Clock, FlushRequestor, FlushRequestorFactory, ManualClock, ManualFlush, MonotonicClock};
pub use queue::{TaskQueue, WeakTaskQueue, YieldFuture};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use task::{Task, TaskId, TaskResult, TaskStatus, TaskStep};
pub use trace::{FlushStats, NoopTracer, TaskEvent, Tracer};
