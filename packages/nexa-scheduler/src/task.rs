use crate::error::{SchedulerError, TaskError};
use crate::options::{AsyncMode, Priority, QueueTaskOptions};
use crate::queue::{TaskQueue, WeakTaskQueue};
use crate::trace::TaskEvent;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde::Serialize;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide, monotonically increasing task identity. Only used for
/// diagnostics and equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Canceled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Canceled => "canceled",
        })
    }
}

/// What a task callback hands back to the queue.
pub enum TaskStep<T> {
    Ready(Result<T, anyhow::Error>),
    Pending(LocalBoxFuture<'static, Result<T, anyhow::Error>>),
}

impl<T> TaskStep<T> {
    pub fn ready(value: T) -> Self {
        TaskStep::Ready(Ok(value))
    }

    pub fn fail(err: impl Into<anyhow::Error>) -> Self {
        TaskStep::Ready(Err(err.into()))
    }

    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, anyhow::Error>> + 'static,
    {
        TaskStep::Pending(future.boxed_local())
    }

    pub fn is_future(&self) -> bool {
        matches!(self, TaskStep::Pending(_))
    }
}

impl TaskStep<()> {
    pub fn done() -> Self {
        TaskStep::Ready(Ok(()))
    }
}

impl<T> From<Result<T, anyhow::Error>> for TaskStep<T> {
    fn from(result: Result<T, anyhow::Error>) -> Self {
        TaskStep::Ready(result)
    }
}

impl<T> fmt::Debug for TaskStep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStep::Ready(Ok(_)) => f.write_str("TaskStep::Ready(Ok)"),
            TaskStep::Ready(Err(err)) => write!(f, "TaskStep::Ready(Err({err}))"),
            TaskStep::Pending(_) => f.write_str("TaskStep::Pending"),
        }
    }
}

/// The type-erased callback a queue stores. Typed values are delivered into
/// the task's result slot by the closure itself.
pub(crate) type TaskCallback = Box<dyn FnMut(f64) -> TaskStep<()>>;

/// The typed result slot as seen from the erased task core.
pub(crate) trait ResultSink {
    /// Whether anyone asked for the result.
    fn observed(&self) -> bool;
    fn settle_err(&self, err: TaskError);
    /// Record the final status of this incarnation.
    fn close(&self, status: TaskStatus);
}

pub(crate) struct Slot<T> {
    outcome: RefCell<Option<Result<T, TaskError>>>,
    settled: Cell<bool>,
    observed: Cell<bool>,
    closed: Cell<Option<TaskStatus>>,
    wakers: RefCell<SmallVec<[Waker; 2]>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            outcome: RefCell::new(None),
            settled: Cell::new(false),
            observed: Cell::new(false),
            closed: Cell::new(None),
            wakers: RefCell::new(SmallVec::new()),
        }
    }

    /// First settle since the slot was last armed wins.
    fn settle(&self, outcome: Result<T, TaskError>) {
        if self.settled.replace(true) {
            return;
        }
        *self.outcome.borrow_mut() = Some(outcome);
        self.wake();
    }

    /// Mark the result as requested. A value left over from an earlier run of
    /// a persistent task is dropped so the request waits for the next run.
    fn arm(&self) {
        self.observed.set(true);
        if self.settled.replace(false) {
            self.outcome.borrow_mut().take();
        }
    }

    fn wake(&self) {
        let wakers = std::mem::take(&mut *self.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> ResultSink for Slot<T> {
    fn observed(&self) -> bool {
        self.observed.get()
    }

    fn settle_err(&self, err: TaskError) {
        self.settle(Err(err));
    }

    fn close(&self, status: TaskStatus) {
        self.closed.set(Some(status));
        self.wake();
    }
}

/// Wrap a typed callback into the erased form and create its result slot.
pub(crate) fn prepare<T, F>(
    mut callback: F,
    async_mode: AsyncMode,
) -> (TaskCallback, Rc<dyn ResultSink>, Rc<Slot<T>>)
where
    T: 'static,
    F: FnMut(f64) -> TaskStep<T> + 'static,
{
    let slot = Rc::new(Slot::new());
    let delivery = slot.clone();
    let erased: TaskCallback = Box::new(move |elapsed| {
        let step = match (callback(elapsed), async_mode) {
            (TaskStep::Ready(outcome), AsyncMode::Always) => {
                TaskStep::future(futures::future::ready(outcome))
            }
            (step, _) => step,
        };
        match step {
            TaskStep::Ready(Ok(value)) => {
                delivery.settle(Ok(value));
                TaskStep::done()
            }
            TaskStep::Ready(Err(err)) => TaskStep::Ready(Err(err)),
            TaskStep::Pending(future) => {
                let delivery = delivery.clone();
                TaskStep::future(async move {
                    let value = future.await?;
                    delivery.settle(Ok(value));
                    Ok::<(), anyhow::Error>(())
                })
            }
        }
    });
    let sink: Rc<dyn ResultSink> = slot.clone();
    (erased, sink, slot)
}

struct TaskState {
    status: TaskStatus,
    created_time: f64,
    queue_time: f64,
    delay: f64,
    preempt: bool,
    persistent: bool,
    reusable: bool,
    suspend: bool,
    async_mode: AsyncMode,
    callback: Option<TaskCallback>,
    sink: Option<Rc<dyn ResultSink>>,
}

impl TaskState {
    fn new(
        now: f64,
        options: &QueueTaskOptions,
        callback: TaskCallback,
        sink: Rc<dyn ResultSink>,
    ) -> Self {
        Self {
            status: TaskStatus::Pending,
            created_time: now,
            queue_time: now + options.delay,
            delay: options.delay,
            preempt: options.preempt,
            persistent: options.persistent,
            reusable: options.reusable,
            suspend: options.suspend,
            async_mode: options.async_mode,
            callback: Some(callback),
            sink: Some(sink),
        }
    }
}

/// The erased, poolable part of a task. Owned by exactly one queue.
pub(crate) struct TaskCore {
    id: Cell<TaskId>,
    priority: Priority,
    queue: WeakTaskQueue,
    state: RefCell<TaskState>,
}

impl TaskCore {
    pub(crate) fn new(
        queue: WeakTaskQueue,
        priority: Priority,
        now: f64,
        options: &QueueTaskOptions,
        callback: TaskCallback,
        sink: Rc<dyn ResultSink>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: Cell::new(TaskId::next()),
            priority,
            queue,
            state: RefCell::new(TaskState::new(now, options, callback, sink)),
        })
    }

    /// Recycle a pooled task with new parameters. Handles to the previous
    /// incarnation go stale because the id changes.
    pub(crate) fn reuse(
        &self,
        now: f64,
        options: &QueueTaskOptions,
        callback: TaskCallback,
        sink: Rc<dyn ResultSink>,
    ) {
        self.id.set(TaskId::next());
        *self.state.borrow_mut() = TaskState::new(now, options, callback, sink);
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id.get()
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.state.borrow().status
    }

    pub(crate) fn created_time(&self) -> f64 {
        self.state.borrow().created_time
    }

    pub(crate) fn queue_time(&self) -> f64 {
        self.state.borrow().queue_time
    }

    pub(crate) fn delay(&self) -> f64 {
        self.state.borrow().delay
    }

    pub(crate) fn is_preempt(&self) -> bool {
        self.state.borrow().preempt
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.state.borrow().persistent
    }

    pub(crate) fn suspends(&self) -> bool {
        self.state.borrow().suspend
    }

    pub(crate) fn event(&self, time: f64) -> TaskEvent {
        let state = self.state.borrow();
        TaskEvent {
            id: self.id(),
            priority: self.priority,
            created_time: state.created_time,
            queue_time: state.queue_time,
            persistent: state.persistent,
            time,
        }
    }

    /// Re-timestamp for the next cycle of a persistent task, keeping its delay.
    pub(crate) fn reset(&self, now: f64) {
        let mut state = self.state.borrow_mut();
        state.created_time = now;
        state.queue_time = now + state.delay;
        state.status = TaskStatus::Pending;
    }

    fn dispose(&self, status: TaskStatus) -> Option<Rc<dyn ResultSink>> {
        let (callback, sink) = {
            let mut state = self.state.borrow_mut();
            state.status = status;
            (state.callback.take(), state.sink.take())
        };
        drop(callback);
        sink
    }

    pub(crate) fn run(self: &Rc<Self>, time: f64) -> Result<(), SchedulerError> {
        let (mut callback, elapsed, async_mode, persistent) = {
            let mut state = self.state.borrow_mut();
            if state.status != TaskStatus::Pending {
                return Err(SchedulerError::InvalidState {
                    id: self.id(),
                    status: state.status,
                });
            }
            let Some(callback) = state.callback.take() else {
                return Err(SchedulerError::InvalidState {
                    id: self.id(),
                    status: state.status,
                });
            };
            state.status = TaskStatus::Running;
            (
                callback,
                time - state.created_time,
                state.async_mode,
                state.persistent,
            )
        };

        let queue = self.queue.upgrade();
        if let Some(queue) = &queue {
            queue.tracer().on_run(&self.event(time));
        }
        tracing::trace!(task = %self.id(), lane = %self.priority, elapsed, "running task");

        let step = callback(elapsed);
        self.state.borrow_mut().callback = Some(callback);

        match step {
            TaskStep::Ready(outcome) => {
                self.finish(outcome.map_err(TaskError::Failed), persistent, false)
            }
            TaskStep::Pending(_) if async_mode == AsyncMode::Never => {
                self.finish(Err(TaskError::UnexpectedAsync(self.id())), persistent, false)
            }
            TaskStep::Pending(future) => match queue {
                Some(queue) => {
                    queue.track_async(self.clone(), future, persistent);
                    Ok(())
                }
                None => {
                    if let Some(sink) = self.dispose(TaskStatus::Canceled) {
                        sink.close(TaskStatus::Canceled);
                    }
                    Ok(())
                }
            },
        }
    }

    /// Bookkeeping once a run has settled, synchronously or through the
    /// queue's async continuation.
    pub(crate) fn finish(
        self: &Rc<Self>,
        outcome: Result<(), TaskError>,
        persistent_at_start: bool,
        was_async: bool,
    ) -> Result<(), SchedulerError> {
        let queue = self.queue.upgrade();
        let time = queue.as_ref().map_or(0.0, |queue| queue.now());
        let reusable = self.state.borrow().reusable;

        let (recurring, surfaced) = match outcome {
            Ok(()) => (self.conclude(queue.as_ref(), persistent_at_start, time), None),
            Err(err) => (false, self.fail(queue.as_ref(), err, time)),
        };

        if was_async {
            if let Some(queue) = &queue {
                queue.complete_async_task(self)?;
            }
        }
        if !recurring && reusable {
            if let Some(queue) = &queue {
                queue.return_to_pool(self.clone());
            }
        }
        surfaced.map_or(Ok(()), Err)
    }

    /// Returns whether the task was re-queued for another cycle.
    fn conclude(
        self: &Rc<Self>,
        queue: Option<&TaskQueue>,
        persistent_at_start: bool,
        time: f64,
    ) -> bool {
        let event = self.event(time);
        if self.is_persistent() {
            if let Some(queue) = queue {
                queue.reset_persistent_task(self);
                queue
                    .tracer()
                    .on_settled(&event, TaskStatus::Pending, false);
                return true;
            }
        }

        // Persistence revoked mid-run counts as a cancel.
        let status = if persistent_at_start {
            TaskStatus::Canceled
        } else {
            TaskStatus::Completed
        };
        if let Some(sink) = self.dispose(status) {
            sink.close(status);
        }
        if let Some(queue) = queue {
            queue.tracer().on_settled(&event, status, false);
        }
        tracing::trace!(task = %self.id(), %status, "task settled");
        false
    }

    /// A failed run ends the task. Returns the error the flush has to raise
    /// when nobody is observing the result.
    fn fail(&self, queue: Option<&TaskQueue>, err: TaskError, time: f64) -> Option<SchedulerError> {
        let event = self.event(time);
        self.state.borrow_mut().persistent = false;
        let sink = self.dispose(TaskStatus::Completed);
        if let Some(queue) = queue {
            queue.tracer().on_settled(&event, TaskStatus::Completed, true);
        }
        tracing::debug!(task = %self.id(), lane = %self.priority, error = %err, "task failed");

        let id = self.id();
        match sink {
            Some(sink) if sink.observed() => {
                sink.settle_err(err);
                sink.close(TaskStatus::Completed);
                None
            }
            Some(sink) => {
                sink.settle_err(TaskError::Surfaced(id));
                sink.close(TaskStatus::Completed);
                Some(SchedulerError::Unobserved { id, source: err })
            }
            None => Some(SchedulerError::Unobserved { id, source: err }),
        }
    }

    pub(crate) fn cancel(self: &Rc<Self>) -> Result<bool, SchedulerError> {
        let (status, persistent, reusable) = {
            let state = self.state.borrow();
            (state.status, state.persistent, state.reusable)
        };
        match status {
            TaskStatus::Pending => {
                let queue = self.queue.upgrade();
                if let Some(queue) = &queue {
                    queue.remove(self)?;
                    queue.resolve_yield_if_idle();
                    if queue.is_empty() {
                        queue.cancel();
                    }
                    queue.tracer().on_canceled(&self.event(queue.now()));
                }
                tracing::trace!(task = %self.id(), lane = %self.priority, "task canceled");

                if let Some(sink) = self.dispose(TaskStatus::Canceled) {
                    sink.settle_err(TaskError::Aborted {
                        id: self.id(),
                        priority: self.priority,
                    });
                    sink.close(TaskStatus::Canceled);
                }
                if reusable {
                    if let Some(queue) = &queue {
                        queue.return_to_pool(self.clone());
                    }
                }
                Ok(true)
            }
            TaskStatus::Running if persistent => {
                self.state.borrow_mut().persistent = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Handle to a queued task.
///
/// The underlying task object may be recycled through its queue's pool once
/// it is done. A handle only ever speaks for the incarnation it was created
/// for: after recycling it reports that incarnation's final status and
/// `cancel` returns `false`.
pub struct Task<T> {
    core: Rc<TaskCore>,
    id: TaskId,
    slot: Rc<Slot<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            id: self.id,
            slot: self.slot.clone(),
        }
    }
}

impl<T> PartialEq for Task<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.core.priority)
            .field("status", &self.status())
            .finish()
    }
}

impl<T> Task<T> {
    pub(crate) fn new(core: Rc<TaskCore>, slot: Rc<Slot<T>>) -> Self {
        let id = core.id();
        Self { core, id, slot }
    }

    fn is_current(&self) -> bool {
        self.core.id() == self.id
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.core.priority
    }

    pub fn status(&self) -> TaskStatus {
        if self.is_current() {
            self.core.status()
        } else {
            self.slot.closed.get().unwrap_or(TaskStatus::Completed)
        }
    }

    /// Time the task was queued, or re-queued for its current cycle.
    /// Only meaningful while the task is pending or running.
    pub fn created_time(&self) -> f64 {
        self.core.created_time()
    }

    /// Earliest time at which the task may run.
    /// Only meaningful while the task is pending or running.
    pub fn queue_time(&self) -> f64 {
        self.core.queue_time()
    }

    pub fn is_persistent(&self) -> bool {
        self.is_current() && self.core.is_persistent()
    }

    /// Run the task right now, outside of a flush. Fails unless it is pending.
    ///
    /// The task leaves its queue first so that the next flush does not pick
    /// it up again.
    pub fn run(&self) -> Result<(), SchedulerError> {
        let status = self.status();
        if !self.is_current() || status != TaskStatus::Pending {
            return Err(SchedulerError::InvalidState {
                id: self.id,
                status,
            });
        }
        let queue = self.core.queue.upgrade();
        let time = match &queue {
            Some(queue) => {
                queue.remove(&self.core)?;
                queue.now()
            }
            None => self.core.created_time(),
        };
        let ran = self.core.run(time);
        if let Some(queue) = &queue {
            queue.resolve_yield_if_idle();
        }
        ran
    }

    /// Cancel a pending task, or stop a running persistent one from recurring.
    /// Returns `Ok(false)` when there was nothing to cancel.
    pub fn cancel(&self) -> Result<bool, SchedulerError> {
        if !self.is_current() {
            return Ok(false);
        }
        self.core.cancel()
    }

    /// The task's result.
    ///
    /// For a persistent task every request waits for the next run. Awaiting
    /// the result from inside the task's own callback is refused.
    pub fn result(&self) -> Result<TaskResult<T>, SchedulerError> {
        match self.status() {
            TaskStatus::Running => Err(SchedulerError::ResultDeadlock(self.id)),
            TaskStatus::Pending => {
                self.slot.arm();
                Ok(TaskResult::new(self.id, self.priority(), self.slot.clone()))
            }
            TaskStatus::Completed | TaskStatus::Canceled => {
                self.slot.observed.set(true);
                Ok(TaskResult::new(self.id, self.priority(), self.slot.clone()))
            }
        }
    }
}

/// Future resolving with a task's outcome. Single consumer: once the value
/// has been taken, further results settle with [`TaskError::ResultTaken`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct TaskResult<T> {
    id: TaskId,
    priority: Priority,
    slot: Rc<Slot<T>>,
}

impl<T> TaskResult<T> {
    fn new(id: TaskId, priority: Priority, slot: Rc<Slot<T>>) -> Self {
        Self { id, priority, slot }
    }

    pub fn task_id(&self) -> TaskId {
        self.id
    }
}

impl<T> Future for TaskResult<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let slot = &this.slot;
        if let Some(outcome) = slot.outcome.borrow_mut().take() {
            return Poll::Ready(outcome);
        }
        if slot.settled.get() {
            return Poll::Ready(Err(TaskError::ResultTaken(this.id)));
        }
        match slot.closed.get() {
            // The queue went away under a running task.
            Some(TaskStatus::Canceled) => {
                return Poll::Ready(Err(TaskError::Aborted {
                    id: this.id,
                    priority: this.priority,
                }));
            }
            Some(_) => return Poll::Ready(Err(TaskError::ResultTaken(this.id))),
            None => {}
        }
        let mut wakers = slot.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_increase() {
        let first = TaskId::next();
        let second = TaskId::next();
        assert!(second > first);
        assert_eq!(format!("{first}"), format!("#{}", first.as_u64()));
    }

    #[test]
    fn steps_report_their_shape() {
        assert!(!TaskStep::done().is_future());
        assert!(TaskStep::future(async { Ok::<_, anyhow::Error>(1) }).is_future());
        let failed: TaskStep<u8> = Err(anyhow::anyhow!("nope")).into();
        assert_eq!(format!("{failed:?}"), "TaskStep::Ready(Err(nope))");
    }

    #[test]
    fn always_mode_defers_ready_values() {
        let (mut callback, _sink, slot) = prepare(|_| TaskStep::ready(7u8), AsyncMode::Always);
        assert!(callback(0.0).is_future());
        assert!(slot.outcome.borrow().is_none());

        let (mut callback, _sink, slot) = prepare(|_| TaskStep::ready(7u8), AsyncMode::Auto);
        assert!(!callback(0.0).is_future());
        assert!(matches!(*slot.outcome.borrow(), Some(Ok(7))));
    }
}
