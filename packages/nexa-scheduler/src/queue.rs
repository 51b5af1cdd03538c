use crate::error::{SchedulerError, TaskError};
use crate::options::{Priority, QueueTaskOptions};
use crate::platform::{Clock, FlushRequestor, FlushRequestorFactory};
use crate::task::{self, Task, TaskCore, TaskStatus, TaskStep};
use crate::trace::{FlushStats, NoopTracer, Tracer};
use futures::future::LocalBoxFuture;
use futures::task::{ArcWake, waker};
use slab::Slab;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

/// Set by the waker of an in-flight task future; the next flush polls it.
struct WakeFlag(AtomicBool);

impl WakeFlag {
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl ArcWake for WakeFlag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::Release);
    }
}

struct InFlight {
    task: Rc<TaskCore>,
    future: LocalBoxFuture<'static, Result<(), anyhow::Error>>,
    wake: Arc<WakeFlag>,
    persistent: bool,
}

#[derive(Default)]
struct YieldSignal {
    done: Cell<bool>,
    wakers: RefCell<SmallVec<[Waker; 2]>>,
}

impl YieldSignal {
    fn resolve(&self) {
        self.done.set(true);
        let wakers = std::mem::take(&mut *self.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Resolves once the queue has no more finite work. See [`TaskQueue::yield_now`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldFuture {
    signal: Option<Rc<YieldSignal>>,
}

impl Future for YieldFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let Some(signal) = &self.signal else {
            return Poll::Ready(());
        };
        if signal.done.get() {
            return Poll::Ready(());
        }
        let mut wakers = signal.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[derive(Default)]
struct QueueState {
    processing: VecDeque<Rc<TaskCore>>,
    pending: VecDeque<Rc<TaskCore>>,
    /// Ordered by queue time; equal times keep insertion order.
    delayed: VecDeque<Rc<TaskCore>>,
    flush_requested: bool,
    last_request: f64,
    last_flush: f64,
    suspender: Option<Rc<TaskCore>>,
    pending_async_count: usize,
    in_flight: Slab<InFlight>,
    yield_signal: Option<Rc<YieldSignal>>,
    pool: Vec<Rc<TaskCore>>,
}

impl QueueState {
    fn buckets(&self) -> impl Iterator<Item = &Rc<TaskCore>> {
        self.processing
            .iter()
            .chain(self.pending.iter())
            .chain(self.delayed.iter())
    }

    fn is_empty(&self) -> bool {
        self.processing.is_empty()
            && self.pending.is_empty()
            && self.delayed.is_empty()
            && self.pending_async_count == 0
            && self.suspender.is_none()
            && self.in_flight.is_empty()
    }

    /// Persistent tasks are infinite work and never hold up a yield.
    fn has_no_more_finite_work(&self) -> bool {
        self.pending_async_count == 0
            && self.suspender.is_none()
            && self.in_flight.is_empty()
            && self.buckets().all(|task| task.is_persistent())
    }

    fn has_work(&self) -> bool {
        !self.processing.is_empty()
            || !self.delayed.is_empty()
            || self.pending_async_count > 0
            || !self.in_flight.is_empty()
    }

    fn place(&mut self, task: Rc<TaskCore>) {
        if task.is_preempt() {
            self.processing.push_back(task);
        } else if task.delay() == 0.0 {
            self.pending.push_back(task);
        } else {
            let due = task.queue_time();
            let at = self.delayed.partition_point(|queued| queued.queue_time() <= due);
            self.delayed.insert(at, task);
        }
    }

    /// Move everything pending and every due delayed task into processing.
    fn absorb(&mut self, time: f64) {
        let pending = std::mem::take(&mut self.pending);
        self.processing.extend(pending);
        let due = self.delayed.partition_point(|task| task.queue_time() <= time);
        self.processing.extend(self.delayed.drain(..due));
    }
}

struct QueueInner {
    priority: Priority,
    clock: Rc<dyn Clock>,
    tracer: Rc<dyn Tracer>,
    max_pool_size: Option<usize>,
    requestor: RefCell<Option<Box<dyn FlushRequestor>>>,
    state: RefCell<QueueState>,
}

/// One priority lane's worth of tasks.
///
/// Cloning yields another handle to the same queue. Task callbacks may call
/// back into the queue (queue, cancel, yield) while it is flushing.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Rc<QueueInner>,
}

/// Non-owning handle, for flush requestors and tasks.
#[derive(Clone)]
pub struct WeakTaskQueue {
    inner: Weak<QueueInner>,
}

impl WeakTaskQueue {
    pub fn upgrade(&self) -> Option<TaskQueue> {
        self.inner.upgrade().map(|inner| TaskQueue { inner })
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("TaskQueue")
            .field("priority", &self.inner.priority)
            .field("processing", &state.processing.len())
            .field("pending", &state.pending.len())
            .field("delayed", &state.delayed.len())
            .field("pending_async", &state.pending_async_count)
            .field("suspended", &state.suspender.is_some())
            .field("flush_requested", &state.flush_requested)
            .finish()
    }
}

impl TaskQueue {
    pub fn new(
        priority: Priority,
        clock: Rc<dyn Clock>,
        requestors: &dyn FlushRequestorFactory,
    ) -> Self {
        Self::with_parts(priority, clock, Rc::new(NoopTracer), None, requestors)
    }

    pub(crate) fn with_parts(
        priority: Priority,
        clock: Rc<dyn Clock>,
        tracer: Rc<dyn Tracer>,
        max_pool_size: Option<usize>,
        requestors: &dyn FlushRequestorFactory,
    ) -> Self {
        let queue = TaskQueue {
            inner: Rc::new(QueueInner {
                priority,
                clock,
                tracer,
                max_pool_size,
                requestor: RefCell::new(None),
                state: RefCell::new(QueueState::default()),
            }),
        };
        let requestor = requestors.create(&queue);
        *queue.inner.requestor.borrow_mut() = Some(requestor);
        queue
    }

    pub fn downgrade(&self) -> WeakTaskQueue {
        WeakTaskQueue {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn now(&self) -> f64 {
        self.inner.clock.now()
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        &*self.inner.tracer
    }

    /// No queued tasks, nothing in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.state.borrow().is_empty()
    }

    /// Number of tasks waiting in the processing, pending and delayed buckets.
    pub fn len(&self) -> usize {
        let state = self.inner.state.borrow();
        state.processing.len() + state.pending.len() + state.delayed.len()
    }

    pub fn pending_async_count(&self) -> usize {
        self.inner.state.borrow().pending_async_count
    }

    pub fn flush_requested(&self) -> bool {
        self.inner.state.borrow().flush_requested
    }

    pub fn last_flush(&self) -> f64 {
        self.inner.state.borrow().last_flush
    }

    pub fn last_request(&self) -> f64 {
        self.inner.state.borrow().last_request
    }

    /// Whether a suspending task is blocking the lane.
    pub fn is_suspended(&self) -> bool {
        self.inner.state.borrow().suspender.is_some()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.state.borrow().pool.len()
    }

    /// Queue a callback on this lane. `options.priority` is ignored here; the
    /// task belongs to this queue.
    pub fn queue_task<T, F>(
        &self,
        callback: F,
        options: QueueTaskOptions,
    ) -> Result<Task<T>, SchedulerError>
    where
        T: 'static,
        F: FnMut(f64) -> TaskStep<T> + 'static,
    {
        options.validate()?;

        if self.inner.state.borrow().processing.is_empty() {
            self.request_flush();
        }

        let now = self.now();
        let (callback, sink, slot) = task::prepare(callback, options.async_mode);
        let pooled = if options.reusable {
            self.inner.state.borrow_mut().pool.pop()
        } else {
            None
        };
        let core = match pooled {
            Some(core) => {
                core.reuse(now, &options, callback, sink);
                core
            }
            None => TaskCore::new(
                self.downgrade(),
                self.priority(),
                now,
                &options,
                callback,
                sink,
            ),
        };

        self.inner.tracer.on_queued(&core.event(now));
        tracing::trace!(
            task = %core.id(),
            lane = %self.priority(),
            delay = options.delay,
            preempt = options.preempt,
            persistent = options.persistent,
            "task queued"
        );
        self.inner.state.borrow_mut().place(core.clone());
        Ok(Task::new(core, slot))
    }

    /// Flush at the clock's current time.
    pub fn flush_now(&self) -> Result<(), SchedulerError> {
        self.flush(self.now())
    }

    /// Run every task that is due at `time`.
    ///
    /// Async continuations that were woken since the last flush are polled
    /// first. A suspending task in flight blocks the lane: the flush only
    /// re-arms itself. Tasks queued by callbacks during this flush (other than
    /// preempting ones) run on the next flush, which is requested here.
    pub fn flush(&self, time: f64) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.borrow_mut();
            state.flush_requested = false;
            state.last_flush = time;
        }

        let polled = self.poll_in_flight();
        let mut stats = FlushStats::default();

        if self.is_suspended() {
            self.request_flush();
            stats.suspended = true;
            self.report_flush(time, stats);
            return polled;
        }

        self.inner.state.borrow_mut().absorb(time);
        loop {
            let next = self.inner.state.borrow_mut().processing.pop_front();
            let Some(task) = next else {
                break;
            };
            stats.ran += 1;
            if let Err(err) = task.run(time) {
                self.rearm();
                self.resolve_yield_if_idle();
                if let Err(lost) = polled {
                    tracing::error!(lane = %self.priority(), error = %lost, "async task failure dropped");
                }
                self.report_flush(time, stats);
                return Err(err);
            }
            if task.status() == TaskStatus::Running {
                if task.suspends() {
                    self.inner.state.borrow_mut().suspender = Some(task);
                    self.request_flush();
                    stats.suspended = true;
                    self.report_flush(time, stats);
                    return polled;
                }
                self.inner.state.borrow_mut().pending_async_count += 1;
            }
        }

        let has_work = {
            let mut state = self.inner.state.borrow_mut();
            state.absorb(time);
            state.has_work()
        };
        if has_work {
            self.request_flush();
        }
        self.resolve_yield_if_idle();
        self.report_flush(time, stats);
        polled
    }

    /// Wait until there is no more finite work: no async task in flight and
    /// nothing queued except persistent tasks. Resolves immediately when the
    /// queue is empty; concurrent callers share one signal.
    pub fn yield_now(&self) -> YieldFuture {
        let mut state = self.inner.state.borrow_mut();
        if state.is_empty() {
            return YieldFuture { signal: None };
        }
        let signal = state.yield_signal.get_or_insert_with(Default::default).clone();
        YieldFuture {
            signal: Some(signal),
        }
    }

    /// Withdraw the outstanding flush request, if any.
    pub fn cancel(&self) {
        let requested = std::mem::replace(&mut self.inner.state.borrow_mut().flush_requested, false);
        if requested {
            if let Some(requestor) = self.inner.requestor.borrow().as_ref() {
                requestor.cancel();
            }
        }
    }

    fn request_flush(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.flush_requested {
                return;
            }
            state.flush_requested = true;
            state.last_request = self.inner.clock.now();
        }
        if let Some(requestor) = self.inner.requestor.borrow().as_ref() {
            requestor.request();
        }
    }

    /// Keep the lane polled after a flush was cut short by an error.
    fn rearm(&self) {
        let busy = {
            let state = self.inner.state.borrow();
            state.has_work() || !state.pending.is_empty()
        };
        if busy {
            self.request_flush();
        }
    }

    pub(crate) fn resolve_yield_if_idle(&self) {
        let signal = {
            let mut state = self.inner.state.borrow_mut();
            if state.yield_signal.is_some() && state.has_no_more_finite_work() {
                state.yield_signal.take()
            } else {
                None
            }
        };
        if let Some(signal) = signal {
            tracing::debug!(lane = %self.priority(), "task queue drained, resolving yield");
            signal.resolve();
        }
    }

    fn report_flush(&self, time: f64, mut stats: FlushStats) {
        {
            let state = self.inner.state.borrow();
            stats.remaining = state.processing.len() + state.pending.len() + state.delayed.len();
            stats.pending_async = state.pending_async_count;
        }
        tracing::debug!(
            lane = %self.priority(),
            time,
            ran = stats.ran,
            remaining = stats.remaining,
            pending_async = stats.pending_async,
            suspended = stats.suspended,
            "task queue flushed"
        );
        self.inner.tracer.on_flush(self.priority(), time, &stats);
    }

    /// Poll the futures whose wakers fired since the last flush.
    fn poll_in_flight(&self) -> Result<(), SchedulerError> {
        let woken: Vec<usize> = {
            let state = self.inner.state.borrow();
            state
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.wake.take())
                .map(|(key, _)| key)
                .collect()
        };

        let mut first_error = None;
        for key in woken {
            let entry = self.inner.state.borrow_mut().in_flight.try_remove(key);
            let Some(mut entry) = entry else {
                continue;
            };
            let entry_waker = waker(entry.wake.clone());
            let mut cx = Context::from_waker(&entry_waker);
            match entry.future.as_mut().poll(&mut cx) {
                Poll::Pending => {
                    self.inner.state.borrow_mut().in_flight.insert(entry);
                }
                Poll::Ready(outcome) => {
                    let InFlight {
                        task, persistent, ..
                    } = entry;
                    let finished = task.finish(outcome.map_err(TaskError::Failed), persistent, true);
                    if let Err(err) = finished {
                        match first_error {
                            None => first_error = Some(err),
                            Some(_) => {
                                tracing::error!(lane = %self.priority(), error = %err, "async task failure dropped");
                            }
                        }
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn track_async(
        &self,
        task: Rc<TaskCore>,
        future: LocalBoxFuture<'static, Result<(), anyhow::Error>>,
        persistent: bool,
    ) {
        tracing::trace!(task = %task.id(), lane = %self.priority(), "task went async");
        self.inner.state.borrow_mut().in_flight.insert(InFlight {
            task,
            future,
            wake: Arc::new(WakeFlag(AtomicBool::new(true))),
            persistent,
        });
        self.request_flush();
    }

    pub(crate) fn complete_async_task(&self, task: &Rc<TaskCore>) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.borrow_mut();
            if task.suspends() {
                match &state.suspender {
                    Some(suspender) if Rc::ptr_eq(suspender, task) => state.suspender = None,
                    other => {
                        return Err(SchedulerError::SuspenderMismatch {
                            expected: other.as_ref().map(|suspender| suspender.id()),
                            actual: task.id(),
                        });
                    }
                }
            } else {
                // Tasks run outside of a flush were never counted.
                state.pending_async_count = state.pending_async_count.saturating_sub(1);
            }
        }
        self.resolve_yield_if_idle();
        if self.is_empty() {
            self.cancel();
        }
        Ok(())
    }

    pub(crate) fn remove(&self, task: &Rc<TaskCore>) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.borrow_mut();
        let state = &mut *state;
        for bucket in [
            &mut state.processing,
            &mut state.pending,
            &mut state.delayed,
        ] {
            if let Some(at) = bucket.iter().position(|queued| Rc::ptr_eq(queued, task)) {
                bucket.remove(at);
                return Ok(());
            }
        }
        Err(SchedulerError::TaskNotFound(task.id()))
    }

    pub(crate) fn reset_persistent_task(&self, task: &Rc<TaskCore>) {
        task.reset(self.now());
        self.inner.state.borrow_mut().place(task.clone());
    }

    pub(crate) fn return_to_pool(&self, task: Rc<TaskCore>) {
        let mut state = self.inner.state.borrow_mut();
        if let Some(max) = self.inner.max_pool_size {
            if state.pool.len() >= max {
                return;
            }
        }
        state.pool.push(task);
    }
}
