//! Tick sources backed by a tokio `LocalSet`.
//!
//! Every flush runs inside `spawn_local`, so schedulers built here must be
//! driven from within [`tokio::task::LocalSet::run_until`] (or
//! `LocalSet::block_on`).

use crate::error::SchedulerError;
use crate::options::{Priority, SchedulerConfig, TickSource};
use crate::platform::{Clock, FlushRequestor, FlushRequestorFactory, MonotonicClock};
use crate::queue::{TaskQueue, WeakTaskQueue};
use crate::scheduler::Scheduler;
use crate::trace::Tracer;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
pub struct TokioFlushRequestorFactory {
    tick: TickSource,
}

impl TokioFlushRequestorFactory {
    pub fn new(tick: TickSource) -> Self {
        Self { tick }
    }
}

impl FlushRequestorFactory for TokioFlushRequestorFactory {
    fn create(&self, queue: &TaskQueue) -> Box<dyn FlushRequestor> {
        Box::new(TokioFlushRequestor {
            queue: queue.downgrade(),
            tick: self.tick,
            handle: RefCell::new(None),
        })
    }
}

struct TokioFlushRequestor {
    queue: WeakTaskQueue,
    tick: TickSource,
    handle: RefCell<Option<JoinHandle<()>>>,
}

impl FlushRequestor for TokioFlushRequestor {
    fn request(&self) {
        let queue = self.queue.clone();
        let tick = self.tick;
        let handle = tokio::task::spawn_local(async move {
            match tick {
                TickSource::Yield => tokio::task::yield_now().await,
                TickSource::Interval { ms } => {
                    tokio::time::sleep(Duration::from_secs_f64(ms.max(0.0) / 1000.0)).await
                }
            }
            let Some(queue) = queue.upgrade() else {
                return;
            };
            if let Err(err) = queue.flush_now() {
                tracing::error!(lane = %queue.priority(), error = %err, "task queue flush failed");
            }
        });
        *self.handle.borrow_mut() = Some(handle);
    }

    fn cancel(&self) {
        if let Some(handle) = self.handle.borrow_mut().take() {
            handle.abort();
        }
    }
}

/// Build a scheduler whose lanes tick on the current `LocalSet` as described
/// by `config`.
pub fn tokio_scheduler(
    config: SchedulerConfig,
    tracer: Rc<dyn Tracer>,
) -> Result<Scheduler, SchedulerError> {
    tokio_scheduler_with_clock(config, tracer, MonotonicClock::new())
}

pub fn tokio_scheduler_with_clock(
    config: SchedulerConfig,
    tracer: Rc<dyn Tracer>,
    clock: impl Clock + 'static,
) -> Result<Scheduler, SchedulerError> {
    let mut builder = Scheduler::builder().clock(clock).tracer(tracer);
    for priority in Priority::ALL {
        let tick = config.lane(priority).tick;
        builder = builder.flush_requestor(priority, TokioFlushRequestorFactory::new(tick));
    }
    builder.config(config).build()
}
