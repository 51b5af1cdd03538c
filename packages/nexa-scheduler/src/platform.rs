//! Boundary contracts with the hosting platform: a monotonic clock and a way
//! to be called back "soon" for a flush.

use crate::queue::TaskQueue;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Get the current time in milliseconds (monotonic).
pub trait Clock {
    fn now(&self) -> f64;
}

/// Milliseconds elapsed since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ms: f64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: f64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.get()
    }
}

/// Asks the host to call [`TaskQueue::flush`] soon.
///
/// A queue never calls `request` twice without a flush or a `cancel` in
/// between.
pub trait FlushRequestor {
    fn request(&self);
    fn cancel(&self);
}

/// Creates the flush requestor for one lane.
pub trait FlushRequestorFactory {
    fn create(&self, queue: &TaskQueue) -> Box<dyn FlushRequestor>;
}

#[derive(Debug, Default)]
struct ManualFlushLog {
    requests: Cell<usize>,
    cancels: Cell<usize>,
}

/// A requestor for hosts that drive flushing themselves (headless hosts,
/// server-side rendering, tests). It only counts what the queue asked for;
/// whether a flush is still due is [`TaskQueue::flush_requested`].
///
/// Clones share one log, so give each lane its own instance when the counts
/// matter.
#[derive(Debug, Clone, Default)]
pub struct ManualFlush {
    log: Rc<ManualFlushLog>,
}

impl ManualFlush {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `request` calls so far.
    pub fn requests(&self) -> usize {
        self.log.requests.get()
    }

    /// Number of `cancel` calls so far.
    pub fn cancels(&self) -> usize {
        self.log.cancels.get()
    }
}

impl FlushRequestor for ManualFlush {
    fn request(&self) {
        self.log.requests.set(self.log.requests.get() + 1);
    }

    fn cancel(&self) {
        self.log.cancels.set(self.log.cancels.get() + 1);
    }
}

impl FlushRequestorFactory for ManualFlush {
    fn create(&self, _queue: &TaskQueue) -> Box<dyn FlushRequestor> {
        Box::new(self.clone())
    }
}
