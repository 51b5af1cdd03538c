use crate::error::SchedulerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three independent scheduler lanes.
///
/// The order only matters for addressing; lanes never preempt each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    #[default]
    Render,
    MacroTask,
    PostRender,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Render, Priority::MacroTask, Priority::PostRender];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Render => 0,
            Priority::MacroTask => 1,
            Priority::PostRender => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Render => "render",
            Priority::MacroTask => "macroTask",
            Priority::PostRender => "postRender",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task treats the value its callback hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AsyncMode {
    /// Settle on the async path even when the callback returned a ready value.
    Always,
    /// Never await; returning a future fails the run. To hand a future back
    /// without awaiting it, make the future the task's value and return it
    /// through [`TaskStep::ready`](crate::TaskStep::ready).
    Never,
    /// Await only when the callback returned a future.
    #[default]
    Auto,
}

/// Options accepted by `queue_task`.
///
/// Defaults: `delay = 0`, `preempt = false`, `persistent = false`,
/// `reusable = true`, `suspend = false`, `async_mode = Auto`,
/// `priority = Render`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueTaskOptions {
    /// Minimum time in milliseconds before the task becomes due.
    pub delay: f64,
    /// Jump into the batch that is currently being processed.
    pub preempt: bool,
    /// Re-queue after every run until canceled.
    pub persistent: bool,
    /// Return the task object to the queue's pool once it is done.
    pub reusable: bool,
    /// Block the lane while the task's future is in flight.
    pub suspend: bool,
    pub async_mode: AsyncMode,
    pub priority: Priority,
}

impl Default for QueueTaskOptions {
    fn default() -> Self {
        Self {
            delay: 0.0,
            preempt: false,
            persistent: false,
            reusable: true,
            suspend: false,
            async_mode: AsyncMode::Auto,
            priority: Priority::Render,
        }
    }
}

impl QueueTaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, ms: f64) -> Self {
        self.delay = ms;
        self
    }

    pub fn preempt(mut self) -> Self {
        self.preempt = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn reusable(mut self, reusable: bool) -> Self {
        self.reusable = reusable;
        self
    }

    pub fn suspend(mut self) -> Self {
        self.suspend = true;
        self
    }

    pub fn async_mode(mut self, mode: AsyncMode) -> Self {
        self.async_mode = mode;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !self.delay.is_finite() || self.delay < 0.0 {
            return Err(SchedulerError::InvalidDelay(self.delay));
        }
        if self.preempt {
            if self.delay > 0.0 {
                return Err(SchedulerError::PreemptWithDelay { delay: self.delay });
            }
            if self.persistent {
                return Err(SchedulerError::PreemptWithPersistent);
            }
        }
        Ok(())
    }
}

/// The tick a lane's flush requestor waits for before flushing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TickSource {
    /// Flush on the next turn of the host event loop.
    Yield,
    /// Flush after a fixed interval, e.g. a frame.
    Interval { ms: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    pub tick: TickSource,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            tick: TickSource::Yield,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Upper bound on retired tasks kept for reuse per lane. `None` keeps every one.
    pub max_pool_size: Option<usize>,
    pub render: LaneConfig,
    pub macro_task: LaneConfig,
    pub post_render: LaneConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pool_size: None,
            render: LaneConfig {
                tick: TickSource::Interval { ms: 16.0 },
            },
            macro_task: LaneConfig::default(),
            post_render: LaneConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn lane(&self, priority: Priority) -> &LaneConfig {
        match priority {
            Priority::Render => &self.render,
            Priority::MacroTask => &self.macro_task,
            Priority::PostRender => &self.post_render,
        }
    }
}
