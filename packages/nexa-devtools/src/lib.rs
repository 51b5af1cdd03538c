//! Scheduler inspection. Debug builds record per-lane metrics and live tasks
//! through a [`nexa_scheduler::Tracer`]; release builds compile to no-ops.

#[cfg(debug_assertions)]
mod internal {
    use nexa_scheduler::{FlushStats, Priority, TaskEvent, TaskStatus, Tracer};
    use rustc_hash::FxHashMap;
    use serde::{Deserialize, Serialize};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum TaskPhase {
        Pending,
        Running,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TaskNode {
        pub id: u64,
        pub priority: Priority,
        pub phase: TaskPhase,
        pub persistent: bool,
        pub queue_time: f64,
        pub runs: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct LaneMetrics {
        pub queued: u64,
        pub executed: u64,
        pub completed: u64,
        pub canceled: u64,
        pub failed: u64,
        pub flushes: u64,
        pub pending_tasks: usize,
        pub pending_async: usize,
        pub suspended: bool,
        /// From the time a task became due to the time it ran.
        pub average_latency_ms: f64,
        pub max_latency_ms: f64,
    }

    impl LaneMetrics {
        fn record_latency(&mut self, latency: f64) {
            let samples = self.executed as f64;
            self.average_latency_ms += (latency - self.average_latency_ms) / samples;
            self.max_latency_ms = self.max_latency_ms.max(latency);
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct DevToolsSnapshot {
        pub lanes: FxHashMap<Priority, LaneMetrics>,
        /// Tasks that are queued or running, by id.
        pub tasks: FxHashMap<u64, TaskNode>,
        pub flush_count: u64,
        /// Clock time of the last recorded transition.
        pub timestamp: f64,
    }

    impl DevToolsSnapshot {
        pub fn lane(&self, priority: Priority) -> LaneMetrics {
            self.lanes.get(&priority).cloned().unwrap_or_default()
        }
    }

    /// Receives the snapshot after every flush.
    pub trait DevBridge {
        fn send_snapshot(&self, snapshot: &DevToolsSnapshot);
    }

    #[derive(Default)]
    pub struct DevToolsTracer {
        snapshot: RefCell<DevToolsSnapshot>,
        bridge: RefCell<Option<Box<dyn DevBridge>>>,
    }

    impl DevToolsTracer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_bridge(&self, bridge: Box<dyn DevBridge>) {
            *self.bridge.borrow_mut() = Some(bridge);
        }

        pub fn snapshot(&self) -> DevToolsSnapshot {
            self.snapshot.borrow().clone()
        }

        pub fn lane(&self, priority: Priority) -> LaneMetrics {
            self.snapshot.borrow().lane(priority)
        }

        pub fn reset(&self) {
            *self.snapshot.borrow_mut() = DevToolsSnapshot::default();
        }

        pub fn export_state(&self) -> serde_json::Result<String> {
            serde_json::to_string(&*self.snapshot.borrow())
        }

        fn update(&self, time: f64, f: impl FnOnce(&mut DevToolsSnapshot)) {
            let mut snapshot = self.snapshot.borrow_mut();
            snapshot.timestamp = time;
            f(&mut snapshot);
        }
    }

    impl Tracer for DevToolsTracer {
        fn on_queued(&self, event: &TaskEvent) {
            self.update(event.time, |snapshot| {
                let lane = snapshot.lanes.entry(event.priority).or_default();
                lane.queued += 1;
                lane.pending_tasks += 1;
                snapshot.tasks.insert(
                    event.id.as_u64(),
                    TaskNode {
                        id: event.id.as_u64(),
                        priority: event.priority,
                        phase: TaskPhase::Pending,
                        persistent: event.persistent,
                        queue_time: event.queue_time,
                        runs: 0,
                    },
                );
            });
        }

        fn on_run(&self, event: &TaskEvent) {
            self.update(event.time, |snapshot| {
                let lane = snapshot.lanes.entry(event.priority).or_default();
                lane.executed += 1;
                lane.pending_tasks = lane.pending_tasks.saturating_sub(1);
                lane.record_latency((event.time - event.queue_time).max(0.0));
                if let Some(node) = snapshot.tasks.get_mut(&event.id.as_u64()) {
                    node.phase = TaskPhase::Running;
                    node.runs += 1;
                }
            });
        }

        fn on_settled(&self, event: &TaskEvent, status: TaskStatus, failed: bool) {
            self.update(event.time, |snapshot| {
                let lane = snapshot.lanes.entry(event.priority).or_default();
                if failed {
                    lane.failed += 1;
                    snapshot.tasks.remove(&event.id.as_u64());
                    return;
                }
                match status {
                    TaskStatus::Pending => {
                        lane.pending_tasks += 1;
                        if let Some(node) = snapshot.tasks.get_mut(&event.id.as_u64()) {
                            node.phase = TaskPhase::Pending;
                        }
                    }
                    TaskStatus::Canceled => {
                        lane.canceled += 1;
                        snapshot.tasks.remove(&event.id.as_u64());
                    }
                    TaskStatus::Completed | TaskStatus::Running => {
                        lane.completed += 1;
                        snapshot.tasks.remove(&event.id.as_u64());
                    }
                }
            });
        }

        fn on_canceled(&self, event: &TaskEvent) {
            self.update(event.time, |snapshot| {
                let lane = snapshot.lanes.entry(event.priority).or_default();
                lane.canceled += 1;
                lane.pending_tasks = lane.pending_tasks.saturating_sub(1);
                snapshot.tasks.remove(&event.id.as_u64());
            });
        }

        fn on_flush(&self, priority: Priority, time: f64, stats: &FlushStats) {
            self.update(time, |snapshot| {
                snapshot.flush_count += 1;
                let lane = snapshot.lanes.entry(priority).or_default();
                lane.flushes += 1;
                lane.pending_tasks = stats.remaining;
                lane.pending_async = stats.pending_async;
                lane.suspended = stats.suspended;
            });

            if let Some(bridge) = self.bridge.borrow().as_ref() {
                bridge.send_snapshot(&self.snapshot.borrow());
            }
            tracing::trace!(lane = %priority, ran = stats.ran, "devtools snapshot updated");
        }
    }

    thread_local! {
        static DEVTOOLS: Rc<DevToolsTracer> = Rc::new(DevToolsTracer::new());
    }

    pub fn devtools() -> Rc<DevToolsTracer> {
        DEVTOOLS.with(Rc::clone)
    }
}

#[cfg(debug_assertions)]
pub use internal::*;

// Production no-op implementation
#[cfg(not(debug_assertions))]
mod production {
    use nexa_scheduler::{Priority, Tracer};
    use serde::Serialize;
    use std::rc::Rc;

    #[derive(Debug, Clone, Default, Serialize)]
    pub struct LaneMetrics;

    #[derive(Debug, Clone, Default, Serialize)]
    pub struct DevToolsSnapshot;

    impl DevToolsSnapshot {
        pub fn lane(&self, _: Priority) -> LaneMetrics {
            LaneMetrics
        }
    }

    pub trait DevBridge {
        fn send_snapshot(&self, snapshot: &DevToolsSnapshot);
    }

    #[derive(Default)]
    pub struct DevToolsTracer;

    impl DevToolsTracer {
        pub fn new() -> Self {
            Self
        }
        pub fn set_bridge(&self, _: Box<dyn DevBridge>) {}
        pub fn snapshot(&self) -> DevToolsSnapshot {
            DevToolsSnapshot
        }
        pub fn lane(&self, _: Priority) -> LaneMetrics {
            LaneMetrics
        }
        pub fn reset(&self) {}
        pub fn export_state(&self) -> serde_json::Result<String> {
            serde_json::to_string(&DevToolsSnapshot)
        }
    }

    impl Tracer for DevToolsTracer {}

    pub fn devtools() -> Rc<DevToolsTracer> {
        Rc::new(DevToolsTracer)
    }
}

#[cfg(not(debug_assertions))]
pub use production::*;
