use crate::error::SchedulerError;
use crate::options::{Priority, QueueTaskOptions, SchedulerConfig};
use crate::platform::{Clock, FlushRequestorFactory, MonotonicClock};
use crate::queue::{TaskQueue, YieldFuture};
use crate::task::{Task, TaskResult, TaskStep};
use crate::trace::{NoopTracer, Tracer};
use std::rc::Rc;

/// Three independent lanes: render, macro-task and post-render.
///
/// Lanes never preempt each other. The only cross-lane ordering is the one
/// [`Scheduler::yield_all`] establishes.
#[derive(Clone, Debug)]
pub struct Scheduler {
    queues: Rc<[TaskQueue; 3]>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    pub fn task_queue(&self, priority: Priority) -> &TaskQueue {
        &self.queues[priority.index()]
    }

    pub fn render_task_queue(&self) -> &TaskQueue {
        self.task_queue(Priority::Render)
    }

    pub fn macro_task_queue(&self) -> &TaskQueue {
        self.task_queue(Priority::MacroTask)
    }

    pub fn post_render_task_queue(&self) -> &TaskQueue {
        self.task_queue(Priority::PostRender)
    }

    /// Queue on the lane named by `options.priority`.
    pub fn queue_task<T, F>(
        &self,
        callback: F,
        options: QueueTaskOptions,
    ) -> Result<Task<T>, SchedulerError>
    where
        T: 'static,
        F: FnMut(f64) -> TaskStep<T> + 'static,
    {
        self.task_queue(options.priority)
            .queue_task(callback, options)
    }

    pub fn queue_render_task<T, F>(
        &self,
        callback: F,
        options: QueueTaskOptions,
    ) -> Result<Task<T>, SchedulerError>
    where
        T: 'static,
        F: FnMut(f64) -> TaskStep<T> + 'static,
    {
        self.queue_task(callback, options.priority(Priority::Render))
    }

    pub fn queue_macro_task<T, F>(
        &self,
        callback: F,
        options: QueueTaskOptions,
    ) -> Result<Task<T>, SchedulerError>
    where
        T: 'static,
        F: FnMut(f64) -> TaskStep<T> + 'static,
    {
        self.queue_task(callback, options.priority(Priority::MacroTask))
    }

    pub fn queue_post_render_task<T, F>(
        &self,
        callback: F,
        options: QueueTaskOptions,
    ) -> Result<Task<T>, SchedulerError>
    where
        T: 'static,
        F: FnMut(f64) -> TaskStep<T> + 'static,
    {
        self.queue_task(callback, options.priority(Priority::PostRender))
    }

    pub fn yield_lane(&self, priority: Priority) -> YieldFuture {
        self.task_queue(priority).yield_now()
    }

    pub fn yield_render_task(&self) -> YieldFuture {
        self.yield_lane(Priority::Render)
    }

    pub fn yield_macro_task(&self) -> YieldFuture {
        self.yield_lane(Priority::MacroTask)
    }

    pub fn yield_post_render_task(&self) -> YieldFuture {
        self.yield_lane(Priority::PostRender)
    }

    /// Drain render, then macro-task, then post-render, `repeat` times.
    ///
    /// Each lane is awaited on its own, in that order, because draining one
    /// lane may queue work into the next.
    pub async fn yield_all(&self, repeat: usize) {
        for _ in 0..repeat {
            self.yield_render_task().await;
            self.yield_macro_task().await;
            self.yield_post_render_task().await;
        }
    }

    /// Wrap `f` so that every call is queued as a task on `priority` and hands
    /// back the task's result instead of running `f` directly.
    pub fn queued<A, T, F>(
        &self,
        priority: Priority,
        f: F,
    ) -> impl Fn(A) -> Result<TaskResult<T>, SchedulerError> + use<A, T, F>
    where
        A: 'static,
        T: 'static,
        F: Fn(A) -> T + 'static,
    {
        let queue = self.task_queue(priority).clone();
        let f = Rc::new(f);
        move |arg: A| {
            let f = f.clone();
            let mut arg = Some(arg);
            let task = queue.queue_task(
                move |_| match arg.take() {
                    Some(arg) => TaskStep::ready(f(arg)),
                    None => TaskStep::fail(anyhow::anyhow!("queued call ran twice")),
                },
                QueueTaskOptions::default(),
            )?;
            task.result()
        }
    }
}

/// Assembles a [`Scheduler`]. Every lane needs a flush requestor factory.
pub struct SchedulerBuilder {
    clock: Option<Rc<dyn Clock>>,
    tracer: Rc<dyn Tracer>,
    requestors: [Option<Box<dyn FlushRequestorFactory>>; 3],
    config: SchedulerConfig,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            clock: None,
            tracer: Rc::new(NoopTracer),
            requestors: [None, None, None],
            config: SchedulerConfig::default(),
        }
    }
}

impl SchedulerBuilder {
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Rc::new(clock));
        self
    }

    pub fn tracer(mut self, tracer: Rc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn flush_requestor(
        mut self,
        priority: Priority,
        factory: impl FlushRequestorFactory + 'static,
    ) -> Self {
        self.requestors[priority.index()] = Some(Box::new(factory));
        self
    }

    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        let clock = self
            .clock
            .unwrap_or_else(|| Rc::new(MonotonicClock::new()));
        let [render, macro_task, post_render] = self.requestors;
        let lane = |priority: Priority, factory: Option<Box<dyn FlushRequestorFactory>>| {
            let factory = factory.ok_or(SchedulerError::MissingFlushRequestor(priority))?;
            Ok::<_, SchedulerError>(TaskQueue::with_parts(
                priority,
                clock.clone(),
                self.tracer.clone(),
                self.config.max_pool_size,
                &*factory,
            ))
        };
        let queues = [
            lane(Priority::Render, render)?,
            lane(Priority::MacroTask, macro_task)?,
            lane(Priority::PostRender, post_render)?,
        ];
        tracing::debug!(max_pool_size = ?self.config.max_pool_size, "scheduler built");
        Ok(Scheduler {
            queues: Rc::new(queues),
        })
    }
}
