use futures::FutureExt;
use nexa_scheduler::{
    ManualClock, ManualFlush, Priority, QueueTaskOptions, Scheduler, SchedulerConfig, TaskQueue,
    TaskStatus, TaskStep,
};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_recycled_task_starts_fresh() {
    let clock = ManualClock::new();
    let queue = TaskQueue::new(Priority::Render, Rc::new(clock.clone()), &ManualFlush::new());
    let log = Rc::new(RefCell::new(Vec::new()));

    let first = {
        let log = log.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push("first");
                    TaskStep::ready(1)
                },
                QueueTaskOptions::new(),
            )
            .unwrap()
    };
    queue.flush(0.0).unwrap();
    assert_eq!(queue.pool_size(), 1);

    clock.set(50.0);
    let second = {
        let log = log.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push("second");
                    TaskStep::done()
                },
                QueueTaskOptions::new().delay(5.0).persistent(),
            )
            .unwrap()
    };
    assert_eq!(queue.pool_size(), 0);
    assert_ne!(first.id(), second.id());
    assert_eq!(second.created_time(), 50.0);
    assert_eq!(second.queue_time(), 55.0);
    assert!(second.is_persistent());
    assert_eq!(second.status(), TaskStatus::Pending);

    // The old handle still speaks for its own incarnation.
    assert_eq!(first.status(), TaskStatus::Completed);
    assert!(!first.is_persistent());
    assert_eq!(first.cancel().unwrap(), false);
    assert_eq!(first.result().unwrap().now_or_never().unwrap().unwrap(), 1);

    clock.set(55.0);
    queue.flush(55.0).unwrap();
    assert_eq!(*log.borrow(), vec!["first", "second"]);
}

#[test]
fn test_non_reusable_tasks_skip_pool() {
    let queue = TaskQueue::new(Priority::Render, Rc::new(ManualClock::new()), &ManualFlush::new());

    queue
        .queue_task(|_| TaskStep::done(), QueueTaskOptions::new().reusable(false))
        .unwrap();
    queue.flush(0.0).unwrap();
    assert_eq!(queue.pool_size(), 0);
}

#[test]
fn test_pool_size_is_capped() {
    let scheduler = Scheduler::builder()
        .clock(ManualClock::new())
        .config(SchedulerConfig {
            max_pool_size: Some(1),
            ..SchedulerConfig::default()
        })
        .flush_requestor(Priority::Render, ManualFlush::new())
        .flush_requestor(Priority::MacroTask, ManualFlush::new())
        .flush_requestor(Priority::PostRender, ManualFlush::new())
        .build()
        .unwrap();
    let queue = scheduler.render_task_queue();

    for _ in 0..3 {
        queue.queue_task(|_| TaskStep::done(), QueueTaskOptions::new()).unwrap();
    }
    queue.flush(0.0).unwrap();
    assert_eq!(queue.pool_size(), 1);
}
