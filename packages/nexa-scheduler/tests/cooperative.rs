use nexa_scheduler::{ManualClock, ManualFlush, Priority, QueueTaskOptions, TaskQueue, TaskStep};
use std::cell::Cell;
use std::rc::Rc;

fn macro_queue() -> (TaskQueue, ManualFlush) {
    let flush = ManualFlush::new();
    let queue = TaskQueue::new(Priority::MacroTask, Rc::new(ManualClock::new()), &flush);
    (queue, flush)
}

#[test]
fn test_flush_request_is_idempotent() {
    let (queue, flush) = macro_queue();

    queue.queue_task(|_| TaskStep::done(), QueueTaskOptions::new()).unwrap();
    queue.queue_task(|_| TaskStep::done(), QueueTaskOptions::new()).unwrap();
    assert_eq!(flush.requests(), 1);
    assert!(queue.flush_requested());

    queue.flush(0.0).unwrap();
    assert!(!queue.flush_requested());
    assert_eq!(flush.requests(), 1, "a drained lane asks for nothing");

    queue.queue_task(|_| TaskStep::done(), QueueTaskOptions::new()).unwrap();
    assert_eq!(flush.requests(), 2);
}

#[test]
fn test_cancel_withdraws_flush_request() {
    let (queue, flush) = macro_queue();

    queue.queue_task(|_| TaskStep::done(), QueueTaskOptions::new()).unwrap();
    queue.cancel();
    assert_eq!(flush.cancels(), 1);
    assert!(!queue.flush_requested());

    queue.cancel();
    assert_eq!(flush.cancels(), 1, "nothing outstanding, nothing to cancel");
}

#[test]
fn test_canceling_last_task_cancels_flush() {
    let (queue, flush) = macro_queue();

    let task = queue.queue_task(|_| TaskStep::done(), QueueTaskOptions::new()).unwrap();
    assert!(task.cancel().unwrap());
    assert!(queue.is_empty());
    assert_eq!(flush.cancels(), 1);
}

#[test]
fn test_empty_flush_is_a_no_op() {
    let (queue, flush) = macro_queue();

    queue.flush(3.0).unwrap();
    assert_eq!(flush.requests(), 0);
    assert_eq!(queue.last_flush(), 3.0);
}

#[test]
fn test_reentrant_queueing_runs_on_next_flush() {
    let (queue, flush) = macro_queue();
    let counter = Rc::new(Cell::new(0));

    {
        let inner = queue.clone();
        let counter = counter.clone();
        queue
            .queue_task(
                move |_| {
                    counter.set(counter.get() + 1);
                    let counter = counter.clone();
                    inner
                        .queue_task(
                            move |_| {
                                counter.set(counter.get() + 10);
                                TaskStep::done()
                            },
                            QueueTaskOptions::new(),
                        )
                        .unwrap();
                    TaskStep::done()
                },
                QueueTaskOptions::new(),
            )
            .unwrap();
    }

    queue.flush(0.0).unwrap();
    assert_eq!(counter.get(), 1);
    assert!(queue.flush_requested());
    assert_eq!(flush.requests(), 2);

    queue.flush(1.0).unwrap();
    assert_eq!(counter.get(), 11);
    assert!(queue.is_empty());
}
