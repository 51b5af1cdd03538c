use nexa_scheduler::{ManualClock, ManualFlush, Priority, QueueTaskOptions, TaskQueue, TaskStep};
use std::cell::RefCell;
use std::rc::Rc;

type Log = Rc<RefCell<Vec<&'static str>>>;

fn render_queue() -> (TaskQueue, ManualClock) {
    let clock = ManualClock::new();
    let queue = TaskQueue::new(Priority::Render, Rc::new(clock.clone()), &ManualFlush::new());
    (queue, clock)
}

fn record(log: &Log, label: &'static str) -> impl FnMut(f64) -> TaskStep<()> + 'static {
    let log = log.clone();
    move |_| {
        log.borrow_mut().push(label);
        TaskStep::done()
    }
}

#[test]
fn test_submission_order() {
    let (queue, _clock) = render_queue();
    let list = Rc::new(RefCell::new(Vec::new()));

    for i in 1..=3 {
        let list = list.clone();
        queue
            .queue_task(
                move |_| {
                    list.borrow_mut().push(i);
                    TaskStep::done()
                },
                QueueTaskOptions::new(),
            )
            .unwrap();
    }

    queue.flush(0.0).unwrap();
    assert_eq!(*list.borrow(), vec![1, 2, 3]);
    assert!(queue.is_empty());
}

#[test]
fn test_delayed_task_waits_for_queue_time() {
    let (queue, _clock) = render_queue();
    let log: Log = Default::default();

    queue
        .queue_task(record(&log, "delayed"), QueueTaskOptions::new().delay(5.0))
        .unwrap();
    queue
        .queue_task(record(&log, "preempt"), QueueTaskOptions::new().preempt())
        .unwrap();

    queue.flush(0.0).unwrap();
    assert_eq!(*log.borrow(), vec!["preempt"]);
    assert!(queue.flush_requested(), "delayed work keeps the lane polled");

    queue.flush(10.0).unwrap();
    assert_eq!(*log.borrow(), vec!["preempt", "delayed"]);
}

#[test]
fn test_shorter_delay_runs_first() {
    let (queue, _clock) = render_queue();
    let log: Log = Default::default();

    queue
        .queue_task(record(&log, "ten"), QueueTaskOptions::new().delay(10.0))
        .unwrap();
    queue
        .queue_task(record(&log, "five"), QueueTaskOptions::new().delay(5.0))
        .unwrap();

    queue.flush(7.0).unwrap();
    assert_eq!(*log.borrow(), vec!["five"]);

    queue.flush(12.0).unwrap();
    assert_eq!(*log.borrow(), vec!["five", "ten"]);
}

#[test]
fn test_due_delayed_tasks_run_in_due_order() {
    let (queue, _clock) = render_queue();
    let log: Log = Default::default();

    queue
        .queue_task(record(&log, "ten"), QueueTaskOptions::new().delay(10.0))
        .unwrap();
    queue
        .queue_task(record(&log, "five-a"), QueueTaskOptions::new().delay(5.0))
        .unwrap();
    queue
        .queue_task(record(&log, "five-b"), QueueTaskOptions::new().delay(5.0))
        .unwrap();

    queue.flush(20.0).unwrap();
    assert_eq!(*log.borrow(), vec!["five-a", "five-b", "ten"]);
}

#[test]
fn test_preempt_joins_current_batch() {
    let (queue, _clock) = render_queue();
    let log: Log = Default::default();

    {
        let log = log.clone();
        let inner = queue.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push("first");
                    inner
                        .queue_task(record(&log, "normal"), QueueTaskOptions::new())
                        .unwrap();
                    inner
                        .queue_task(record(&log, "preempt"), QueueTaskOptions::new().preempt())
                        .unwrap();
                    TaskStep::done()
                },
                QueueTaskOptions::new(),
            )
            .unwrap();
    }
    queue
        .queue_task(record(&log, "second"), QueueTaskOptions::new())
        .unwrap();

    queue.flush(0.0).unwrap();
    // The preempting task runs behind what was already processing, but within
    // this flush; the plain task waits for the next one.
    assert_eq!(*log.borrow(), vec!["first", "second", "preempt"]);

    queue.flush(1.0).unwrap();
    assert_eq!(*log.borrow(), vec!["first", "second", "preempt", "normal"]);
}

#[test]
fn test_callback_receives_elapsed_time() {
    let (queue, clock) = render_queue();
    let elapsed = Rc::new(RefCell::new(None));

    clock.set(2.0);
    {
        let elapsed = elapsed.clone();
        queue
            .queue_task(
                move |ms| {
                    *elapsed.borrow_mut() = Some(ms);
                    TaskStep::done()
                },
                QueueTaskOptions::new().delay(5.0),
            )
            .unwrap();
    }

    queue.flush(10.0).unwrap();
    assert_eq!(*elapsed.borrow(), Some(8.0));
}

#[test]
fn test_invalid_options_are_rejected() {
    let (queue, _clock) = render_queue();

    let delayed = queue.queue_task(|_| TaskStep::done(), QueueTaskOptions::new().preempt().delay(1.0));
    assert!(matches!(
        delayed,
        Err(nexa_scheduler::SchedulerError::PreemptWithDelay { .. })
    ));

    let persistent =
        queue.queue_task(|_| TaskStep::done(), QueueTaskOptions::new().preempt().persistent());
    assert!(matches!(
        persistent,
        Err(nexa_scheduler::SchedulerError::PreemptWithPersistent)
    ));

    assert!(queue.is_empty());
}
