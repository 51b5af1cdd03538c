use nexa_scheduler::{
    ManualClock, ManualFlush, Priority, QueueTaskOptions, Task, TaskQueue, TaskStatus, TaskStep,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn render_queue() -> (TaskQueue, ManualClock) {
    let clock = ManualClock::new();
    let queue = TaskQueue::new(Priority::Render, Rc::new(clock.clone()), &ManualFlush::new());
    (queue, clock)
}

fn counting(counter: &Rc<Cell<u32>>) -> impl FnMut(f64) -> TaskStep<()> + 'static {
    let counter = counter.clone();
    move |_| {
        counter.set(counter.get() + 1);
        TaskStep::done()
    }
}

#[test]
fn test_persistent_task_runs_once_per_flush() {
    let (queue, _clock) = render_queue();
    let runs = Rc::new(Cell::new(0));

    let task = queue
        .queue_task(counting(&runs), QueueTaskOptions::new().persistent())
        .unwrap();

    for (i, time) in [0.0, 1.0, 2.0].into_iter().enumerate() {
        queue.flush(time).unwrap();
        assert_eq!(runs.get(), i as u32 + 1);
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(queue.flush_requested());
    }
    assert!(task.is_persistent());
}

#[test]
fn test_cancel_pending_persistent_task() {
    let (queue, _clock) = render_queue();
    let runs = Rc::new(Cell::new(0));

    let task = queue
        .queue_task(counting(&runs), QueueTaskOptions::new().persistent())
        .unwrap();
    queue.flush(0.0).unwrap();

    assert_eq!(task.cancel().unwrap(), true);
    assert_eq!(task.status(), TaskStatus::Canceled);
    assert_eq!(queue.len(), 0);

    queue.flush(1.0).unwrap();
    assert_eq!(runs.get(), 1);
}

#[test]
fn test_cancel_from_own_callback_stops_recurrence() {
    let (queue, _clock) = render_queue();
    let runs = Rc::new(Cell::new(0));
    let handle: Rc<RefCell<Option<Task<()>>>> = Default::default();
    let canceled = Rc::new(Cell::new(None));

    let task = {
        let runs = runs.clone();
        let handle = handle.clone();
        let canceled = canceled.clone();
        queue
            .queue_task(
                move |_| {
                    runs.set(runs.get() + 1);
                    if runs.get() == 2 {
                        let task = handle.borrow().clone().unwrap();
                        canceled.set(Some(task.cancel().unwrap()));
                    }
                    TaskStep::done()
                },
                QueueTaskOptions::new().persistent(),
            )
            .unwrap()
    };
    *handle.borrow_mut() = Some(task.clone());

    queue.flush(0.0).unwrap();
    queue.flush(1.0).unwrap();
    assert_eq!(canceled.get(), Some(true));
    assert_eq!(task.status(), TaskStatus::Canceled);
    assert!(!task.is_persistent());

    queue.flush(2.0).unwrap();
    assert_eq!(runs.get(), 2);
    assert!(queue.is_empty());
}

#[test]
fn test_persistent_delay_is_measured_from_each_run() {
    let (queue, clock) = render_queue();
    let runs = Rc::new(Cell::new(0));

    let task = queue
        .queue_task(
            counting(&runs),
            QueueTaskOptions::new().persistent().delay(10.0),
        )
        .unwrap();
    assert_eq!(task.queue_time(), 10.0);

    clock.set(10.0);
    queue.flush(10.0).unwrap();
    assert_eq!(runs.get(), 1);
    assert_eq!(task.created_time(), 10.0);
    assert_eq!(task.queue_time(), 20.0);

    clock.set(15.0);
    queue.flush(15.0).unwrap();
    assert_eq!(runs.get(), 1);

    clock.set(20.0);
    queue.flush(20.0).unwrap();
    assert_eq!(runs.get(), 2);
}

#[test]
fn test_each_result_request_waits_for_next_run() {
    let (queue, _clock) = render_queue();
    let runs = Rc::new(Cell::new(0u32));

    let task = {
        let runs = runs.clone();
        queue
            .queue_task(
                move |_| {
                    runs.set(runs.get() + 1);
                    TaskStep::ready(runs.get())
                },
                QueueTaskOptions::new().persistent(),
            )
            .unwrap()
    };

    queue.flush(0.0).unwrap();
    let mut next = task.result().unwrap();
    assert!(futures::FutureExt::now_or_never(&mut next).is_none());

    queue.flush(1.0).unwrap();
    assert_eq!(futures::executor::block_on(next).unwrap(), 2);
}
