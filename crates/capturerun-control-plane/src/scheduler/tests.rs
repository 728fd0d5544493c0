use super::*;

use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use capturerun_core::{ConversionStatus, PerformanceSample};

const WAIT: Duration = Duration::from_secs(5);

fn scheduler(
    max_running: usize,
    max_finished: usize,
) -> (Scheduler, watch::Sender<QueueLimits>, Arc<EventBus>) {
    let config = Config {
        abort_grace: Duration::from_millis(50),
        stall: StallConfig {
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            ..Config::default().stall
        },
        ..Config::default()
    };
    let events = Arc::new(EventBus::new(1024));
    let (limits_tx, limits_rx) = watch::channel(QueueLimits::new(max_running, max_finished));
    let scheduler = Scheduler::start(&config, Arc::clone(&events), limits_rx);
    (scheduler, limits_tx, events)
}

fn conversion(name: &str) -> NewTask {
    NewTask::new(TaskKind::Conversion, name)
}

/// Reports its start, then runs until released or cancelled.
struct Held {
    started: mpsc::UnboundedSender<TaskId>,
    release: CancellationToken,
}

#[async_trait]
impl Job for Held {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        let _ = self.started.send(ctx.task_id());
        tokio::select! {
            _ = self.release.cancelled() => Ok(()),
            _ = ctx.cancelled() => Err(JobError::Cancelled),
        }
    }
}

/// Sleeps while tracking how many jobs run at once.
struct Sleepy {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl Job for Sleepy {
    async fn run(&self, _ctx: JobContext) -> Result<(), JobError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Reports some progress and succeeds.
struct Quick;

#[async_trait]
impl Job for Quick {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        ctx.update_status_with_progress(ConversionStatus::Downloading, 10)?;
        ctx.increment_progress_by(5)?;
        assert_eq!(ctx.snapshot().progress, 15);
        assert!(ctx.update_status(ConversionStatus::Complete).is_err());
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl Job for Failing {
    async fn run(&self, _ctx: JobContext) -> Result<(), JobError> {
        Err(JobError::Capture("disk full".into()))
    }
}

struct Panicking;

#[async_trait]
impl Job for Panicking {
    async fn run(&self, _ctx: JobContext) -> Result<(), JobError> {
        panic!("capturer crashed");
    }
}

/// Never looks at its cancellation token.
struct Stubborn {
    started: mpsc::UnboundedSender<TaskId>,
}

#[async_trait]
impl Job for Stubborn {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        let _ = self.started.send(ctx.task_id());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Feeds idle samples until the stall detector trips.
struct Stalling {
    stalled: mpsc::UnboundedSender<bool>,
    release: CancellationToken,
}

#[async_trait]
impl Job for Stalling {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        let base = chrono::Utc::now();
        let mut stalled = false;
        for i in 0..2 {
            let sample = PerformanceSample::new(1, base + chrono::Duration::seconds(i))
                .with_cpu(0)
                .with_net(0);
            stalled = ctx.record_performance(&sample);
        }
        let _ = self.stalled.send(stalled);
        tokio::select! {
            _ = self.release.cancelled() => Ok(()),
            _ = ctx.cancelled() => Err(JobError::Cancelled),
        }
    }
}

fn held(
    queue: &Scheduler,
    started: &mpsc::UnboundedSender<TaskId>,
    release: &CancellationToken,
) -> TaskId {
    queue
        .add_task(
            conversion("held"),
            Held {
                started: started.clone(),
                release: release.clone(),
            },
        )
        .unwrap()
        .id
}

async fn next_started(rx: &mut mpsc::UnboundedReceiver<TaskId>) -> TaskId {
    timeout(WAIT, rx.recv())
        .await
        .expect("no task started")
        .expect("channel closed")
}

async fn wait_finished(queue: &Scheduler, id: TaskId) -> TaskState {
    timeout(WAIT, async {
        loop {
            if let Some(task) = queue.find_task_by_id(id) {
                if task.meta() == MetaStatus::Finished {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not finish")
}

fn waiting_ids(queue: &Scheduler) -> Vec<TaskId> {
    queue.get_tasks(TaskFilter::Waiting).ids()
}

#[tokio::test]
async fn test_added_task_is_waiting_with_queued_timestamp() {
    let (queue, _limits, events) = scheduler(1, 10);
    let mut rx = events.subscribe().unwrap();
    let (started, _started_rx) = mpsc::unbounded_channel();
    let release = CancellationToken::new();

    let first = held(&queue, &started, &release);
    let second = queue
        .add_task(
            conversion("second").with_record(9),
            Held {
                started: started.clone(),
                release: release.clone(),
            },
        )
        .unwrap();

    assert_eq!(second.meta(), MetaStatus::Waiting);
    assert!(second.queued > 0);
    assert_eq!(second.started, 0);
    assert_eq!(second.record_id, Some(9));
    assert!(second.id > first);

    let event = rx.recv().await.unwrap();
    assert!(matches!(event, TaskEvent::Added { ref task } if task.id == first));
    release.cancel();
}

#[tokio::test]
async fn test_fifo_admission() {
    let (queue, _limits, _events) = scheduler(1, 10);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let releases: Vec<CancellationToken> = (0..3).map(|_| CancellationToken::new()).collect();
    let ids: Vec<TaskId> = releases.iter().map(|r| held(&queue, &tx, r)).collect();

    for (expected, release) in ids.iter().zip(&releases) {
        assert_eq!(next_started(&mut rx).await, *expected);
        assert!(rx.try_recv().is_err());
        release.cancel();
    }
    timeout(WAIT, queue.wait_until_idle()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_jobs_three_workers_two_retained() {
    let (queue, _limits, events) = scheduler(3, 2);
    let mut rx = events.subscribe().unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..10 {
        queue
            .add_task(
                conversion(&format!("app {i}")),
                Sleepy {
                    running: Arc::clone(&running),
                    peak: Arc::clone(&peak),
                    delay: Duration::from_millis(20),
                },
            )
            .unwrap();
    }
    timeout(WAIT, queue.wait_until_idle()).await.unwrap();

    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak concurrency {peak}");

    let mut removed = 0;
    let mut completion_order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            TaskEvent::Removed { .. } => removed += 1,
            TaskEvent::Updated { task, .. } if task.is_terminal() => {
                assert_eq!(task.status, TaskStatus::from(ConversionStatus::Complete));
                completion_order.push(task.id);
            }
            _ => {}
        }
    }
    assert_eq!(removed, 8);
    assert_eq!(completion_order.len(), 10);

    let mut last_two = completion_order[8..].to_vec();
    last_two.sort();
    assert_eq!(queue.get_tasks(TaskFilter::Finished).ids(), last_two);
    assert_eq!(queue.get_all_tasks().len(), 2);
}

#[tokio::test]
async fn test_reorder_only_waiting_tasks() {
    let (queue, _limits, events) = scheduler(1, 10);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let release = CancellationToken::new();
    let hold_a = CancellationToken::new();

    let a = held(&queue, &tx, &hold_a);
    assert_eq!(next_started(&mut rx).await, a);
    let b = held(&queue, &tx, &release);
    let c = held(&queue, &tx, &release);
    let d = held(&queue, &tx, &release);
    let mut sub = events.subscribe().unwrap();

    assert!(queue.move_to_head(d));
    assert_eq!(waiting_ids(&queue), vec![d, b, c]);
    assert!(matches!(sub.recv().await.unwrap(), TaskEvent::MovedToHead { task } if task.id == d));

    assert!(!queue.move_to_head(a));
    assert!(!queue.move_to_tail(TaskId::new(999)));

    assert!(queue.move_to_tail(d));
    assert_eq!(waiting_ids(&queue), vec![b, c, d]);
    assert!(matches!(sub.recv().await.unwrap(), TaskEvent::MovedToTail { task } if task.id == d));

    assert!(queue.move_before(d, c));
    assert_eq!(waiting_ids(&queue), vec![b, d, c]);
    assert!(matches!(
        sub.recv().await.unwrap(),
        TaskEvent::MovedAfter { task, after } if task.id == d && after == b
    ));

    assert!(queue.move_after(b, c));
    assert_eq!(waiting_ids(&queue), vec![d, c, b]);
    assert!(matches!(
        sub.recv().await.unwrap(),
        TaskEvent::MovedAfter { task, after } if task.id == b && after == c
    ));

    assert!(!queue.move_before(a, b));
    assert!(!queue.move_after(b, b));
    assert!(!queue.move_after(b, a));

    release.cancel();
    hold_a.cancel();
    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(next_started(&mut rx).await);
    }
    assert_eq!(order, vec![d, c, b]);
    timeout(WAIT, queue.wait_until_idle()).await.unwrap();
}

#[tokio::test]
async fn test_abort_waiting_task_never_runs() {
    let (queue, _limits, _events) = scheduler(1, 10);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let release = CancellationToken::new();

    let a = held(&queue, &tx, &release);
    assert_eq!(next_started(&mut rx).await, a);
    let b = held(&queue, &tx, &release);

    let aborted = queue.abort_task(b).unwrap();
    assert_eq!(aborted.meta(), MetaStatus::Finished);
    assert_eq!(aborted.status, TaskStatus::cancelled(TaskKind::Conversion));
    assert!(aborted.aborted);
    assert_eq!(aborted.progress, -1);
    assert_eq!(aborted.started, 0);
    assert!(aborted.finished >= aborted.queued);

    release.cancel();
    timeout(WAIT, queue.wait_until_idle()).await.unwrap();
    assert!(rx.try_recv().is_err());

    // idempotent
    assert_eq!(queue.abort_task(b).unwrap(), aborted);
    assert!(queue.abort_task(TaskId::new(999)).is_none());
}

#[tokio::test]
async fn test_abort_running_task() {
    let (queue, _limits, _events) = scheduler(2, 10);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let never = CancellationToken::new();

    let a = held(&queue, &tx, &never);
    assert_eq!(next_started(&mut rx).await, a);

    let signalled = queue.abort_task(a).unwrap();
    assert!(signalled.aborted);
    assert_eq!(signalled.meta(), MetaStatus::Running);

    let done = wait_finished(&queue, a).await;
    assert!(done.aborted);
    assert_eq!(done.progress, -1);
    assert_eq!(done.status, TaskStatus::cancelled(TaskKind::Conversion));
    assert!(done.last_error.is_none());
    assert!(done.started <= done.finished);
}

#[tokio::test]
async fn test_job_ignoring_cancellation_is_forced_to_finish() {
    let (queue, _limits, _events) = scheduler(1, 10);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = queue.add_task(conversion("stubborn"), Stubborn { started: tx }).unwrap().id;
    assert_eq!(next_started(&mut rx).await, id);

    queue.abort_task(id);
    let done = wait_finished(&queue, id).await;
    assert!(done.aborted);
    assert_eq!(done.progress, -1);
}

#[tokio::test]
async fn test_failures_are_recorded_and_slot_returned() {
    let (queue, _limits, _events) = scheduler(1, 10);
    let failed = queue.add_task(conversion("fails"), Failing).unwrap().id;
    let panicked = queue.add_task(conversion("panics"), Panicking).unwrap().id;
    let ok = queue.add_task(conversion("works"), Quick).unwrap().id;

    timeout(WAIT, queue.wait_until_idle()).await.unwrap();

    let failed = queue.find_task_by_id(failed).unwrap();
    assert_eq!(failed.status, TaskStatus::failed(TaskKind::Conversion));
    assert!(failed.last_error.as_deref().unwrap().contains("disk full"));
    assert!(!failed.aborted);

    let panicked = queue.find_task_by_id(panicked).unwrap();
    assert_eq!(panicked.status, TaskStatus::failed(TaskKind::Conversion));
    assert!(panicked.last_error.is_some());

    let ok = queue.find_task_by_id(ok).unwrap();
    assert_eq!(ok.status, TaskStatus::completed(TaskKind::Conversion));
    assert_eq!(ok.progress, 100);
}

#[tokio::test]
async fn test_cleanup() {
    let (queue, _limits, events) = scheduler(1, 10);
    let first = queue.add_task(conversion("one"), Quick).unwrap().id;
    let second = queue.add_task(conversion("two"), Quick).unwrap().id;
    timeout(WAIT, queue.wait_until_idle()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let release = CancellationToken::new();
    let running = held(&queue, &tx, &release);
    assert_eq!(next_started(&mut rx).await, running);
    let mut sub = events.subscribe().unwrap();

    assert!(!queue.cleanup_task(running));
    assert!(queue.cleanup_task(first));
    assert!(!queue.cleanup_task(first));
    assert!(matches!(sub.recv().await.unwrap(), TaskEvent::Removed { task } if task.id == first));

    let removed = queue.cleanup();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].id, second);
    assert_eq!(queue.get_all_tasks().ids(), vec![running]);
    release.cancel();
}

#[tokio::test]
async fn test_get_all_tasks_ordering() {
    let (queue, _limits, _events) = scheduler(1, 10);
    let done = queue.add_task(conversion("done"), Quick).unwrap().id;
    timeout(WAIT, queue.wait_until_idle()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let release = CancellationToken::new();
    let running = held(&queue, &tx, &release);
    assert_eq!(next_started(&mut rx).await, running);
    let b = held(&queue, &tx, &release);
    let c = held(&queue, &tx, &release);
    assert!(queue.move_to_head(c));

    let view = queue.get_all_tasks();
    assert_eq!(view.ids(), vec![done, running, c, b]);
    // views are restartable
    assert_eq!(view.iter().count(), 4);
    assert_eq!((&view).into_iter().count(), 4);
    assert_eq!(queue.get_tasks(TaskFilter::NotFinished).len(), 3);
    assert_eq!(queue.get_tasks(TaskFilter::Running).ids(), vec![running]);
    assert_eq!(
        queue.get_tasks(TaskFilter::Kind(TaskKind::ManualModeBuild)).len(),
        0
    );
    release.cancel();
}

#[tokio::test]
async fn test_active_tasks_for_record() {
    let (queue, _limits, _events) = scheduler(1, 10);
    queue.add_task(conversion("old").with_record(7), Quick).unwrap();
    timeout(WAIT, queue.wait_until_idle()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let release = CancellationToken::new();
    let running = queue
        .add_task(
            conversion("current").with_record(7),
            Held {
                started: tx.clone(),
                release: release.clone(),
            },
        )
        .unwrap()
        .id;
    assert_eq!(next_started(&mut rx).await, running);
    queue
        .add_task(
            conversion("other").with_record(8),
            Held {
                started: tx.clone(),
                release: release.clone(),
            },
        )
        .unwrap();

    let active: Vec<TaskId> = queue
        .find_active_tasks_for_record(7)
        .into_iter()
        .map(|task| task.id)
        .collect();
    assert_eq!(active, vec![running]);
    assert_eq!(queue.count_active_tasks_for_record(8), 1);
    assert_eq!(queue.get_tasks(TaskFilter::Record(7)).len(), 2);
    release.cancel();
}

#[tokio::test]
async fn test_shutdown_waits_for_queued_work() {
    let (queue, _limits, _events) = scheduler(1, 10);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let ids: Vec<TaskId> = (0..3)
        .map(|i| {
            queue
                .add_task(
                    conversion(&format!("app {i}")),
                    Sleepy {
                        running: Arc::clone(&running),
                        peak: Arc::clone(&peak),
                        delay: Duration::from_millis(10),
                    },
                )
                .unwrap()
                .id
        })
        .collect();

    timeout(WAIT, queue.graceful_shutdown(true)).await.unwrap();

    for id in ids {
        let task = queue.find_task_by_id(id).unwrap();
        assert_eq!(task.status, TaskStatus::completed(TaskKind::Conversion));
    }
    assert!(matches!(
        queue.add_task(conversion("late"), Quick),
        Err(SchedulerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_shutdown_without_waiting_aborts_everything() {
    let (queue, _limits, _events) = scheduler(1, 10);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let never = CancellationToken::new();
    let a = held(&queue, &tx, &never);
    assert_eq!(next_started(&mut rx).await, a);
    let b = held(&queue, &tx, &never);

    queue.graceful_shutdown(false).await;
    let b = queue.find_task_by_id(b).unwrap();
    assert!(b.aborted);
    assert_eq!(b.meta(), MetaStatus::Finished);

    timeout(WAIT, queue.wait_until_idle()).await.unwrap();
    let a = queue.find_task_by_id(a).unwrap();
    assert!(a.aborted);
    assert_eq!(a.progress, -1);
}

#[tokio::test]
async fn test_limits_are_reloaded_live() {
    let (queue, limits, _events) = scheduler(1, 10);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let release_a = CancellationToken::new();
    let release_b = CancellationToken::new();
    let a = held(&queue, &tx, &release_a);
    let b = held(&queue, &tx, &release_b);
    assert_eq!(next_started(&mut rx).await, a);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());

    limits.send(QueueLimits::new(2, 10)).unwrap();
    assert_eq!(next_started(&mut rx).await, b);
    assert_eq!(queue.limits().running(), 2);
    release_a.cancel();
    wait_finished(&queue, a).await;
    release_b.cancel();
    timeout(WAIT, queue.wait_until_idle()).await.unwrap();

    // lowering the retention cap evicts right away
    limits.send(QueueLimits::new(2, 1)).unwrap();
    timeout(WAIT, async {
        while queue.get_tasks(TaskFilter::Finished).len() > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(queue.get_all_tasks().ids(), vec![b]);
}

#[tokio::test]
async fn test_unstall_conversion() {
    let (queue, _limits, _events) = scheduler(2, 10);
    let (stalled_tx, mut stalled_rx) = mpsc::unbounded_channel();
    let release = CancellationToken::new();
    let id = queue
        .add_task(
            conversion("idle installer"),
            Stalling {
                stalled: stalled_tx,
                release: release.clone(),
            },
        )
        .unwrap()
        .id;

    assert!(timeout(WAIT, stalled_rx.recv()).await.unwrap().unwrap());
    assert!(queue.find_task_by_id(id).unwrap().stalled);

    let unstalled = queue.unstall(id).unwrap();
    assert!(!unstalled.stalled);

    // only conversions carry a stall window
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manual = queue
        .add_task(
            NewTask::new(TaskKind::ManualModeBuild, "manual"),
            Held {
                started: tx,
                release: release.clone(),
            },
        )
        .unwrap()
        .id;
    assert_eq!(next_started(&mut rx).await, manual);
    assert!(queue.unstall(manual).is_none());
    assert!(queue.unstall(TaskId::new(999)).is_none());

    release.cancel();
    let done = wait_finished(&queue, id).await;
    assert!(!done.stalled);
    assert!(queue.unstall(id).is_none());
}
