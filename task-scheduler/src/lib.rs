//! Background task scheduler with activity-aware execution.
//!
//! Work is queued into four priority lanes and executed by per-lane worker
//! pools. The current activity mode gates which lanes run:
//!
//! - *HighActivity*: only Urgent tasks execute
//! - *LowActivity*: Urgent and Normal execute
//! - *SleepMode*: everything executes, including lifecycle transitions
//!
//! The mode is derived from request-path traffic at the moment a worker
//! asks: recent query heartbeats mean HighActivity, and the level relaxes
//! through the configured idle thresholds as the request path stays quiet
//! (workers re-check on their idle poll, so no background ticker is
//! needed). Every task carries a cancellation token; failed tasks retry
//! with exponential backoff and dead-letter after the retry budget.
//!
//! ```text
//! Query path ──heartbeat──▶ ActivityDetector ──▶ lane gating
//! submit(task) ──────────▶ TaskQueue ──▶ worker pools ──▶ TaskExecutor
//! ```

pub mod activity;
pub mod queue;
pub mod tasks;

pub use activity::{ActivityDetector, ActivityLevel};
pub use queue::{QueueStats, ScheduledTask, TaskPriority, TaskQueue};
pub use tasks::{DeadLetter, Task, TaskError, TaskExecutor};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::config::CoreConfig;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Maximum execution attempts before a task dead-letters.
const MAX_ATTEMPTS: u32 = 3;

/// Base delay of the retry backoff.
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Idle poll interval for workers with nothing to do.
const IDLE_POLL: Duration = Duration::from_millis(100);

fn lane_allowed(priority: TaskPriority, level: ActivityLevel, draining: bool) -> bool {
    if draining {
        // Shutdown drains Urgent and Normal regardless of activity.
        return matches!(priority, TaskPriority::Urgent | TaskPriority::Normal);
    }
    match level {
        ActivityLevel::HighActivity => priority == TaskPriority::Urgent,
        ActivityLevel::LowActivity => priority >= TaskPriority::Normal,
        ActivityLevel::SleepMode => true,
    }
}

/// The main task scheduler.
pub struct TaskScheduler {
    queue: Arc<Mutex<TaskQueue>>,
    detector: Arc<std::sync::Mutex<ActivityDetector>>,
    executor: Arc<dyn TaskExecutor>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    draining: Arc<AtomicBool>,
    dead_letters: Arc<std::sync::Mutex<Vec<DeadLetter>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Creates the scheduler and spawns its worker pools.
    pub fn new(executor: Arc<dyn TaskExecutor>, config: &CoreConfig) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            queue: Arc::new(Mutex::new(TaskQueue::new())),
            detector: Arc::new(std::sync::Mutex::new(ActivityDetector::new(
                Duration::from_secs(config.activity_low_threshold_s),
                Duration::from_secs(config.activity_sleep_threshold_s),
            ))),
            executor,
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            draining: Arc::new(AtomicBool::new(false)),
            dead_letters: Arc::new(std::sync::Mutex::new(Vec::new())),
            workers: std::sync::Mutex::new(Vec::new()),
        });

        let pools = [
            (TaskPriority::Urgent, config.scheduler_workers_urgent),
            (TaskPriority::Normal, config.scheduler_workers_normal),
            (TaskPriority::Low, config.scheduler_workers_low),
            (TaskPriority::Batch, config.scheduler_workers_batch),
        ];

        let mut handles = Vec::new();
        for (priority, count) in pools {
            for worker_id in 0..count.max(1) {
                handles.push(tokio::spawn(Self::worker_loop(
                    Arc::clone(&scheduler),
                    priority,
                    worker_id,
                )));
            }
        }
        *scheduler.workers.lock().expect("fresh mutex") = handles;

        scheduler
    }

    /// Submits a task. Returns its cancellation token.
    pub async fn submit(&self, task: Task) -> Result<CancellationToken, TaskError> {
        if self.shutdown.is_cancelled() {
            return Err(TaskError::SchedulerShutdown);
        }
        let cancel = self.shutdown.child_token();
        let handle = cancel.clone();
        self.queue.lock().await.push(ScheduledTask {
            task,
            cancel,
            attempts: 0,
        });
        self.notify.notify_waiters();
        Ok(handle)
    }

    /// Heartbeat from the request path; counts as traffic for the
    /// activity model.
    pub fn record_activity(&self) {
        if let Ok(mut detector) = self.detector.lock() {
            detector.heartbeat();
        }
    }

    /// Pins the activity mode until the next heartbeat.
    pub fn set_activity(&self, level: ActivityLevel) {
        if let Ok(mut detector) = self.detector.lock() {
            detector.pin(level);
        }
        // Lanes may just have opened up; wake any parked workers.
        self.notify.notify_waiters();
    }

    /// The current activity mode, derived at the moment of asking.
    pub fn activity(&self) -> ActivityLevel {
        self.detector
            .lock()
            .map(|detector| detector.level())
            .unwrap_or(ActivityLevel::LowActivity)
    }

    /// Pending-task counts per lane.
    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.lock().await.stats()
    }

    /// Tasks that exhausted their retry budget, for diagnostics.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    /// Graceful shutdown: drains Urgent and Normal, cancels everything else.
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        {
            let mut queue = self.queue.lock().await;
            let cancelled = queue.cancel_background();
            if cancelled > 0 {
                log::info!("cancelled {cancelled} background tasks at shutdown");
            }
        }
        self.notify.notify_waiters();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = self.queue_stats().await;
            if stats.urgent_count + stats.normal_count == 0 || Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.shutdown.cancel();
        self.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .map(|mut workers| workers.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn worker_loop(scheduler: Arc<Self>, priority: TaskPriority, worker_id: usize) {
        log::debug!("worker {priority:?}/{worker_id} started");
        loop {
            if scheduler.shutdown.is_cancelled() {
                break;
            }

            let level = scheduler.activity();
            let draining = scheduler.draining.load(Ordering::SeqCst);
            let item = if lane_allowed(priority, level, draining) {
                scheduler.queue.lock().await.pop(priority)
            } else {
                None
            };

            let Some(mut scheduled) = item else {
                tokio::select! {
                    _ = scheduler.notify.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = scheduler.shutdown.cancelled() => break,
                }
                continue;
            };

            if scheduled.cancel.is_cancelled() {
                continue;
            }

            loop {
                match scheduler
                    .executor
                    .execute(&scheduled.task, &scheduled.cancel)
                    .await
                {
                    Ok(()) => break,
                    Err(TaskError::Cancelled) => {
                        log::debug!("task {} cancelled", scheduled.task.name());
                        break;
                    }
                    Err(TaskError::SchedulerShutdown) => break,
                    Err(TaskError::Failed(message)) => {
                        scheduled.attempts += 1;
                        if scheduled.attempts >= MAX_ATTEMPTS {
                            log::warn!(
                                "task {} dead-lettered after {} attempts: {message}",
                                scheduled.task.name(),
                                scheduled.attempts
                            );
                            if let Ok(mut letters) = scheduler.dead_letters.lock() {
                                letters.push(DeadLetter {
                                    task_name: scheduled.task.name(),
                                    detail: format!("{:?}", scheduled.task),
                                    error: message,
                                    attempts: scheduled.attempts,
                                    at_ms: common::now_ms(),
                                });
                            }
                            break;
                        }
                        let backoff = RETRY_BASE * 2u32.pow(scheduled.attempts - 1);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = scheduled.cancel.cancelled() => break,
                        }
                    }
                }
            }
        }
        log::debug!("worker {priority:?}/{worker_id} stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::NodeId;
    use std::sync::atomic::AtomicUsize;

    struct CountingExecutor {
        executed: AtomicUsize,
        failures_before_success: AtomicUsize,
    }

    impl CountingExecutor {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                executed: AtomicUsize::new(0),
                failures_before_success: AtomicUsize::new(failures),
            })
        }
    }

    #[async_trait::async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self, _task: &Task, cancel: &CancellationToken) -> Result<(), TaskError> {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TaskError::Failed("transient".to_string()));
            }
            Ok(())
        }
    }

    fn embed_fast(id: &str) -> Task {
        Task::EmbedFast {
            message_id: NodeId::new(id),
            text: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_urgent_runs_during_high_activity() {
        let executor = CountingExecutor::new(0);
        let scheduler = TaskScheduler::new(executor.clone(), &CoreConfig::default());
        scheduler.set_activity(ActivityLevel::HighActivity);

        scheduler.submit(embed_fast("m1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_waits_for_sleep_mode() {
        let executor = CountingExecutor::new(0);
        let scheduler = TaskScheduler::new(executor.clone(), &CoreConfig::default());
        scheduler.set_activity(ActivityLevel::LowActivity);

        scheduler.submit(Task::Reconcile).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(executor.executed.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.queue_stats().await.batch_count, 1);

        scheduler.set_activity(ActivityLevel::SleepMode);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(executor.executed.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        // Fails forever: must land in the dead-letter store after 3 tries.
        let executor = CountingExecutor::new(usize::MAX / 2);
        let scheduler = TaskScheduler::new(executor.clone(), &CoreConfig::default());
        scheduler.set_activity(ActivityLevel::SleepMode);

        scheduler.submit(embed_fast("m1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let letters = scheduler.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task_name, "EmbedFast");
        assert_eq!(letters[0].attempts, MAX_ATTEMPTS);
        assert_eq!(executor.executed.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let executor = CountingExecutor::new(1);
        let scheduler = TaskScheduler::new(executor.clone(), &CoreConfig::default());
        scheduler.set_activity(ActivityLevel::SleepMode);

        scheduler.submit(embed_fast("m1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert!(scheduler.dead_letters().is_empty());
        assert_eq!(executor.executed.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_background() {
        let executor = CountingExecutor::new(0);
        let scheduler = TaskScheduler::new(executor.clone(), &CoreConfig::default());
        scheduler.set_activity(ActivityLevel::HighActivity);

        // Batch task never eligible under HighActivity.
        scheduler.submit(Task::Reconcile).await.unwrap();
        let token = scheduler.submit(Task::Reconcile).await.unwrap();

        scheduler.shutdown().await;
        assert!(token.is_cancelled());
        assert_eq!(executor.executed.load(Ordering::SeqCst), 0);

        let result = scheduler.submit(embed_fast("late")).await;
        assert!(matches!(result, Err(TaskError::SchedulerShutdown)));
    }
}
