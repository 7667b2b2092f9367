//! Backoff timer scheduler

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use super::{BackoffTask, TaskError, TaskOutcome};
use crate::reliability::{Backoff, BackoffConfig};
use crate::work::panic_message;

/// Identifier of a task registered with a [`BackoffTimer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerTaskId(u64);

impl fmt::Display for TimerTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-task-{}", self.0)
    }
}

struct ScheduledTask {
    task: Arc<dyn BackoffTask>,
    backoff: Backoff,
    next_run: Instant,
}

struct TimerShared {
    tasks: Mutex<BTreeMap<TimerTaskId, ScheduledTask>>,
    schedule_changed: Notify,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

/// Scheduler for [`BackoffTask`]s
///
/// Each registered task carries its own [`Backoff`]. Tasks may be scheduled
/// before or after [`start`](Self::start); the first run of a task happens
/// one minimum interval after it was scheduled.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use taskmesh_dispatch::BackoffConfig;
/// use taskmesh_dispatch::timer::{BackoffTask, BackoffTimer, TaskError, TaskOutcome};
///
/// struct Noop;
///
/// #[async_trait]
/// impl BackoffTask for Noop {
///     fn name(&self) -> &str { "noop" }
///     async fn execute(&self) -> Result<TaskOutcome, TaskError> { Ok(TaskOutcome::Idle) }
/// }
///
/// # #[tokio::main]
/// # async fn main() {
/// let timer = BackoffTimer::new();
/// let id = timer.schedule(Arc::new(Noop), BackoffConfig::default());
/// timer.start();
/// assert!(timer.interval_of(id).is_some());
/// timer.shutdown().await;
/// # }
/// ```
pub struct BackoffTimer {
    shared: Arc<TimerShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Default for BackoffTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffTimer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                tasks: Mutex::new(BTreeMap::new()),
                schedule_changed: Notify::new(),
                cancel: CancellationToken::new(),
                next_id: AtomicU64::new(1),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Register a task; it first runs one minimum interval from now
    pub fn schedule(&self, task: Arc<dyn BackoffTask>, config: BackoffConfig) -> TimerTaskId {
        let id = TimerTaskId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let backoff = Backoff::new(config);
        let next_run = Instant::now() + backoff.current();

        debug!(
            task = task.name(),
            %id,
            first_run_in_ms = backoff.current().as_millis() as u64,
            "Scheduled timer task"
        );
        self.shared.tasks.lock().insert(
            id,
            ScheduledTask {
                task,
                backoff,
                next_run,
            },
        );
        self.shared.schedule_changed.notify_one();
        id
    }

    /// Remove a task; a run already in progress still completes
    pub fn unschedule(&self, id: TimerTaskId) -> bool {
        let removed = self.shared.tasks.lock().remove(&id).is_some();
        if removed {
            self.shared.schedule_changed.notify_one();
        }
        removed
    }

    /// Current interval of a task
    pub fn interval_of(&self, id: TimerTaskId) -> Option<Duration> {
        self.shared
            .tasks
            .lock()
            .get(&id)
            .map(|scheduled| scheduled.backoff.current())
    }

    /// Number of scheduled tasks
    pub fn task_count(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Start the scheduler; calling it again has no effect
    pub fn start(&self) {
        let mut driver = self.driver.lock();
        if driver.is_some() || self.shared.cancel.is_cancelled() {
            return;
        }
        info!(tasks = self.task_count(), "Starting backoff timer");
        let shared = Arc::clone(&self.shared);
        *driver = Some(tokio::spawn(shared.drive()));
    }

    pub fn is_running(&self) -> bool {
        self.driver
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop scheduling and wait for an in-flight run to finish
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Backoff timer driver terminated abnormally");
            }
        }
        info!("Backoff timer stopped");
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl TimerShared {
    async fn drive(self: Arc<Self>) {
        loop {
            let earliest = self.tasks.lock().values().map(|t| t.next_run).min();
            let changed = self.schedule_changed.notified();
            let wake_at = async {
                match earliest {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = changed => continue,
                _ = wake_at => {}
            }

            self.run_due().await;
        }
        debug!("Backoff timer driver exited");
    }

    /// Run every task whose time has come, earliest first
    async fn run_due(&self) {
        while !self.cancel.is_cancelled() {
            let due = {
                let tasks = self.tasks.lock();
                let now = Instant::now();
                tasks
                    .iter()
                    .filter(|(_, scheduled)| scheduled.next_run <= now)
                    .min_by_key(|(_, scheduled)| scheduled.next_run)
                    .map(|(id, scheduled)| (*id, Arc::clone(&scheduled.task)))
            };
            let Some((id, task)) = due else {
                return;
            };

            let outcome = run_once(task.as_ref()).await;

            let mut tasks = self.tasks.lock();
            // The task may have been unscheduled while it ran
            if let Some(scheduled) = tasks.get_mut(&id) {
                match outcome {
                    TaskOutcome::Worked => scheduled.backoff.reset(),
                    TaskOutcome::Idle => {
                        scheduled.backoff.increase();
                    }
                }
                scheduled.next_run = Instant::now() + scheduled.backoff.current();
                trace!(
                    task = task.name(),
                    ?outcome,
                    next_run_in_ms = scheduled.backoff.current().as_millis() as u64,
                    "Timer task rescheduled"
                );
            }
        }
    }
}

/// Run a task once, mapping errors and panics to `Idle`
async fn run_once(task: &dyn BackoffTask) -> TaskOutcome {
    let result = match AssertUnwindSafe(task.execute()).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(task = task.name(), error = %e, "Timer task failed");
            TaskOutcome::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    /// Returns scripted outcomes and records the instant of every run
    struct ScriptedTask {
        script: Mutex<VecDeque<Result<TaskOutcome, String>>>,
        runs: Mutex<Vec<Instant>>,
    }

    impl ScriptedTask {
        fn new(script: Vec<Result<TaskOutcome, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                runs: Mutex::new(Vec::new()),
            })
        }

        fn gaps_ms(&self, origin: Instant) -> Vec<u64> {
            let runs = self.runs.lock();
            let mut previous = origin;
            runs.iter()
                .map(|&at| {
                    let gap = at.duration_since(previous).as_millis() as u64;
                    previous = at;
                    gap
                })
                .collect()
        }
    }

    #[async_trait]
    impl BackoffTask for ScriptedTask {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self) -> Result<TaskOutcome, TaskError> {
            self.runs.lock().push(Instant::now());
            match self.script.lock().pop_front() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(message)) if message == "panic" => panic!("scripted panic"),
                Some(Err(message)) => Err(TaskError::failed(message)),
                None => Ok(TaskOutcome::Idle),
            }
        }
    }

    fn config() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(10), 2.0)
    }

    fn assert_gaps(actual: &[u64], expected: &[u64]) {
        assert!(actual.len() >= expected.len(), "only {} runs: {actual:?}", actual.len());
        for (gap, want) in actual.iter().zip(expected) {
            assert!(
                *gap >= *want && *gap <= *want + 5,
                "gap {gap}ms, expected {want}ms (all gaps: {actual:?})"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_doubles_and_work_resets() {
        use TaskOutcome::*;
        let task = ScriptedTask::new(vec![
            Ok(Idle),
            Ok(Idle),
            Ok(Idle),
            Ok(Idle),
            Ok(Worked),
            Ok(Idle),
        ]);
        let timer = BackoffTimer::new();
        let origin = Instant::now();
        let id = timer.schedule(task.clone(), config());
        timer.start();

        tokio::time::sleep(Duration::from_millis(3_250)).await;
        timer.shutdown().await;

        // First run after the minimum, then 200, 400, 800, 1600, reset to 100
        assert_gaps(&task.gaps_ms(origin), &[100, 200, 400, 800, 1600, 100]);
        assert!(timer.interval_of(id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_caps_at_ceiling() {
        let task = ScriptedTask::new(vec![]);
        let timer = BackoffTimer::new();
        let id = timer.schedule(
            task.clone(),
            BackoffConfig::new(Duration::from_millis(100), Duration::from_millis(300), 2.0),
        );
        timer.start();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(timer.interval_of(id), Some(Duration::from_millis(300)));
        timer.shutdown().await;
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_errors_and_panics_count_as_idle() {
        let task = ScriptedTask::new(vec![
            Err("store unavailable".to_string()),
            Err("panic".to_string()),
            Ok(TaskOutcome::Worked),
        ]);
        let timer = BackoffTimer::new();
        let origin = Instant::now();
        timer.schedule(task.clone(), config());
        timer.start();

        tokio::time::sleep(Duration::from_millis(900)).await;
        timer.shutdown().await;

        // Error grows to 200, panic to 400, then work resets to 100
        assert_gaps(&task.gaps_ms(origin), &[100, 200, 400, 100]);
    }

    /// Records whether two runs of any task overlap
    struct ExclusiveTask {
        running: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
        runs: AtomicU64,
    }

    #[async_trait]
    impl BackoffTask for ExclusiveTask {
        fn name(&self) -> &str {
            "exclusive"
        }

        async fn execute(&self) -> Result<TaskOutcome, TaskError> {
            if self.running.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.running.store(false, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(TaskOutcome::Worked)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_sequentially() {
        let running = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let first = Arc::new(ExclusiveTask {
            running: Arc::clone(&running),
            overlapped: Arc::clone(&overlapped),
            runs: AtomicU64::new(0),
        });
        let second = Arc::new(ExclusiveTask {
            running,
            overlapped: Arc::clone(&overlapped),
            runs: AtomicU64::new(0),
        });

        let timer = BackoffTimer::new();
        timer.schedule(first.clone(), config());
        timer.schedule(second.clone(), config());
        timer.start();

        tokio::time::sleep(Duration::from_secs(2)).await;
        timer.shutdown().await;

        assert!(!overlapped.load(Ordering::SeqCst));
        assert!(first.runs.load(Ordering::SeqCst) >= 3);
        assert!(second.runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_start_and_unschedule() {
        let timer = BackoffTimer::new();
        timer.start();
        timer.start();
        assert!(timer.is_running());

        let task = ScriptedTask::new(vec![]);
        let id = timer.schedule(task.clone(), config());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(task.runs.lock().len(), 1);

        assert!(timer.unschedule(id));
        assert!(!timer.unschedule(id));
        assert_eq!(timer.interval_of(id), None);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(task.runs.lock().len(), 1);
        timer.shutdown().await;
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_runs_after_shutdown() {
        let task = ScriptedTask::new(vec![]);
        let timer = BackoffTimer::new();
        timer.schedule(task.clone(), config());
        timer.start();
        timer.shutdown().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(task.runs.lock().is_empty());

        // A stopped timer cannot be restarted
        timer.start();
        assert!(!timer.is_running());
    }
}
