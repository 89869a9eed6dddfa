//! Task scheduler: cooperative periodic task runner.
//!
//! Registered tasks run on the tokio runtime, at most one execution per task
//! in flight. A task becomes due at `last_completion + periodicity` (or at
//! registration plus its initial delay) and is dispatched by a poll loop when
//! a worker slot is free. Failures are logged and the task is rescheduled at
//! its normal interval; retries come from periodicity alone.
//!
//! Worker slots: `max_workers` bounds concurrent executions. Long-running
//! tasks may hold at most `max_workers - min_workers` of them (at least one),
//! so short periodic tasks always find a slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bluepeer_core::config::SchedulerConfig;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

#[async_trait]
pub trait Task: Send + Sync {
    /// Unique per scheduler.
    fn name(&self) -> &str;
    async fn execute(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSchedule {
    pub periodicity: Duration,
    /// One-time delay before the first run.
    pub delay: Option<Duration>,
    /// Exempt from overlap-timeout eviction.
    pub long_running: bool,
}

impl TaskSchedule {
    pub fn every(periodicity: Duration) -> Self {
        Self {
            periodicity,
            delay: None,
            long_running: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task {0} is already registered")]
    DuplicateTask(String),
}

/// Point-in-time view of one registered task.
#[derive(Debug, Clone)]
pub struct TaskStats {
    pub name: String,
    pub runs: u64,
    pub failures: u64,
    pub running: bool,
    pub last_completion: Option<Instant>,
}

// ── Entries ──────────────────────────────────────────────────────────────────

struct RunState {
    next_run: Instant,
    last_completion: Option<Instant>,
    started: Option<Instant>,
    abort: Option<AbortHandle>,
    runs: u64,
    failures: u64,
}

struct Entry {
    task: Arc<dyn Task>,
    schedule: TaskSchedule,
    state: Mutex<RunState>,
    running: watch::Sender<bool>,
    removed: AtomicBool,
}

impl Entry {
    fn state(&self) -> MutexGuard<'_, RunState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }
}

struct Inner {
    entries: DashMap<String, Arc<Entry>>,
    pool: Arc<Semaphore>,
    long_running: Arc<Semaphore>,
    poll_interval: Duration,
    overlap_timeout: Duration,
    shutdown: broadcast::Sender<()>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let max = config.max_workers.max(1);
        let long_slots = max.saturating_sub(config.min_workers).max(1);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                pool: Arc::new(Semaphore::new(max)),
                long_running: Arc::new(Semaphore::new(long_slots)),
                poll_interval: config.poll_interval(),
                overlap_timeout: config.overlap_timeout(),
                shutdown,
                poller: Mutex::new(None),
            }),
        }
    }

    /// Register a task. It first becomes due after its delay (immediately if
    /// none).
    pub fn register(
        &self,
        task: Arc<dyn Task>,
        schedule: TaskSchedule,
    ) -> Result<(), SchedulerError> {
        let name = task.name().to_string();
        let entry = Arc::new(Entry {
            task,
            schedule,
            state: Mutex::new(RunState {
                next_run: Instant::now() + schedule.delay.unwrap_or_default(),
                last_completion: None,
                started: None,
                abort: None,
                runs: 0,
                failures: 0,
            }),
            running: watch::channel(false).0,
            removed: AtomicBool::new(false),
        });
        match self.inner.entries.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SchedulerError::DuplicateTask(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                tracing::debug!(task = %name, periodicity = ?schedule.periodicity, "task registered");
                Ok(())
            }
        }
    }

    /// Stop tracking a task. With `graceful`, waits for an in-flight
    /// execution to finish first; otherwise returns at once and lets the
    /// execution run out untracked. Returns false if no such task.
    pub async fn remove(&self, name: &str, graceful: bool) -> bool {
        let Some((_, entry)) = self.inner.entries.remove(name) else {
            return false;
        };
        {
            let _state = entry.state();
            entry.removed.store(true, Ordering::SeqCst);
        }
        if graceful {
            let mut running = entry.running.subscribe();
            if running.wait_for(|r| !*r).await.is_err() {
                tracing::debug!(task = name, "task state channel closed");
            }
        }
        tracing::debug!(task = name, graceful, "task removed");
        true
    }

    /// Start the poll loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut poller = match self.inner.poller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.subscribe();
        *poller = Some(tokio::spawn(poll_loop(inner, shutdown)));
        tracing::info!(
            workers = self.inner.pool.available_permits(),
            "task scheduler started"
        );
    }

    /// Stop the poll loop, abort in-flight executions and forget every task.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
        if let Ok(mut poller) = self.inner.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
        for entry in self.inner.entries.iter() {
            let state = entry.state();
            if let Some(abort) = &state.abort {
                abort.abort();
            }
            entry.removed.store(true, Ordering::SeqCst);
        }
        self.inner.entries.clear();
        tracing::info!("task scheduler shut down");
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.entries.contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inner
            .entries
            .get(name)
            .map(|e| e.is_running())
            .unwrap_or(false)
    }

    pub fn stats(&self, name: &str) -> Option<TaskStats> {
        self.inner.entries.get(name).map(|e| {
            let state = e.state();
            TaskStats {
                name: name.to_string(),
                runs: state.runs,
                failures: state.failures,
                running: e.is_running(),
                last_completion: state.last_completion,
            }
        })
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

// ── Poll loop ────────────────────────────────────────────────────────────────

async fn poll_loop(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(inner.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("scheduler poll loop stopping");
                return;
            }
            _ = interval.tick() => poll_once(&inner),
        }
    }
}

fn poll_once(inner: &Inner) {
    let now = Instant::now();
    let entries: Vec<Arc<Entry>> = inner.entries.iter().map(|e| e.value().clone()).collect();

    for entry in entries {
        if entry.is_running() {
            evict_if_overrun(inner, &entry, now);
            continue;
        }
        if entry.state().next_run > now {
            continue;
        }
        let Ok(worker) = inner.pool.clone().try_acquire_owned() else {
            tracing::trace!("no free worker slot");
            return;
        };
        let long_slot = if entry.schedule.long_running {
            match inner.long_running.clone().try_acquire_owned() {
                Ok(p) => Some(p),
                Err(_) => continue,
            }
        } else {
            None
        };
        dispatch(entry, worker, long_slot);
    }
}

fn evict_if_overrun(inner: &Inner, entry: &Entry, now: Instant) {
    if entry.schedule.long_running {
        return;
    }
    let state = entry.state();
    let overran = state
        .started
        .is_some_and(|started| now.duration_since(started) > inner.overlap_timeout);
    if let (true, Some(abort)) = (overran, &state.abort) {
        tracing::warn!(task = entry.task.name(), "task overran its timeout, evicting");
        abort.abort();
    }
}

fn dispatch(entry: Arc<Entry>, worker: OwnedSemaphorePermit, long_slot: Option<OwnedSemaphorePermit>) {
    let mut state = entry.state();
    if entry.removed.load(Ordering::SeqCst) {
        return;
    }
    entry.running.send_replace(true);
    state.started = Some(Instant::now());

    let task = entry.task.clone();
    let execution = tokio::spawn(async move { task.execute().await });
    state.abort = Some(execution.abort_handle());
    drop(state);

    let supervised = entry.clone();
    tokio::spawn(async move {
        let name = supervised.task.name();
        let failed = match execution.await {
            Ok(Ok(())) => {
                tracing::trace!(task = name, "task run complete");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(task = name, error = %e, "task run failed");
                true
            }
            Err(e) if e.is_cancelled() => {
                tracing::warn!(task = name, "task run aborted");
                true
            }
            Err(e) => {
                tracing::error!(task = name, error = %e, "task run panicked");
                true
            }
        };
        drop(worker);
        drop(long_slot);

        let now = Instant::now();
        {
            let mut state = supervised.state();
            state.last_completion = Some(now);
            state.next_run = now + supervised.schedule.periodicity;
            state.started = None;
            state.abort = None;
            state.runs += 1;
            if failed {
                state.failures += 1;
            }
        }
        supervised.running.send_replace(false);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(min: usize, max: usize, overlap_secs: u64) -> SchedulerConfig {
        SchedulerConfig {
            min_workers: min,
            max_workers: max,
            poll_interval_ms: 5,
            overlap_timeout_secs: overlap_secs,
        }
    }

    struct Counting {
        name: String,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        work: Duration,
        fail: bool,
    }

    impl Counting {
        fn new(name: &str, work: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                runs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                work,
                fail: false,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                runs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                work: Duration::ZERO,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Task for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("scripted failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn task_runs_within_two_periods() {
        let scheduler = TaskScheduler::new(&config(1, 2, 600));
        let task = Counting::new("tick", Duration::ZERO);
        scheduler
            .register(task.clone(), TaskSchedule::every(Duration::from_millis(100)))
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(task.runs.load(Ordering::SeqCst) >= 1);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn never_runs_two_instances_at_once() {
        let scheduler = TaskScheduler::new(&config(1, 4, 600));
        let task = Counting::new("slow", Duration::from_millis(40));
        scheduler
            .register(task.clone(), TaskSchedule::every(Duration::from_millis(1)))
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.shutdown();
        assert!(task.runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(task.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_runs_are_rescheduled() {
        let scheduler = TaskScheduler::new(&config(1, 2, 600));
        let task = Counting::failing("flaky");
        scheduler
            .register(task.clone(), TaskSchedule::every(Duration::from_millis(10)))
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = scheduler.stats("flaky").unwrap();
        assert!(stats.failures >= 2);
        assert_eq!(stats.failures, stats.runs);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn delay_postpones_first_run() {
        let scheduler = TaskScheduler::new(&config(1, 2, 600));
        let task = Counting::new("later", Duration::ZERO);
        scheduler
            .register(
                task.clone(),
                TaskSchedule::every(Duration::from_secs(60)).with_delay(Duration::from_millis(150)),
            )
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let scheduler = TaskScheduler::new(&config(1, 2, 600));
        let schedule = TaskSchedule::every(Duration::from_secs(1));
        scheduler.register(Counting::new("dup", Duration::ZERO), schedule).unwrap();
        assert!(matches!(
            scheduler.register(Counting::new("dup", Duration::ZERO), schedule),
            Err(SchedulerError::DuplicateTask(_))
        ));
    }

    async fn wait_until_running(scheduler: &TaskScheduler, name: &str) {
        for _ in 0..200 {
            if scheduler.is_running(name) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("task {name} never started");
    }

    #[tokio::test]
    async fn graceful_remove_waits_for_execution() {
        let scheduler = TaskScheduler::new(&config(1, 2, 600));
        let task = Counting::new("busy", Duration::from_millis(150));
        scheduler
            .register(task.clone(), TaskSchedule::every(Duration::from_secs(60)))
            .unwrap();
        scheduler.start();
        wait_until_running(&scheduler, "busy").await;

        assert!(scheduler.remove("busy", true).await);
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_registered("busy"));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn immediate_remove_does_not_wait() {
        let scheduler = TaskScheduler::new(&config(1, 2, 600));
        let task = Counting::new("busy", Duration::from_millis(300));
        scheduler
            .register(task.clone(), TaskSchedule::every(Duration::from_secs(60)))
            .unwrap();
        scheduler.start();
        wait_until_running(&scheduler, "busy").await;

        assert!(scheduler.remove("busy", false).await);
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        assert!(!scheduler.remove("busy", false).await);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn overrunning_task_is_evicted() {
        let scheduler = TaskScheduler::new(&config(1, 2, 1));
        let task = Counting::new("stuck", Duration::from_secs(30));
        scheduler
            .register(task.clone(), TaskSchedule::every(Duration::from_secs(60)))
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(1300)).await;
        let stats = scheduler.stats("stuck").unwrap();
        assert_eq!(stats.failures, 1);
        assert!(!stats.running);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn long_running_tasks_leave_reserved_slots() {
        // Three workers, two reserved: one long-running slot.
        let scheduler = TaskScheduler::new(&config(2, 3, 600));
        let a = Counting::new("long-a", Duration::from_secs(30));
        let b = Counting::new("long-b", Duration::from_secs(30));
        let short = Counting::new("short", Duration::ZERO);
        let long = TaskSchedule::every(Duration::from_secs(60)).long_running();
        scheduler.register(a.clone(), long).unwrap();
        scheduler.register(b.clone(), long).unwrap();
        scheduler
            .register(short.clone(), TaskSchedule::every(Duration::from_millis(10)))
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let running_long = [&a, &b]
            .iter()
            .filter(|t| t.active.load(Ordering::SeqCst) == 1)
            .count();
        assert_eq!(running_long, 1);
        assert!(short.runs.load(Ordering::SeqCst) >= 2);
        scheduler.shutdown();
    }
}
