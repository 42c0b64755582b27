use futures_util::FutureExt;
use std::{
    borrow::Cow,
    future::Future,
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_inner(self) -> (Cow<'static, str>, JoinHandle<()>) {
        (self.name, self.handle)
    }
}

/// Background tasks owned by the process, stopped together at shutdown.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    /// Give each task up to `grace` to finish, then abort it.
    pub async fn shutdown_with_grace(self, grace: Duration) -> ShutdownSummary {
        let mut summary = ShutdownSummary::default();
        for task in self.tasks {
            let (name, mut handle) = task.into_inner();

            if grace.is_zero() {
                handle.abort();
                match handle.await {
                    Ok(()) => summary.completed += 1,
                    Err(err) => {
                        debug!(task = %name, ?err, "task join after abort failed");
                        summary.aborted += 1;
                    }
                }
                continue;
            }

            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                        summary.aborted += 1;
                    } else {
                        summary.completed += 1;
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    match handle.await {
                        Ok(()) => summary.completed += 1,
                        Err(err) => {
                            debug!(task = %name, ?err, "task join after abort failed");
                            summary.aborted += 1;
                        }
                    }
                }
            }
        }
        summary
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub completed: usize,
    pub aborted: usize,
}

/// Spawn a supervised background task that restarts on panic with exponential backoff.
/// Use for long-running loops that should survive a bad iteration.
pub fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name_cow = name.into();
    let name_for_task = name_cow.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms: u64 = 200;
        // Thrash detection window
        let window = Duration::from_secs(30);
        let mut window_start = Instant::now();
        let mut restarts_in_window: u32 = 0;
        loop {
            let result = std::panic::AssertUnwindSafe(factory()).catch_unwind().await;
            match result {
                Ok(()) => {
                    debug!(task = %name_for_task, "supervised task completed normally");
                    break;
                }
                Err(_panic) => {
                    let now = Instant::now();
                    if now.duration_since(window_start) > window {
                        window_start = now;
                        restarts_in_window = 0;
                    }
                    restarts_in_window = restarts_in_window.saturating_add(1);
                    tracing::error!(task = %name_for_task, backoff_ms, restarts_in_window, "supervised task panicked; restarting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms.saturating_mul(2)).min(10_000);
                }
            }
        }
    });
    TaskHandle::new(name_cow, handle)
}

/// Run `tick` every `period` (first run one period after start) under
/// [`spawn_supervised`]. A tick that overruns delays the next one instead of
/// bunching them up.
pub fn spawn_periodic<F, Fut>(
    name: impl Into<Cow<'static, str>>,
    period: Duration,
    tick: F,
) -> TaskHandle
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    spawn_supervised(name, move || {
        let tick = tick.clone();
        async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn periodic_runs_each_period_not_at_start() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let task = spawn_periodic("test.periodic", Duration::from_secs(60), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        let mut manager = TaskManager::new();
        manager.push(task);
        let summary = manager.shutdown_with_grace(Duration::ZERO).await;
        assert_eq!(summary.aborted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn supervised_task_restarts_after_panic() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let task = spawn_supervised("test.supervised", move || {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });
        let mut manager = TaskManager::new();
        manager.push(task);
        let summary = manager.shutdown_with_grace(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(summary.completed, 1);
    }
}
