use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::error::{FleetError, Result};

pub fn run_in_parallel<T, R, F>(items: Vec<T>, jobs: Option<usize>, func: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Send + Sync,
{
    match jobs {
        Some(count) if count > 1 => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(count).build();
            if let Ok(pool) = pool {
                return pool.install(|| items.into_par_iter().map(func).collect());
            }
            items.into_iter().map(func).collect()
        }
        _ => items.into_iter().map(func).collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
    Interrupted,
    Failed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => write!(f, "execution timeout exceeded"),
            CancelReason::Interrupted => write!(f, "interrupted"),
            CancelReason::Failed => write!(f, "cancelled after a failed repository"),
        }
    }
}

/// Cooperative cancellation shared by the scheduler, its tasks and the signal listener.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    reason: Mutex<Option<CancelReason>>,
    wake: Condvar,
    deadline: Option<Instant>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::with_deadline(None)
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                reason: Mutex::new(None),
                wake: Condvar::new(),
                deadline: timeout.map(|timeout| Instant::now() + timeout),
            }),
        }
    }

    pub fn cancel(&self, reason: CancelReason) {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(reason);
        }
        self.inner.wake.notify_all();
    }

    pub fn reason(&self) -> Option<CancelReason> {
        let mut guard = self.lock();
        self.observe(&mut guard)
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(FleetError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Sleeps for `duration`, returning early with the reason when cancelled or past the deadline.
    pub fn sleep(&self, duration: Duration) -> std::result::Result<(), CancelReason> {
        let wake_at = Instant::now() + duration;
        let mut guard = self.lock();
        loop {
            if let Some(reason) = self.observe(&mut guard) {
                return Err(reason);
            }
            let now = Instant::now();
            if now >= wake_at {
                return Ok(());
            }
            let until = match self.inner.deadline {
                Some(deadline) => wake_at.min(deadline),
                None => wake_at,
            };
            guard = match self
                .inner
                .wake
                .wait_timeout(guard, until.saturating_duration_since(now))
            {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn observe(&self, guard: &mut MutexGuard<'_, Option<CancelReason>>) -> Option<CancelReason> {
        if guard.is_none() {
            if let Some(deadline) = self.inner.deadline {
                if Instant::now() >= deadline {
                    **guard = Some(CancelReason::Timeout);
                    self.inner.wake.notify_all();
                }
            }
        }
        **guard
    }

    fn lock(&self) -> MutexGuard<'_, Option<CancelReason>> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded worker pool over indexed repository paths.
pub struct Scheduler {
    workers: usize,
    token: CancelToken,
}

impl Scheduler {
    pub fn new(workers: usize, token: CancelToken) -> Self {
        Self {
            workers: workers.max(1),
            token,
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Runs `task` for every item and `cleanup` after every attempt.
    ///
    /// An error returned by `cleanup` is fatal: it cancels the token so no new task starts,
    /// and it is returned once the running tasks have finished.
    pub fn run<T, C>(&self, items: Vec<(usize, PathBuf)>, task: T, cleanup: C) -> Result<()>
    where
        T: Fn(usize, &Path) -> Result<()> + Send + Sync,
        C: Fn(usize, &Path, Option<&FleetError>) -> Result<()> + Send + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|err| FleetError::Other(anyhow::Error::new(err)))?;
        let fatal: Mutex<Option<FleetError>> = Mutex::new(None);

        pool.install(|| {
            items.into_par_iter().for_each(|(index, path)| {
                if self.token.is_cancelled() {
                    return;
                }
                let result = task(index, &path);
                if let Err(err) = cleanup(index, &path, result.as_ref().err()) {
                    tracing::debug!(path = %path.display(), "fatal task error, halting scheduling");
                    let mut slot = fatal.lock().unwrap_or_else(PoisonError::into_inner);
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    self.token.cancel(CancelReason::Failed);
                }
            });
        });

        if let Some(err) = fatal.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(err);
        }
        match self.token.reason() {
            Some(reason @ (CancelReason::Timeout | CancelReason::Interrupted)) => {
                Err(FleetError::Cancelled(reason))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    fn items(count: usize) -> Vec<(usize, PathBuf)> {
        (1..=count)
            .map(|index| (index, PathBuf::from(format!("/repos/{index}"))))
            .collect()
    }

    #[test]
    fn runs_every_item_and_cleanup() {
        let scheduler = Scheduler::new(4, CancelToken::new());
        let ran = AtomicUsize::new(0);
        let cleaned = AtomicUsize::new(0);

        scheduler
            .run(
                items(25),
                |_, _| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                |_, _, err| {
                    assert!(err.is_none());
                    cleaned.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .expect("run succeeds");

        assert_eq!(ran.load(Ordering::SeqCst), 25);
        assert_eq!(cleaned.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn swallowed_errors_do_not_stop_the_run() {
        let scheduler = Scheduler::new(2, CancelToken::new());
        let failures = AtomicUsize::new(0);

        scheduler
            .run(
                items(6),
                |index, _| {
                    if index % 2 == 0 {
                        Err(FleetError::Other(anyhow::anyhow!("boom")))
                    } else {
                        Ok(())
                    }
                },
                |_, _, err| {
                    if err.is_some() {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                },
            )
            .expect("errors are swallowed by cleanup");

        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fatal_error_halts_new_work() {
        let scheduler = Scheduler::new(1, CancelToken::new());
        let ran = AtomicUsize::new(0);

        let err = scheduler
            .run(
                items(10),
                |index, _| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    if index == 2 {
                        Err(FleetError::Other(anyhow::anyhow!("broken repository")))
                    } else {
                        Ok(())
                    }
                },
                |_, _, err| match err {
                    Some(err) => Err(FleetError::Other(anyhow::anyhow!(err.to_string()))),
                    None => Ok(()),
                },
            )
            .expect_err("fatal error propagates");

        assert!(err.to_string().contains("broken repository"));
        assert!(ran.load(Ordering::SeqCst) < 10);
        assert_eq!(scheduler.token().reason(), Some(CancelReason::Failed));
    }

    #[test]
    fn expired_deadline_reports_timeout() {
        let scheduler = Scheduler::new(2, CancelToken::with_deadline(Some(Duration::ZERO)));
        let ran = AtomicUsize::new(0);

        let err = scheduler
            .run(
                items(5),
                |_, _| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                |_, _, _| Ok(()),
            )
            .expect_err("deadline exceeded");

        assert!(matches!(err, FleetError::Cancelled(CancelReason::Timeout)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel(CancelReason::Interrupted);
        });

        let started = Instant::now();
        let slept = token.sleep(Duration::from_secs(30));
        handle.join().expect("join canceller");

        assert_eq!(slept, Err(CancelReason::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn sleep_completes_without_cancellation() {
        let token = CancelToken::new();
        assert_eq!(token.sleep(Duration::from_millis(5)), Ok(()));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn first_cancel_reason_wins() {
        let token = CancelToken::new();
        token.cancel(CancelReason::Interrupted);
        token.cancel(CancelReason::Timeout);
        assert_eq!(token.reason(), Some(CancelReason::Interrupted));
        assert!(token.check().is_err());
    }
}
