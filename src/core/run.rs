use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use crate::config::ConfigError;
use crate::core::locator;
use crate::core::operation::{self, OperationKind};
use crate::core::state::StateStore;
use crate::core::task::{RepoTask, TaskOptions};
use crate::error::{FleetError, Result};
use crate::git::GitBackend;
use crate::util::output::{self, OutputCoordinator};
use crate::util::parallel::{CancelToken, Scheduler};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub roots: Vec<PathBuf>,
    pub kind: OperationKind,
    pub workers: usize,
    pub suppress_errors: bool,
    pub timeout: Option<Duration>,
    pub options: TaskOptions,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total: usize,
    pub processed: usize,
    pub remaining: usize,
    pub started_at: OffsetDateTime,
    pub elapsed: Duration,
    pub state_created_at: OffsetDateTime,
}

impl RunSummary {
    /// Wall time since the execution state was first created, across resumed runs.
    pub fn since_created(&self) -> Duration {
        let since = OffsetDateTime::now_utc() - self.state_created_at;
        Duration::try_from(since).unwrap_or(self.elapsed)
    }
}

/// Loaded or freshly discovered work, ready to schedule.
pub struct PreparedRun {
    store: StateStore,
}

impl PreparedRun {
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn total(&self) -> usize {
        self.store.snapshot().total_count
    }

    pub fn remaining(&self) -> usize {
        self.store.remaining()
    }
}

/// Resumes the saved work list for this operation, or discovers repositories when none is left.
pub fn prepare(request: &RunRequest) -> Result<PreparedRun> {
    let base = request
        .roots
        .first()
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "roots".to_string(),
            value: String::new(),
        })?;
    let mut store = StateStore::load_or_create(base, request.kind.name(), &request.roots)?;

    let snapshot = store.snapshot();
    if !snapshot.remaining_paths.is_empty() && snapshot.roots != request.roots {
        output::warn(&format!(
            "roots differ from saved state at {}, starting over",
            store.path().display()
        ));
        store.restart(&request.roots);
    }

    if store.remaining() == 0 {
        let paths = locator::locate(&request.roots)?;
        // a single repository passed directly needs no resumable state
        if paths == request.roots {
            store.set_persistent(false);
        }
        store.restart(&request.roots);
        store.set_paths(paths);
        if let Err(err) = store.save() {
            tracing::warn!(
                path = %store.path().display(),
                error = %err,
                "could not save execution state"
            );
        }
    } else {
        tracing::info!(
            remaining = store.remaining(),
            "resuming from {}",
            store.path().display()
        );
    }

    Ok(PreparedRun { store })
}

/// Runs the operation over every remaining repository of `prepared`.
pub fn execute(
    git: &dyn GitBackend,
    prepared: PreparedRun,
    request: &RunRequest,
    output: &OutputCoordinator,
    cancel: CancelToken,
) -> Result<RunSummary> {
    let started_at = OffsetDateTime::now_utc();
    let started = Instant::now();
    let store = prepared.store;
    let snapshot = store.snapshot();
    let total = snapshot.total_count;
    let already_done = snapshot.completed();
    let offset = 1 + already_done;

    let items: Vec<(usize, PathBuf)> = snapshot
        .remaining_paths
        .iter()
        .cloned()
        .enumerate()
        .map(|(position, path)| (offset + position, path))
        .collect();
    output.set_active(items.len());

    let op = request.kind.name();
    let processed = AtomicUsize::new(0);
    let scheduler = Scheduler::new(request.workers, cancel);

    let outcome = scheduler.run(
        items,
        |index, path| {
            let task_output = output.task(git, path, index, total);
            let result = if git.is_repository(path) {
                let task = RepoTask {
                    path,
                    git,
                    options: &request.options,
                    output: &task_output,
                    cancel: scheduler.token(),
                };
                operation::execute(request.kind, &task)
            } else {
                Err(FleetError::RepositoryMissing(path.to_path_buf()))
            };

            match &result {
                Ok(()) | Err(FleetError::RepositoryMissing(_)) => task_output.finish(),
                Err(FleetError::Cancelled(_)) => task_output.flush(),
                Err(err) => {
                    task_output.lock().error(err);
                    task_output.finish();
                }
            }
            result
        },
        |_, path, err| match err {
            None | Some(FleetError::RepositoryMissing(_)) => {
                if err.is_some() {
                    tracing::warn!(path = %path.display(), "repository no longer exists");
                }
                let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Err(err) = store.complete(path, already_done + done) {
                    tracing::warn!(error = %err, "could not checkpoint execution state");
                }
                output.set_active(store.remaining());
                Ok(())
            }
            Some(FleetError::Cancelled(_)) => Ok(()),
            Some(err) if request.suppress_errors => {
                tracing::debug!(path = %path.display(), error = %err, "suppressed");
                Ok(())
            }
            Some(err) => Err(FleetError::Other(anyhow::anyhow!(
                "{op} '{}': {err}",
                path.display()
            ))),
        },
    );

    if let Err(err) = store.finish() {
        tracing::error!(
            path = %store.path().display(),
            error = %err,
            "could not persist execution state"
        );
    }
    outcome?;

    let summary = RunSummary {
        total,
        processed: processed.load(Ordering::SeqCst),
        remaining: store.remaining(),
        started_at,
        elapsed: started.elapsed(),
        state_created_at: snapshot.create_time,
    };
    tracing::info!(
        op,
        total = summary.total,
        processed = summary.processed,
        remaining = summary.remaining,
        "run finished"
    );
    Ok(summary)
}

pub fn run(
    git: &dyn GitBackend,
    request: &RunRequest,
    output: &OutputCoordinator,
) -> Result<RunSummary> {
    let prepared = prepare(request)?;
    execute(
        git,
        prepared,
        request,
        output,
        CancelToken::with_deadline(request.timeout),
    )
}
