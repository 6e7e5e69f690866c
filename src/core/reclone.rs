use std::fs;
use std::path::{Path, PathBuf};

use crate::core::repair;
use crate::core::task::{RepoTask, TaskOptions};
use crate::error::{FleetError, Result};
use crate::git::GitBackend;
use crate::util::output::OutputCoordinator;
use crate::util::parallel::CancelToken;

/// Replaces a clone with a fresh one from its remote.
///
/// The new clone is made next to the old one first, so a failed clone leaves the
/// original checkout untouched.
pub fn reclone(task: &RepoTask<'_>) -> Result<()> {
    if !task.git.is_repository(task.path) {
        return Err(FleetError::RepositoryMissing(task.path.to_path_buf()));
    }
    let url = task.git.remote_url(task.path)?;
    let parent = task.path.parent().ok_or_else(|| {
        FleetError::Other(anyhow::anyhow!(
            "no parent directory: {}",
            task.path.display()
        ))
    })?;

    let mut token = task.output.lock();
    repair::apply(&mut token, "reclone", task.dry_run(), || {
        let staging = tempfile::Builder::new()
            .prefix(".repofleet-reclone-")
            .tempdir_in(parent)?;
        let fresh = staging.path().join("clone");
        task.git.clone_into(&url, &fresh)?;
        fs::remove_dir_all(task.path)?;
        fs::rename(&fresh, task.path)?;
        tracing::info!(path = %task.path.display(), %url, "recloned repository");
        Ok(())
    })
}

/// Reclones `paths` one by one and stops at the first failure.
pub fn run(
    git: &dyn GitBackend,
    paths: &[PathBuf],
    output: &OutputCoordinator,
    dry_run: bool,
) -> Result<()> {
    let options = TaskOptions {
        dry_run,
        ..TaskOptions::default()
    };
    let cancel = CancelToken::new();
    let total = paths.len();

    for (position, path) in paths.iter().enumerate() {
        output.set_active(total - position);
        let task_output = output.task(git, path, position + 1, total);
        let task = RepoTask {
            path,
            git,
            options: &options,
            output: &task_output,
            cancel: &cancel,
        };
        if let Err(err) = reclone(&task) {
            task_output
                .lock()
                .error(&format!("reclone '{}': {err}", path.display()));
            task_output.finish();
            return Err(err);
        }
        task_output.finish();
    }
    Ok(())
}

/// Fails when `cwd` is any of `targets` or lies below one of them.
pub fn ensure_outside(cwd: &Path, targets: &[PathBuf]) -> Result<()> {
    for target in targets {
        if is_path_within(target, cwd) {
            return Err(FleetError::Other(anyhow::anyhow!(
                "current working directory '{}' is inside target repository '{}'; run reclone from outside the target repository",
                cwd.display(),
                target.display()
            )));
        }
    }
    Ok(())
}

/// Whether `target` is `base` or lies below it, after resolving symlinks where possible.
pub fn is_path_within(base: &Path, target: &Path) -> bool {
    normalize(target).starts_with(normalize(base))
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
