use std::fs;
use std::path::{Path, PathBuf};

use crate::core::repo::RepoId;
use crate::core::task::RepoTask;
use crate::error::{FleetError, Result};
use crate::git::{Reachability, RemoteError, RemoteHead};
use crate::util::output::{LockToken, Verdict};

/// Which caller is asking for the remote head; decides which remote errors are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUse {
    UpToDateCheck,
    UpdateBranch,
    ResetBranch,
}

/// Probes the remote and resolves its default branch head. Runs without the output lock.
pub fn resolve_remote_head(task: &RepoTask<'_>) -> std::result::Result<RemoteHead, RemoteError> {
    let url = task
        .git
        .remote_url(task.path)
        .map_err(|err| RemoteError::Other(err.to_string()))?;

    match task.git.probe_reachable(&url, task.options.probe_timeout) {
        Ok(Reachability::Reachable) => {}
        Ok(Reachability::Unreachable { status }) => {
            tracing::debug!(url = %url, ?status, "remote not reachable");
            return Err(RemoteError::NotReachable);
        }
        Ok(Reachability::Moved { new_url }) => {
            // hosts often redirect `x.git` to `x`; only a different project is a move
            let same_project = matches!(
                (RepoId::from_url(&url), RepoId::from_url(&new_url)),
                (Ok(old), Ok(new)) if old == new
            );
            if !same_project {
                return Err(RemoteError::Moved {
                    old_url: url,
                    new_url,
                });
            }
        }
        Err(err) => return Err(RemoteError::Other(err.to_string())),
    }

    task.git.remote_head(task.path)
}

/// Prints a remote failure and decides whether it ends the task.
pub fn settle_remote(
    task: &RepoTask<'_>,
    label: &str,
    usage: RemoteUse,
    resolved: std::result::Result<RemoteHead, RemoteError>,
) -> Result<Option<RemoteHead>> {
    let err = match resolved {
        Ok(head) => return Ok(Some(head)),
        Err(err) => err,
    };

    let mut token = task.output.lock();
    if let RemoteError::Moved { new_url, .. } = &err {
        token.warn(&format!("{label}: moved: {new_url}"));
        return Err(err.into());
    }
    token.step(label, &Verdict::Failed(err.to_string()));

    let fatal = match err {
        RemoteError::Disabled | RemoteError::Protected => true,
        RemoteError::NotReachable => usage == RemoteUse::UpToDateCheck,
        RemoteError::MissingHead => usage == RemoteUse::UpdateBranch,
        _ => false,
    };
    if fatal {
        Err(err.into())
    } else {
        tracing::debug!(path = %task.path.display(), error = %err, "ignoring remote error");
        Ok(None)
    }
}

pub(crate) fn apply(
    token: &mut LockToken<'_>,
    action: &str,
    dry_run: bool,
    mutate: impl FnOnce() -> Result<()>,
) -> Result<()> {
    if dry_run {
        token.repair(action, &Verdict::DryRun);
        return Ok(());
    }
    match mutate() {
        Ok(()) => {
            token.repair(action, &Verdict::Success);
            Ok(())
        }
        Err(err) => {
            token.repair(action, &Verdict::Failed(err.to_string()));
            Err(err)
        }
    }
}

// local repairs report their failure and let the retry loop carry on
fn apply_reported(
    token: &mut LockToken<'_>,
    action: &str,
    dry_run: bool,
    mutate: impl FnOnce() -> Result<()>,
) {
    if let Err(err) = apply(token, action, dry_run, mutate) {
        tracing::debug!(action, error = %err, "repair failed");
    }
}

/// Removes branch and remote references that point at the all-zero id.
pub fn fix_references(task: &RepoTask<'_>, token: &mut LockToken<'_>) -> Result<()> {
    for reference in task.git.references(task.path)? {
        if reference.is_tag() || !reference.is_zero() {
            continue;
        }
        let action = format!("remove reference '{}'", reference.name);
        apply_reported(token, &action, task.dry_run(), || {
            task.git.remove_reference(task.path, &reference.name)
        });
    }
    Ok(())
}

pub fn make_clean(task: &RepoTask<'_>, token: &mut LockToken<'_>) -> Result<()> {
    if task.git.is_clean(task.path)? {
        return Ok(());
    }
    force_reset(task, token);
    Ok(())
}

pub fn force_reset(task: &RepoTask<'_>, token: &mut LockToken<'_>) {
    apply_reported(token, "reset", task.dry_run(), || {
        task.git.reset_hard(task.path, None)
    });
}

/// Sets `core.filemode=false` when the worktree diff consists of mode changes only.
pub fn ignore_filemode(task: &RepoTask<'_>, token: &mut LockToken<'_>) -> Result<()> {
    let diff = task.git.diff(task.path)?;
    if !is_filemode_only(&diff)? {
        return Ok(());
    }
    apply(token, "config core.filemode false", task.dry_run(), || {
        task.git.set_config(task.path, "core.filemode", "false")
    })
}

pub fn is_filemode_only(diff: &str) -> Result<bool> {
    let mode_marker = regex::Regex::new(r"(?m)^(old mode|new mode|deleted file mode) [0-7]+$")
        .map_err(|err| FleetError::Other(anyhow::Error::new(err)))?;
    let content_hunk = regex::Regex::new(r"(?m)^@@ ")
        .map_err(|err| FleetError::Other(anyhow::Error::new(err)))?;
    Ok(mode_marker.is_match(diff) && !content_hunk.is_match(diff))
}

pub fn refetch(task: &RepoTask<'_>) -> Result<()> {
    const LABEL: &str = "fetch --refetch";
    if task.dry_run() {
        task.output.lock().step(LABEL, &Verdict::DryRun);
        return Ok(());
    }

    let fetched = task.git.refetch(task.path);
    let mut token = task.output.lock();
    match fetched {
        Ok(output) => {
            token.step(LABEL, &Verdict::Success);
            token.text(output.trim());
            Ok(())
        }
        Err(err) => {
            token.step(LABEL, &Verdict::Failed(err.to_string()));
            Err(err)
        }
    }
}

/// Switches the local branch to the one the remote advertises as its default.
pub fn update_default_branch(task: &RepoTask<'_>) -> Result<()> {
    let head = task.git.head(task.path)?;
    let resolved = resolve_remote_head(task);
    let Some(remote) = settle_remote(task, "update HEAD", RemoteUse::UpdateBranch, resolved)?
    else {
        return Ok(());
    };

    let branch = head.branch.ok_or(RemoteError::MissingBranch)?;
    if branch == remote.branch {
        return Ok(());
    }

    let action = format!("update HEAD '{}'", remote.branch);
    if task.dry_run() {
        task.output.lock().repair(&action, &Verdict::DryRun);
        return Ok(());
    }

    let fetched = task.git.fetch_branch(task.path, &remote.branch);
    let mut token = task.output.lock();
    apply_reported(&mut token, &action, false, || {
        fetched?;
        task.git.replace_default_branch(task.path, &branch, &remote)
    });
    Ok(())
}

/// Hard-resets the current branch to the remote default branch head.
pub fn reset_default_branch(task: &RepoTask<'_>) -> Result<()> {
    let head = task.git.head(task.path)?;
    let resolved = resolve_remote_head(task);
    let Some(remote) = settle_remote(task, "reset HEAD", RemoteUse::ResetBranch, resolved)?
    else {
        return Ok(());
    };

    if head.commit.as_deref() == Some(remote.commit.as_str()) {
        return Ok(());
    }

    let action = format!("reset HEAD '{}'", head.branch.as_deref().unwrap_or("HEAD"));
    let mut token = task.output.lock();
    apply_reported(&mut token, &action, task.dry_run(), || {
        task.git.reset_hard(task.path, Some(&remote.commit))
    });
    Ok(())
}

/// Repacks when the object count exceeds the configured threshold.
pub fn repack_if_needed(task: &RepoTask<'_>) -> Result<()> {
    const LABEL: &str = "gc";
    let objects = task.git.object_count(task.path)?;
    if objects <= task.options.gc_threshold {
        return Ok(());
    }
    tracing::debug!(path = %task.path.display(), objects, "repacking");

    if task.dry_run() {
        task.output.lock().step(LABEL, &Verdict::DryRun);
        return Ok(());
    }

    let packed = task.git.repack(task.path);
    let mut token = task.output.lock();
    match packed {
        Ok(output) => {
            token.step(LABEL, &Verdict::Success);
            token.text(output.trim());
            Ok(())
        }
        Err(err) => {
            token.step(LABEL, &Verdict::Failed(err.to_string()));
            Err(err)
        }
    }
}

/// Moves the clone so its path matches the new remote and points `origin` at it.
///
/// The path must end with the old remote's id. An existing destination wins: the
/// stale source is removed instead.
pub fn relocate(task: &RepoTask<'_>, old_url: &str, new_url: &str) -> Result<PathBuf> {
    let mut token = task.output.lock();
    token.warn(&format!("moving from '{old_url}' to '{new_url}'"));

    if task.dry_run() {
        token.repair("move", &Verdict::DryRun);
        return Ok(task.path.to_path_buf());
    }

    let moved = move_clone(task, &mut token, old_url, new_url);
    match &moved {
        Ok(_) => token.repair("move", &Verdict::Success),
        Err(err) => token.repair("move", &Verdict::Failed(err.to_string())),
    }
    moved
}

fn move_clone(
    task: &RepoTask<'_>,
    token: &mut LockToken<'_>,
    old_url: &str,
    new_url: &str,
) -> Result<PathBuf> {
    let old_id = RepoId::from_url(old_url)?;
    let new_id = RepoId::from_url(new_url)?;
    if !old_id.is_suffix_of(task.path) {
        return Err(FleetError::Other(anyhow::anyhow!(
            "unexpected repository path: {}",
            task.path.display()
        )));
    }

    let mut base = task.path.to_path_buf();
    for _ in Path::new(old_id.as_str()).components() {
        base.pop();
    }
    let destination = base.join(new_id.as_str());

    if destination.exists() {
        token.warn(&format!("already exists: {}", destination.display()));
        fs::remove_dir_all(task.path)?;
        return Ok(destination);
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(task.path, &destination)?;
    task.git.set_remote_url(&destination, new_url)?;
    tracing::info!(
        from = %task.path.display(),
        to = %destination.display(),
        "relocated repository"
    );
    Ok(destination)
}
