use crate::core::repair::{self, RemoteUse};
use crate::core::task::RepoTask;
use crate::error::{FleetError, Result};
use crate::git::{PullOutcome, RemoteError};
use crate::util::output::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullResult {
    Pulled,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pace {
    Immediate,
    Backoff,
}

/// Brings one clone up to date with its remote default branch.
pub fn update(task: &RepoTask<'_>) -> Result<()> {
    if is_up_to_date(task)? {
        return Ok(());
    }
    if pull_with_retry(task)? == PullResult::Pulled {
        after_pull(task)?;
    }
    Ok(())
}

fn is_up_to_date(task: &RepoTask<'_>) -> Result<bool> {
    let head = task.git.head(task.path)?;
    let resolved = repair::resolve_remote_head(task);
    let Some(remote) = repair::settle_remote(task, "remote", RemoteUse::UpToDateCheck, resolved)?
    else {
        return Ok(false);
    };

    let current = head.branch.as_deref() == Some(remote.branch.as_str())
        && head.commit.as_deref() == Some(remote.commit.as_str());
    if current && !task.output.only_updated() {
        task.output
            .lock()
            .step("remote", &Verdict::Note("up-to-date".to_string()));
    }
    Ok(current)
}

fn pull_with_retry(task: &RepoTask<'_>) -> Result<PullResult> {
    let mut backoff = task.options.retry.start();

    loop {
        task.cancel.check()?;
        let attempt = backoff.record_attempt();
        if attempt > 1 {
            task.output
                .lock()
                .step("attempt", &Verdict::Note(attempt.to_string()));
        }

        let outcome = pull_once(task);
        let reason = outcome.describe();
        let (repaired, pace) = match outcome {
            PullOutcome::Updated { .. } | PullOutcome::AlreadyUpToDate => {
                return Ok(PullResult::Pulled)
            }
            PullOutcome::AuthenticationRequired
            | PullOutcome::CertificateInvalid
            | PullOutcome::ServerError { .. } => {
                tracing::debug!(path = %task.path.display(), %reason, "skipping pull");
                return Ok(PullResult::Skipped);
            }
            PullOutcome::Disabled => return Err(RemoteError::Disabled.into()),
            PullOutcome::Unreachable => return Err(RemoteError::NotReachable.into()),
            PullOutcome::Moved { new_url } => {
                let old_url = task.git.remote_url(task.path)?;
                return Err(RemoteError::Moved { old_url, new_url }.into());
            }
            PullOutcome::ObjectMissing => (repair::refetch(task), Pace::Immediate),
            PullOutcome::WorktreeNotClean => {
                let mut token = task.output.lock();
                let repaired = repair::ignore_filemode(task, &mut token)
                    .map(|()| repair::force_reset(task, &mut token));
                (repaired, Pace::Backoff)
            }
            PullOutcome::UnstagedChanges | PullOutcome::ExitFailure { .. } => {
                repair::force_reset(task, &mut task.output.lock());
                (Ok(()), Pace::Backoff)
            }
            PullOutcome::NonFastForward | PullOutcome::Corrupted { .. } => {
                (repair::reset_default_branch(task), Pace::Backoff)
            }
            PullOutcome::DefaultBranchMismatch => {
                repair::update_default_branch(task)?;
                (Ok(()), Pace::Immediate)
            }
            PullOutcome::ReferenceChanged => {
                let mut token = task.output.lock();
                (repair::fix_references(task, &mut token), Pace::Immediate)
            }
            PullOutcome::Failed { .. } => (Ok(()), Pace::Backoff),
        };

        if let Err(err) = repaired {
            return Err(FleetError::PullFailed {
                attempts: backoff.attempts(),
                reason: err.to_string(),
            });
        }
        if !backoff.can_attempt() {
            return Err(FleetError::PullFailed {
                attempts: backoff.attempts(),
                reason,
            });
        }
        if pace == Pace::Backoff {
            let Some(wait) = backoff.next_wait() else {
                return Err(FleetError::PullFailed {
                    attempts: backoff.attempts(),
                    reason,
                });
            };
            task.output.lock().warn(&format!(
                "retrying in {} ({} left)",
                humantime::format_duration(wait),
                humantime::format_duration(round_to_millis(backoff.remaining()))
            ));
            task.cancel.sleep(wait).map_err(FleetError::Cancelled)?;
        }
    }
}

fn pull_once(task: &RepoTask<'_>) -> PullOutcome {
    const LABEL: &str = "pull";
    if task.dry_run() {
        task.output.lock().step(LABEL, &Verdict::DryRun);
        return PullOutcome::Updated {
            output: String::new(),
        };
    }

    let outcome = task.git.pull(task.path);
    let mut token = task.output.lock();
    match &outcome {
        PullOutcome::Updated { output } => {
            token.step(LABEL, &Verdict::Success);
            token.text(output);
        }
        PullOutcome::AlreadyUpToDate => {
            token.step(LABEL, &Verdict::Note(outcome.describe()));
        }
        failed => token.step(LABEL, &Verdict::Failed(failed.describe())),
    }
    outcome
}

fn after_pull(task: &RepoTask<'_>) -> Result<()> {
    {
        let mut token = task.output.lock();
        repair::make_clean(task, &mut token)?;
    }
    repair::repack_if_needed(task)
}

fn round_to_millis(duration: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(duration.as_millis().min(u64::MAX as u128) as u64)
}
