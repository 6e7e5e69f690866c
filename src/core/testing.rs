use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::retry::RetryPolicy;
use crate::core::task::{RepoTask, TaskOptions};
use crate::error::{FleetError, Result};
use crate::git::{
    GitBackend, HeadInfo, PullOutcome, Reachability, ReferenceInfo, RemoteError, RemoteHead,
};
use crate::util::output::memory::MemorySink;
use crate::util::output::{DefaultHeader, OutputCoordinator};
use crate::util::parallel::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RemoveReference(PathBuf, String),
    Pull(PathBuf),
    Refetch(PathBuf),
    FetchBranch(PathBuf, String),
    Repack(PathBuf),
    ResetHard(PathBuf, Option<String>),
    SetConfig(PathBuf, String, String),
    ReplaceDefaultBranch(PathBuf, String, String),
    SetRemoteUrl(PathBuf, String),
    Clone(PathBuf, String),
}

#[derive(Debug, Clone)]
pub struct FakeRepo {
    pub url: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub clean: bool,
    pub missing_objects: bool,
    pub references: Vec<ReferenceInfo>,
    pub reachability: std::result::Result<Reachability, String>,
    pub remote: std::result::Result<RemoteHead, RemoteError>,
    pub pulls: VecDeque<PullOutcome>,
    pub diff: String,
    pub objects: usize,
    pub commit_count: usize,
    pub last_commit_time: Option<i64>,
}

/// Options whose retry waits are short enough for unit tests.
pub fn fast_options() -> TaskOptions {
    TaskOptions {
        retry: RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed: Duration::from_secs(5),
            max_attempts: 5,
        },
        ..TaskOptions::default()
    }
}

/// Runs `op` against a single repository and returns its result and printed block.
pub fn run_task<F>(git: &FakeGit, path: &Path, options: TaskOptions, op: F) -> (Result<()>, String)
where
    F: FnOnce(&RepoTask<'_>) -> Result<()>,
{
    console::set_colors_enabled(false);
    let sink = MemorySink::default();
    let output = OutputCoordinator::new(Box::new(sink.clone()), Box::new(DefaultHeader), false);
    let cancel = CancelToken::new();
    let task_output = output.task(git, path, 1, 1);
    let task = RepoTask {
        path,
        git,
        options: &options,
        output: &task_output,
        cancel: &cancel,
    };
    let result = op(&task);
    task_output.finish();
    (result, sink.contents())
}

/// In-memory `GitBackend` that records every mutating call.
#[derive(Default)]
pub struct FakeGit {
    repos: Mutex<BTreeMap<PathBuf, FakeRepo>>,
    calls: Mutex<Vec<Call>>,
    clone_failures: Mutex<BTreeMap<String, String>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a clean repository whose local head matches the remote.
    pub fn add_repo(&self, path: &Path, url: &str, branch: &str, commit: &str) {
        let repo = FakeRepo {
            url: url.to_string(),
            branch: Some(branch.to_string()),
            commit: Some(commit.to_string()),
            clean: true,
            missing_objects: false,
            references: vec![ReferenceInfo {
                name: format!("refs/heads/{branch}"),
                target: Some(commit.to_string()),
            }],
            reachability: Ok(Reachability::Reachable),
            remote: Ok(RemoteHead {
                branch: branch.to_string(),
                commit: commit.to_string(),
            }),
            pulls: VecDeque::new(),
            diff: String::new(),
            objects: 0,
            commit_count: 1,
            last_commit_time: None,
        };
        self.lock_repos().insert(path.to_path_buf(), repo);
    }

    pub fn update(&self, path: &Path, edit: impl FnOnce(&mut FakeRepo)) {
        if let Some(repo) = self.lock_repos().get_mut(path) {
            edit(repo);
        }
    }

    /// Moves the remote head to `commit`, so the local clone is behind.
    pub fn advance_remote(&self, path: &Path, commit: &str) {
        self.update(path, |repo| {
            if let Ok(head) = repo.remote.as_mut() {
                head.commit = commit.to_string();
            }
        });
    }

    pub fn queue_pulls(&self, path: &Path, outcomes: impl IntoIterator<Item = PullOutcome>) {
        self.update(path, |repo| repo.pulls.extend(outcomes));
    }

    pub fn repo(&self, path: &Path) -> Option<FakeRepo> {
        self.lock_repos().get(path).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pull_count(&self, path: &Path) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Pull(p) if p == path))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    /// Makes the next clone of `url` fail with `message`.
    pub fn fail_clone(&self, url: &str, message: &str) {
        self.lock_clone_failures()
            .insert(url.to_string(), message.to_string());
    }

    fn lock_clone_failures(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.clone_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_repos(&self) -> MutexGuard<'_, BTreeMap<PathBuf, FakeRepo>> {
        self.repos.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_repo<T>(&self, path: &Path, read: impl FnOnce(&mut FakeRepo) -> T) -> Result<T> {
        let mut repos = self.lock_repos();
        let repo = repos
            .get_mut(path)
            .ok_or_else(|| FleetError::RepositoryMissing(path.to_path_buf()))?;
        Ok(read(repo))
    }
}

impl GitBackend for FakeGit {
    fn is_repository(&self, path: &Path) -> bool {
        self.lock_repos().contains_key(path)
    }

    fn remote_url(&self, path: &Path) -> Result<String> {
        self.with_repo(path, |repo| repo.url.clone())
    }

    fn head(&self, path: &Path) -> Result<HeadInfo> {
        self.with_repo(path, |repo| HeadInfo {
            branch: repo.branch.clone(),
            commit: repo.commit.clone(),
        })
    }

    fn is_clean(&self, path: &Path) -> Result<bool> {
        self.with_repo(path, |repo| repo.clean)
    }

    fn has_missing_objects(&self, path: &Path) -> Result<bool> {
        self.with_repo(path, |repo| repo.missing_objects)
    }

    fn references(&self, path: &Path) -> Result<Vec<ReferenceInfo>> {
        self.with_repo(path, |repo| repo.references.clone())
    }

    fn remove_reference(&self, path: &Path, name: &str) -> Result<()> {
        self.record(Call::RemoveReference(path.to_path_buf(), name.to_string()));
        self.with_repo(path, |repo| repo.references.retain(|r| r.name != name))
    }

    fn probe_reachable(&self, url: &str, _timeout: Duration) -> Result<Reachability> {
        let repos = self.lock_repos();
        let repo = repos
            .values()
            .find(|repo| repo.url == url)
            .ok_or_else(|| FleetError::Other(anyhow::anyhow!("unknown url {url}")))?;
        repo.reachability
            .clone()
            .map_err(|message| FleetError::Other(anyhow::anyhow!(message)))
    }

    fn remote_head(&self, path: &Path) -> std::result::Result<RemoteHead, RemoteError> {
        self.with_repo(path, |repo| repo.remote.clone())
            .map_err(|err| RemoteError::Other(err.to_string()))?
    }

    fn pull(&self, path: &Path) -> PullOutcome {
        self.record(Call::Pull(path.to_path_buf()));
        let outcome = self.with_repo(path, |repo| {
            let outcome = repo.pulls.pop_front().unwrap_or(PullOutcome::Updated {
                output: "Fast-forward".to_string(),
            });
            if matches!(
                outcome,
                PullOutcome::Updated { .. } | PullOutcome::AlreadyUpToDate
            ) {
                if let Ok(remote) = &repo.remote {
                    repo.commit = Some(remote.commit.clone());
                }
            }
            outcome
        });
        outcome.unwrap_or_else(|err| PullOutcome::Failed {
            message: err.to_string(),
        })
    }

    fn refetch(&self, path: &Path) -> Result<String> {
        self.record(Call::Refetch(path.to_path_buf()));
        self.with_repo(path, |repo| {
            repo.missing_objects = false;
            String::new()
        })
    }

    fn fetch_branch(&self, path: &Path, branch: &str) -> Result<()> {
        self.record(Call::FetchBranch(path.to_path_buf(), branch.to_string()));
        self.with_repo(path, |_| ())
    }

    fn repack(&self, path: &Path) -> Result<String> {
        self.record(Call::Repack(path.to_path_buf()));
        self.with_repo(path, |repo| {
            repo.objects = 1;
            String::new()
        })
    }

    fn object_count(&self, path: &Path) -> Result<usize> {
        self.with_repo(path, |repo| repo.objects)
    }

    fn reset_hard(&self, path: &Path, commit: Option<&str>) -> Result<()> {
        self.record(Call::ResetHard(
            path.to_path_buf(),
            commit.map(str::to_string),
        ));
        self.with_repo(path, |repo| {
            repo.clean = true;
            if let Some(commit) = commit {
                repo.commit = Some(commit.to_string());
            }
        })
    }

    fn diff(&self, path: &Path) -> Result<String> {
        self.with_repo(path, |repo| repo.diff.clone())
    }

    fn set_config(&self, path: &Path, key: &str, value: &str) -> Result<()> {
        self.record(Call::SetConfig(
            path.to_path_buf(),
            key.to_string(),
            value.to_string(),
        ));
        self.with_repo(path, |repo| repo.diff.clear())
    }

    fn replace_default_branch(&self, path: &Path, from: &str, to: &RemoteHead) -> Result<()> {
        self.record(Call::ReplaceDefaultBranch(
            path.to_path_buf(),
            from.to_string(),
            to.branch.clone(),
        ));
        self.with_repo(path, |repo| {
            repo.branch = Some(to.branch.clone());
            repo.commit = Some(to.commit.clone());
        })
    }

    fn set_remote_url(&self, path: &Path, url: &str) -> Result<()> {
        self.record(Call::SetRemoteUrl(path.to_path_buf(), url.to_string()));
        let mut repos = self.lock_repos();
        if let Some(repo) = repos.get_mut(path) {
            repo.url = url.to_string();
        }
        Ok(())
    }

    fn clone_into(&self, url: &str, destination: &Path) -> Result<()> {
        self.record(Call::Clone(destination.to_path_buf(), url.to_string()));
        if let Some(message) = self.lock_clone_failures().remove(url) {
            return Err(FleetError::Git(anyhow::anyhow!(message)));
        }
        std::fs::create_dir_all(destination.join(".git"))?;
        let (branch, commit) = self
            .lock_repos()
            .values()
            .find(|repo| repo.url == url)
            .and_then(|repo| repo.remote.clone().ok())
            .map(|head| (head.branch, head.commit))
            .unwrap_or_else(|| ("main".to_string(), "c0".to_string()));
        self.add_repo(destination, url, &branch, &commit);
        Ok(())
    }

    fn commit_count(&self, path: &Path) -> Result<usize> {
        self.with_repo(path, |repo| repo.commit_count)
    }

    fn last_commit_time(&self, path: &Path) -> Result<Option<i64>> {
        self.with_repo(path, |repo| repo.last_commit_time)
    }
}
