use std::path::Path;
use std::time::Duration;

use crate::core::retry::RetryPolicy;
use crate::git::GitBackend;
use crate::util::output::TaskOutput;
use crate::util::parallel::CancelToken;

/// Immutable per-run switches shared by every repository task.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub dry_run: bool,
    pub retry: RetryPolicy,
    pub probe_timeout: Duration,
    pub gc_threshold: usize,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            retry: RetryPolicy::default(),
            probe_timeout: Duration::from_secs(10),
            gc_threshold: 1,
        }
    }
}

pub struct RepoTask<'a> {
    pub path: &'a Path,
    pub git: &'a dyn GitBackend,
    pub options: &'a TaskOptions,
    pub output: &'a TaskOutput<'a>,
    pub cancel: &'a CancelToken,
}

impl RepoTask<'_> {
    pub fn dry_run(&self) -> bool {
        self.options.dry_run
    }
}
