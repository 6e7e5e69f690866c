use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::git::outcome::{PullOutcome, Reachability, RemoteError, RemoteHead};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    pub branch: Option<String>,
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceInfo {
    pub name: String,
    pub target: Option<String>,
}

impl ReferenceInfo {
    pub fn is_tag(&self) -> bool {
        self.name.starts_with("refs/tags/")
    }

    pub fn is_zero(&self) -> bool {
        self.target
            .as_deref()
            .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b == b'0'))
    }
}

pub trait GitBackend: Send + Sync {
    fn is_repository(&self, path: &Path) -> bool;

    fn remote_url(&self, path: &Path) -> Result<String>;

    fn head(&self, path: &Path) -> Result<HeadInfo>;

    fn is_clean(&self, path: &Path) -> Result<bool>;

    fn has_missing_objects(&self, path: &Path) -> Result<bool>;

    fn references(&self, path: &Path) -> Result<Vec<ReferenceInfo>>;

    fn remove_reference(&self, path: &Path, name: &str) -> Result<()>;

    fn probe_reachable(&self, url: &str, timeout: Duration) -> Result<Reachability>;

    fn remote_head(&self, path: &Path) -> std::result::Result<RemoteHead, RemoteError>;

    fn pull(&self, path: &Path) -> PullOutcome;

    fn refetch(&self, path: &Path) -> Result<String>;

    fn fetch_branch(&self, path: &Path, branch: &str) -> Result<()>;

    fn repack(&self, path: &Path) -> Result<String>;

    fn object_count(&self, path: &Path) -> Result<usize>;

    fn reset_hard(&self, path: &Path, commit: Option<&str>) -> Result<()>;

    fn diff(&self, path: &Path) -> Result<String>;

    fn set_config(&self, path: &Path, key: &str, value: &str) -> Result<()>;

    fn replace_default_branch(&self, path: &Path, from: &str, to: &RemoteHead) -> Result<()>;

    fn set_remote_url(&self, path: &Path, url: &str) -> Result<()>;

    /// Clones `url` into `destination`, which must not exist or be empty.
    fn clone_into(&self, url: &str, destination: &Path) -> Result<()>;

    fn commit_count(&self, path: &Path) -> Result<usize>;

    fn last_commit_time(&self, path: &Path) -> Result<Option<i64>>;
}
