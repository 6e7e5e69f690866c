use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gix::bstr::ByteSlice;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{FleetError, Result};
use crate::git::{GitBackend, Reachability};

/// `host/path` of a remote, e.g. `github.com/org/app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = gix::url::parse(url.trim().as_bytes().as_bstr())
            .map_err(|err| FleetError::Git(anyhow::Error::new(err)))?;
        let path = parsed.path.to_str_lossy();
        let path = path.trim_start_matches('/').trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);

        let id = match (parsed.host(), parsed.port) {
            (Some(host), Some(port)) => format!("{host}:{port}/{path}"),
            (Some(host), None) => format!("{host}/{path}"),
            (None, _) => path.to_string(),
        };
        Ok(Self(id))
    }

    /// Whether `path` is the conventional checkout location for this id under some root.
    pub fn is_suffix_of(&self, path: &Path) -> bool {
        path.ends_with(Path::new(&self.0))
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryInfo {
    pub path: PathBuf,
    pub id: Option<RepoId>,
    pub url: Option<String>,
    pub branch: Option<String>,
    pub is_clean: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub commit_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl RepositoryInfo {
    pub fn collect(
        backend: &dyn GitBackend,
        path: &Path,
        probe_timeout: Option<Duration>,
    ) -> Result<Self> {
        let url = backend.remote_url(path).ok();
        let id = url.as_deref().and_then(|url| RepoId::from_url(url).ok());
        let head = backend.head(path)?;
        let last_updated = backend
            .last_commit_time(path)
            .ok()
            .flatten()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok());

        let active = match (probe_timeout, url.as_deref()) {
            (Some(timeout), Some(url)) => Some(matches!(
                backend.probe_reachable(url, timeout),
                Ok(Reachability::Reachable)
            )),
            (Some(_), None) => Some(false),
            (None, _) => None,
        };

        Ok(Self {
            path: path.to_path_buf(),
            id,
            url,
            branch: head.branch,
            is_clean: backend.is_clean(path)?,
            last_updated,
            commit_count: backend.commit_count(path).unwrap_or(0),
            active,
        })
    }
}
