use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::ConfigError;
use crate::error::Result;

const GIT_DIR: &str = ".git";

/// Finds repository roots under `roots`, sorted and deduplicated.
///
/// Directories below a found repository are never visited, so nested
/// repositories are skipped. Unreadable directories are skipped as well.
pub fn locate(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();

    for root in roots {
        let is_dir = fs::metadata(root).map(|meta| meta.is_dir()).unwrap_or(false);
        if !is_dir {
            return Err(ConfigError::InvalidRoot(root.clone()).into());
        }

        let mut walker = WalkDir::new(root).follow_links(false).into_iter();
        loop {
            let entry = match walker.next() {
                None => break,
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            if entry.file_name() == GIT_DIR {
                walker.skip_current_dir();
                continue;
            }
            if is_repository_root(entry.path()) {
                found.insert(entry.path().to_path_buf());
                walker.skip_current_dir();
            }
        }
    }

    let repos = drop_nested(found);
    tracing::info!(count = repos.len(), "discovered repositories");
    Ok(repos)
}

fn is_repository_root(path: &Path) -> bool {
    path.join(GIT_DIR).is_dir()
}

// overlapping roots can still yield a repository below another one
fn drop_nested(found: BTreeSet<PathBuf>) -> Vec<PathBuf> {
    let mut repos: Vec<PathBuf> = Vec::with_capacity(found.len());
    for path in found {
        if repos.last().is_some_and(|parent| path.starts_with(parent)) {
            continue;
        }
        repos.push(path);
    }
    repos
}
