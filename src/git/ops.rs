use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use gix::bstr::ByteSlice;
use gix::progress::Discard;
use gix::remote;
use gix::status::index_worktree::iter::Summary;
use reqwest::StatusCode;

use crate::error::{FleetError, Result};
use crate::git::outcome::{
    classify_pull, classify_remote_listing, mentions_missing_object, PullOutcome, Reachability,
    RemoteError, RemoteHead,
};
use crate::git::status::StatusSummary;
use crate::git::traits::{GitBackend, HeadInfo, ReferenceInfo};

const MAX_REDIRECTS: usize = 10;

pub struct CliGit {
    http: reqwest::blocking::Client,
}

impl CliGit {
    pub fn new() -> Result<Self> {
        let policy = reqwest::redirect::Policy::custom(|attempt| {
            if attempt.status() == StatusCode::MOVED_PERMANENTLY {
                attempt.stop()
            } else if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("stopped after 10 redirects")
            } else {
                attempt.follow()
            }
        });
        let http = reqwest::blocking::Client::builder()
            .redirect(policy)
            .user_agent(concat!("repofleet/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| FleetError::Other(anyhow::Error::new(err)))?;
        Ok(Self { http })
    }
}

impl GitBackend for CliGit {
    fn is_repository(&self, path: &Path) -> bool {
        gix::open(path).is_ok()
    }

    fn remote_url(&self, path: &Path) -> Result<String> {
        let repo = open_repo(path)?;
        let remote = repo
            .find_fetch_remote(None)
            .map_err(|err| FleetError::Git(anyhow::Error::new(err)))?;
        let url = remote
            .url(remote::Direction::Fetch)
            .ok_or_else(|| FleetError::Other(anyhow::anyhow!("empty repository remote URL")))?;
        Ok(url.to_bstring().to_string())
    }

    fn head(&self, path: &Path) -> Result<HeadInfo> {
        let repo = open_repo(path)?;
        let branch = current_branch(&repo)
            .ok()
            .filter(|name| name != "(detached)" && name != "HEAD");
        let commit = repo.head_id().ok().map(|id| id.detach().to_string());
        Ok(HeadInfo { branch, commit })
    }

    fn is_clean(&self, path: &Path) -> Result<bool> {
        let repo = open_repo(path)?;
        Ok(!repo_status(&repo)?.has_tracked_changes())
    }

    fn has_missing_objects(&self, path: &Path) -> Result<bool> {
        let output = run_git(path, &["status", "--porcelain"])?;
        Ok(!output.success && mentions_missing_object(&output.text.to_lowercase()))
    }

    fn references(&self, path: &Path) -> Result<Vec<ReferenceInfo>> {
        let repo = open_repo(path)?;
        let platform = repo
            .references()
            .map_err(|err| FleetError::Git(anyhow::Error::new(err)))?;
        let iter = platform
            .all()
            .map_err(|err| FleetError::Git(anyhow::Error::new(err)))?;

        let mut references = Vec::new();
        for reference in iter {
            let reference =
                reference.map_err(|err| FleetError::Git(anyhow::anyhow!(err.to_string())))?;
            references.push(ReferenceInfo {
                name: reference.name().as_bstr().to_str_lossy().to_string(),
                target: reference.target().try_id().map(|id| id.to_string()),
            });
        }
        Ok(references)
    }

    fn remove_reference(&self, path: &Path, name: &str) -> Result<()> {
        let repo = open_repo(path)?;
        let reference = repo
            .find_reference(name)
            .map_err(|err| FleetError::Git(anyhow::Error::new(err)))?;
        reference
            .delete()
            .map_err(|err| FleetError::Git(anyhow::Error::new(err)))?;
        Ok(())
    }

    fn probe_reachable(&self, url: &str, timeout: Duration) -> Result<Reachability> {
        if !is_http_url(url) {
            return Ok(Reachability::Reachable);
        }

        let response = self
            .http
            .head(url)
            .timeout(timeout)
            .send()
            .map_err(|err| FleetError::Other(anyhow::Error::new(err)))?;
        let status = response.status();
        tracing::debug!(url, status = status.as_u16(), "probed remote");

        if status == StatusCode::MOVED_PERMANENTLY {
            if let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
            {
                let new_url = response
                    .url()
                    .join(location)
                    .map(|joined| joined.to_string())
                    .unwrap_or_else(|_| location.to_string());
                return Ok(Reachability::Moved { new_url });
            }
        }

        if status == StatusCode::OK {
            Ok(Reachability::Reachable)
        } else {
            Ok(Reachability::Unreachable {
                status: Some(status.as_u16()),
            })
        }
    }

    fn remote_head(&self, path: &Path) -> std::result::Result<RemoteHead, RemoteError> {
        let output = run_git(path, &["ls-remote", "--symref", "origin", "HEAD"])
            .map_err(|err| RemoteError::Other(err.to_string()))?;
        if !output.success {
            return Err(classify_remote_listing(&output.text));
        }
        parse_symref_listing(&output.text).ok_or(RemoteError::MissingHead)
    }

    fn pull(&self, path: &Path) -> PullOutcome {
        match run_git(path, &["pull", "--prune", "--ff-only"]) {
            Ok(output) => classify_pull(output.code, &output.text),
            Err(err) => PullOutcome::Failed {
                message: err.to_string(),
            },
        }
    }

    fn refetch(&self, path: &Path) -> Result<String> {
        run_git_checked(path, &["fetch", "--prune", "--refetch"], "fetch --refetch")
    }

    fn fetch_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        run_git_checked(path, &["fetch", "origin", refspec.as_str()], "fetch branch")?;
        Ok(())
    }

    fn repack(&self, path: &Path) -> Result<String> {
        run_git_checked(path, &["gc", "--prune=all"], "gc")
    }

    fn object_count(&self, path: &Path) -> Result<usize> {
        let repo = open_repo(path)?;
        count_objects(&repo.git_dir().join("objects"))
    }

    fn reset_hard(&self, path: &Path, commit: Option<&str>) -> Result<()> {
        let mut args = vec!["reset", "--hard"];
        if let Some(commit) = commit {
            args.push(commit);
        }
        run_git_checked(path, &args, "reset --hard")?;
        Ok(())
    }

    fn diff(&self, path: &Path) -> Result<String> {
        run_git_checked(path, &["diff"], "diff")
    }

    fn set_config(&self, path: &Path, key: &str, value: &str) -> Result<()> {
        run_git_checked(path, &["config", "--local", key, value], "config")?;
        Ok(())
    }

    fn replace_default_branch(&self, path: &Path, from: &str, to: &RemoteHead) -> Result<()> {
        run_git_checked(
            path,
            &["checkout", "-f", "-B", to.branch.as_str(), to.commit.as_str()],
            "checkout default branch",
        )?;
        let upstream = format!("origin/{}", to.branch);
        run_git_checked(
            path,
            &["branch", "--set-upstream-to", upstream.as_str(), to.branch.as_str()],
            "set branch upstream",
        )?;
        if from != to.branch {
            run_git_checked(path, &["branch", "-D", from], "delete old default branch")?;
        }
        Ok(())
    }

    fn set_remote_url(&self, path: &Path, url: &str) -> Result<()> {
        run_git_checked(path, &["remote", "set-url", "origin", url], "remote set-url")?;
        Ok(())
    }

    fn clone_into(&self, url: &str, destination: &Path) -> Result<()> {
        let parent = destination.parent().ok_or_else(|| {
            FleetError::Other(anyhow::anyhow!(
                "no parent directory: {}",
                destination.display()
            ))
        })?;
        let target = destination.to_str().ok_or_else(|| {
            FleetError::Other(anyhow::anyhow!(
                "path is not valid utf-8: {}",
                destination.display()
            ))
        })?;
        run_git_checked(parent, &["clone", "--quiet", url, target], "clone")?;
        Ok(())
    }

    fn commit_count(&self, path: &Path) -> Result<usize> {
        let output = run_git_checked(path, &["rev-list", "--count", "HEAD"], "rev-list --count")?;
        output
            .trim()
            .parse()
            .map_err(|err| FleetError::Other(anyhow::Error::new(err)))
    }

    fn last_commit_time(&self, path: &Path) -> Result<Option<i64>> {
        let output = run_git_checked(path, &["log", "-1", "--format=%ct"], "log")?;
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse()
            .map(Some)
            .map_err(|err| FleetError::Other(anyhow::Error::new(err)))
    }
}

pub fn open_repo(path: &Path) -> Result<gix::Repository> {
    gix::open(path).map_err(|err| FleetError::Git(anyhow::Error::new(err)))
}

pub fn repo_status(repo: &gix::Repository) -> Result<StatusSummary> {
    let platform = repo
        .status(Discard)
        .map_err(|err| FleetError::Git(anyhow::Error::new(err)))?;
    let mut summary = StatusSummary::default();

    for item in platform
        .into_iter(Vec::new())
        .map_err(|err| FleetError::Git(anyhow::Error::new(err)))?
    {
        let item = item.map_err(|err| FleetError::Git(anyhow::Error::new(err)))?;
        match item {
            gix::status::Item::TreeIndex(tree_index) => {
                let path = tree_index.location().to_str_lossy().to_string();
                summary.staged.push(path.into());
            }
            gix::status::Item::IndexWorktree(index_item) => {
                let path = index_item.rela_path().to_str_lossy().to_string();
                match index_item.summary() {
                    Some(Summary::Added) | Some(Summary::IntentToAdd) => {
                        summary.untracked.push(path.into());
                    }
                    Some(Summary::Conflict) => {
                        summary.conflicts.push(path.into());
                    }
                    _ => {
                        summary.modified.push(path.into());
                    }
                }
            }
        }
    }

    Ok(summary)
}

pub fn current_branch(repo: &gix::Repository) -> Result<String> {
    if let Some(work_dir) = repo.workdir() {
        if let Ok(output) = run_git(work_dir, &["rev-parse", "--abbrev-ref", "HEAD"]) {
            let name = output.text.trim().to_string();
            if output.success && !name.is_empty() {
                return Ok(name);
            }
        }
    }

    let head = repo
        .head()
        .map_err(|err| FleetError::Git(anyhow::Error::new(err)))?;
    if matches!(head.kind, gix::head::Kind::Detached { .. }) {
        return Ok("(detached)".to_string());
    }

    Ok(head.name().shorten().to_string())
}

pub fn parse_symref_listing(output: &str) -> Option<RemoteHead> {
    let mut branch = None;
    let mut commit = None;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("ref: ") {
            let mut parts = rest.split('\t');
            let target = parts.next().unwrap_or_default();
            if parts.next() == Some("HEAD") {
                branch = Some(
                    target
                        .strip_prefix("refs/heads/")
                        .unwrap_or(target)
                        .to_string(),
                );
            }
            continue;
        }

        let mut parts = line.split('\t');
        let id = parts.next().unwrap_or_default();
        if parts.next() == Some("HEAD") && !id.is_empty() {
            commit = Some(id.to_string());
        }
    }

    Some(RemoteHead {
        branch: branch?,
        commit: commit?,
    })
}

fn count_objects(objects_dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(objects_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "pack" {
            count += fs::read_dir(entry.path())?
                .filter_map(|item| item.ok())
                .filter(|item| item.path().extension().is_some_and(|ext| ext == "pack"))
                .count();
        } else if name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit()) {
            count += fs::read_dir(entry.path())?.count();
        }
    }
    Ok(count)
}

fn is_http_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

struct GitOutput {
    success: bool,
    code: Option<i32>,
    text: String,
}

fn run_git(path: &Path, args: &[&str]) -> Result<GitOutput> {
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(path)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("LC_ALL", "C")
        .stdin(Stdio::null());
    detach_process_group(&mut command);

    let output = command
        .output()
        .map_err(|err| FleetError::Other(anyhow::Error::new(err)))?;
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(GitOutput {
        success: output.status.success(),
        code: output.status.code(),
        text,
    })
}

fn run_git_checked(path: &Path, args: &[&str], context: &str) -> Result<String> {
    let output = run_git(path, args)?;
    if output.success {
        return Ok(output.text);
    }

    let detail = output
        .text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output")
        .to_string();
    Err(FleetError::Git(anyhow::anyhow!(format!(
        "git {} failed: {}",
        context, detail
    ))))
}

// git children stay out of the terminal's foreground group so Ctrl-C only reaches us
#[cfg(unix)]
fn detach_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn detach_process_group(_command: &mut Command) {}
