use thiserror::Error;

const ERROR_PREFIX: &str = "error:";
const FATAL_PREFIX: &str = "fatal:";

const CERTIFICATE_MARKERS: &[&str] = &[
    "ssl certificate problem",
    "certificate verify",
    "ssl_error",
    "no alternative certificate subject name",
    "server certificate verification failed",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("repository not reachable")]
    NotReachable,
    #[error("repository is disabled")]
    Disabled,
    #[error("repository is protected")]
    Protected,
    #[error("repository moved to: {new_url}")]
    Moved { old_url: String, new_url: String },
    #[error("missing remote head reference")]
    MissingHead,
    #[error("missing branch name")]
    MissingBranch,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable { status: Option<u16> },
    Moved { new_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHead {
    pub branch: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Updated { output: String },
    AlreadyUpToDate,
    AuthenticationRequired,
    ObjectMissing,
    WorktreeNotClean,
    UnstagedChanges,
    NonFastForward,
    DefaultBranchMismatch,
    ReferenceChanged,
    Disabled,
    Moved { new_url: String },
    Unreachable,
    CertificateInvalid,
    ServerError { status: u16 },
    ExitFailure { output: String },
    Corrupted { output: String },
    Failed { message: String },
}

impl PullOutcome {
    pub fn describe(&self) -> String {
        match self {
            PullOutcome::Updated { .. } => "success".to_string(),
            PullOutcome::AlreadyUpToDate => "already up to date".to_string(),
            PullOutcome::AuthenticationRequired => "authentication required".to_string(),
            PullOutcome::ObjectMissing => "object not found".to_string(),
            PullOutcome::WorktreeNotClean => "worktree contains unstaged changes".to_string(),
            PullOutcome::UnstagedChanges => "worktree contains unstaged changes".to_string(),
            PullOutcome::NonFastForward => "non-fast-forward update".to_string(),
            PullOutcome::DefaultBranchMismatch => "reference not found".to_string(),
            PullOutcome::ReferenceChanged => "reference has changed concurrently".to_string(),
            PullOutcome::Disabled => RemoteError::Disabled.to_string(),
            PullOutcome::Moved { new_url } => format!("repository moved to: {new_url}"),
            PullOutcome::Unreachable => RemoteError::NotReachable.to_string(),
            PullOutcome::CertificateInvalid => "certificate verification failed".to_string(),
            PullOutcome::ServerError { status } => format!("server error: {status}"),
            PullOutcome::ExitFailure { output } | PullOutcome::Corrupted { output } => {
                first_line(output)
            }
            PullOutcome::Failed { message } => message.clone(),
        }
    }
}

pub fn classify_pull(exit_code: Option<i32>, output: &str) -> PullOutcome {
    let lower = output.to_lowercase();

    if exit_code == Some(0) {
        if lower.contains("already up to date") || lower.contains("already up-to-date") {
            return PullOutcome::AlreadyUpToDate;
        }
        return PullOutcome::Updated {
            output: output.trim().to_string(),
        };
    }

    if lower.contains("is disabled") {
        return PullOutcome::Disabled;
    }
    if lower.contains("could not read username") || lower.contains("authentication failed") {
        return PullOutcome::AuthenticationRequired;
    }
    if let Some(reason) = access_failure_reason(&lower) {
        if CERTIFICATE_MARKERS.iter().any(|marker| reason.contains(marker)) {
            return PullOutcome::CertificateInvalid;
        }
        if let Some(status) = server_error_status(reason) {
            return PullOutcome::ServerError { status };
        }
        return PullOutcome::Unreachable;
    }
    if let Some(status) = server_error_status(&lower) {
        return PullOutcome::ServerError { status };
    }
    if lower.contains("not possible to fast-forward")
        || lower.contains("diverging branches")
        || lower.contains("non-fast-forward")
    {
        return PullOutcome::NonFastForward;
    }
    if lower.contains("files would be overwritten by merge") {
        return PullOutcome::WorktreeNotClean;
    }
    if lower.contains("you have unstaged changes") || lower.contains("uncommitted changes") {
        return PullOutcome::UnstagedChanges;
    }
    if lower.contains("but no such ref was fetched") {
        return PullOutcome::DefaultBranchMismatch;
    }
    if lower.contains("cannot lock ref") || lower.contains("unable to update local ref") {
        return PullOutcome::ReferenceChanged;
    }
    if mentions_missing_object(&lower) {
        return PullOutcome::ObjectMissing;
    }

    match exit_code {
        Some(1) => PullOutcome::ExitFailure {
            output: output.trim().to_string(),
        },
        Some(128) => PullOutcome::Corrupted {
            output: output.trim().to_string(),
        },
        Some(code) => PullOutcome::Failed {
            message: format!("git pull exited with status {code}: {}", first_line(output)),
        },
        None => PullOutcome::Failed {
            message: "git pull terminated by signal".to_string(),
        },
    }
}

pub fn classify_remote_listing(output: &str) -> RemoteError {
    let lower = output.to_lowercase();
    if lower.starts_with(ERROR_PREFIX) && lower.contains("is disabled") {
        return RemoteError::Disabled;
    }
    if lower.starts_with(FATAL_PREFIX) && lower.contains("could not read username") {
        return RemoteError::Protected;
    }
    RemoteError::Other(first_line(output))
}

pub fn mentions_missing_object(lower: &str) -> bool {
    lower.contains("bad object")
        || lower.contains("object not found")
        || lower.contains("did not send all necessary objects")
        || lower.contains("unable to read tree")
        || lower.contains("could not parse object")
        || lower.contains("missing blob object")
        || lower.contains("missing tree object")
        || lower.contains("is empty or corrupt")
}

/// Text after `unable to access '<url>': `, so the quoted url never takes part in matching.
fn access_failure_reason(lower: &str) -> Option<&str> {
    let marker = "unable to access '";
    let start = lower.find(marker)? + marker.len();
    let rest = &lower[start..];
    let reason = match rest.find("': ") {
        Some(end) => &rest[end + 3..],
        None => rest,
    };
    Some(reason.lines().next().unwrap_or(""))
}

fn server_error_status(lower: &str) -> Option<u16> {
    let marker = "the requested url returned error: ";
    let start = lower.find(marker)? + marker.len();
    let status: u16 = lower[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    if status >= 500 {
        Some(status)
    } else {
        None
    }
}

fn first_line(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
        .to_string()
}
