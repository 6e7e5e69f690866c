use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::state::StateError;
use crate::git::outcome::RemoteError;
use crate::util::parallel::CancelReason;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Remote(#[from] RemoteError),
    #[error("git error: {0}")]
    Git(#[source] anyhow::Error),
    #[error("repository does not exist: {0}")]
    RepositoryMissing(PathBuf),
    #[error("giving up after {attempts} attempt(s): {reason}")]
    PullFailed { attempts: u32, reason: String },
    #[error("{0}")]
    Cancelled(CancelReason),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
