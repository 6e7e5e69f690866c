pub mod listing;
pub mod locator;
pub mod maintenance;
pub mod operation;
pub mod reclone;
pub mod repair;
pub mod repo;
pub mod retry;
pub mod run;
pub mod state;
pub mod task;
#[cfg(test)]
pub mod testing;
pub mod update;

pub use operation::OperationKind;
pub use repo::{RepoId, RepositoryInfo};
pub use run::{RunRequest, RunSummary};
pub use state::{ExecutionState, StateStore};
pub use task::TaskOptions;
