use crate::core::task::RepoTask;
use crate::core::{maintenance, repair, update};
use crate::error::{FleetError, Result};
use crate::git::RemoteError;

/// Batch operation applied to every repository of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Update,
    Fix,
    Gc,
}

impl OperationKind {
    /// Command name; also keys the execution state file.
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Update => "update",
            OperationKind::Fix => "fix",
            OperationKind::Gc => "gc",
        }
    }
}

/// Runs `kind` for one repository. A remote that moved is followed by relocating the clone.
pub fn execute(kind: OperationKind, task: &RepoTask<'_>) -> Result<()> {
    let result = match kind {
        OperationKind::Update => update::update(task),
        OperationKind::Fix => maintenance::fix(task),
        OperationKind::Gc => maintenance::gc(task),
    };

    match result {
        Err(FleetError::Remote(RemoteError::Moved { old_url, new_url })) => {
            repair::relocate(task, &old_url, &new_url).map(|_| ())
        }
        other => other,
    }
}
