use crate::core::repair;
use crate::core::task::RepoTask;
use crate::error::Result;

/// Repairs a clone in place without pulling.
pub fn fix(task: &RepoTask<'_>) -> Result<()> {
    {
        let mut token = task.output.lock();
        repair::fix_references(task, &mut token)?;
    }
    if task.git.has_missing_objects(task.path)? {
        repair::refetch(task)?;
    }
    repair::update_default_branch(task)?;
    repair::reset_default_branch(task)?;

    let mut token = task.output.lock();
    repair::make_clean(task, &mut token)
}

pub fn gc(task: &RepoTask<'_>) -> Result<()> {
    repair::repack_if_needed(task)
}
