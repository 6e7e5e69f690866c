use std::path::PathBuf;

#[derive(Debug, Default, Clone)]
pub struct StatusSummary {
    pub staged: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub untracked: Vec<PathBuf>,
    pub conflicts: Vec<PathBuf>,
}

impl StatusSummary {
    // untracked files are excluded: a hard reset leaves them in place
    pub fn has_tracked_changes(&self) -> bool {
        !self.staged.is_empty() || !self.modified.is_empty() || !self.conflicts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::StatusSummary;

    #[test]
    fn untracked_files_are_not_tracked_changes() {
        let summary = StatusSummary {
            untracked: vec![PathBuf::from("notes.txt")],
            ..StatusSummary::default()
        };
        assert!(!summary.has_tracked_changes());
    }

    #[test]
    fn modified_files_are_tracked_changes() {
        let summary = StatusSummary {
            modified: vec![PathBuf::from("src/lib.rs")],
            ..StatusSummary::default()
        };
        assert!(summary.has_tracked_changes());
    }
}
