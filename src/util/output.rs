use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use console::style;
use dialoguer::Confirm;

use crate::git::GitBackend;

pub fn warn(message: &str) {
    let _ = writeln!(io::stderr(), "{}", style(message).yellow());
}

pub fn error(message: &str) {
    let _ = writeln!(io::stderr(), "{}", style(message).red());
}

pub fn confirm(prompt: &str, assume_yes: bool) -> Result<bool, dialoguer::Error> {
    if assume_yes {
        return Ok(true);
    }

    Confirm::new().with_prompt(prompt).default(false).interact()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    DryRun,
    Failed(String),
    Note(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Success => write!(f, "{}", style("success").green()),
            Verdict::DryRun => write!(f, "{}", style("dry-run").yellow()),
            Verdict::Failed(message) => write!(f, "{}", style(message).red()),
            Verdict::Note(message) => write!(f, "{}", message),
        }
    }
}

pub struct Header<'a> {
    pub index: usize,
    pub total: usize,
    pub active: usize,
    pub path: &'a Path,
    pub url: Option<&'a str>,
    pub branch: Option<&'a str>,
}

pub trait HeaderRenderer: Send + Sync {
    fn render(&self, out: &mut dyn Write, header: &Header<'_>) -> io::Result<()>;
}

pub struct DefaultHeader;

impl HeaderRenderer for DefaultHeader {
    fn render(&self, out: &mut dyn Write, header: &Header<'_>) -> io::Result<()> {
        writeln!(out)?;
        writeln!(
            out,
            "{} {}",
            style(format!("[{}/{}]", header.index, header.total)).bold(),
            style(format!("(active: {})", header.active)).dim()
        )?;
        writeln!(out, "{}", style(header.path.display()).bold())?;
        if let Some(url) = header.url {
            writeln!(out, "{}", url)?;
        }
        if let Some(branch) = header.branch {
            writeln!(out, "{}", branch)?;
        }
        Ok(())
    }
}

/// Serializes per-repository output blocks written by concurrent tasks.
///
/// Each task records its block in memory and writes it to the sink in one piece when it finishes.
/// The update lock is separate from the sink so a repair that mutates a repository never waits on
/// another task's block being written.
pub struct OutputCoordinator {
    sink: Mutex<Box<dyn Write + Send>>,
    update: Mutex<()>,
    renderer: Box<dyn HeaderRenderer>,
    only_updated: bool,
    active: AtomicUsize,
}

impl OutputCoordinator {
    pub fn new(
        sink: Box<dyn Write + Send>,
        renderer: Box<dyn HeaderRenderer>,
        only_updated: bool,
    ) -> Self {
        Self {
            sink: Mutex::new(sink),
            update: Mutex::new(()),
            renderer,
            only_updated,
            active: AtomicUsize::new(0),
        }
    }

    pub fn stdout(only_updated: bool) -> Self {
        Self::new(Box::new(io::stdout()), Box::new(DefaultHeader), only_updated)
    }

    pub fn only_updated(&self) -> bool {
        self.only_updated
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of repositories still waiting, shown in every header.
    pub fn set_active(&self, remaining: usize) {
        self.active.store(remaining, Ordering::SeqCst);
    }

    pub fn task<'a>(
        &'a self,
        backend: &'a dyn GitBackend,
        path: &'a Path,
        index: usize,
        total: usize,
    ) -> TaskOutput<'a> {
        TaskOutput {
            coordinator: self,
            backend,
            path,
            index,
            total,
            block: RefCell::new(Vec::new()),
            written: Cell::new(false),
        }
    }

    /// Writes a line outside any repository block.
    pub fn line(&self, text: &str) {
        let mut sink = self.sink();
        let _ = writeln!(sink, "{}", text);
        let _ = sink.flush();
    }

    fn sink(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TaskOutput<'a> {
    coordinator: &'a OutputCoordinator,
    backend: &'a dyn GitBackend,
    path: &'a Path,
    index: usize,
    total: usize,
    block: RefCell<Vec<u8>>,
    written: Cell<bool>,
}

impl<'a> TaskOutput<'a> {
    pub fn path(&self) -> &Path {
        self.path
    }

    pub fn only_updated(&self) -> bool {
        self.coordinator.only_updated
    }

    pub fn lock(&self) -> LockToken<'_> {
        LockToken {
            _update: self
                .coordinator
                .update
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            task: self,
        }
    }

    /// Closes the block: quiet repositories still get a header unless only changes are shown.
    pub fn finish(&self) {
        self.emit(!self.coordinator.only_updated);
    }

    /// Writes whatever was recorded so far, without a header for an empty block.
    pub fn flush(&self) {
        self.emit(false);
    }

    fn emit(&self, include_quiet: bool) {
        if self.written.replace(true) {
            return;
        }
        let body = self.block.take();
        if body.is_empty() && !include_quiet {
            return;
        }

        let url = self.backend.remote_url(self.path).ok();
        let branch = self
            .backend
            .head(self.path)
            .ok()
            .and_then(|head| head.branch);
        let header = Header {
            index: self.index,
            total: self.total,
            active: self.coordinator.active(),
            path: self.path,
            url: url.as_deref(),
            branch: branch.as_deref(),
        };

        let mut sink = self.coordinator.sink();
        let _ = self.coordinator.renderer.render(&mut **sink, &header);
        let _ = sink.write_all(&body);
        let _ = sink.flush();
    }
}

impl Drop for TaskOutput<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Proof that the update lock is held. Repairs take it by `&mut` so nested steps never relock.
pub struct LockToken<'a> {
    _update: MutexGuard<'a, ()>,
    task: &'a TaskOutput<'a>,
}

impl LockToken<'_> {
    /// `<label>: <verdict>` for a git step (pull, fetch, gc, remote).
    pub fn step(&mut self, label: &str, verdict: &Verdict) {
        self.line(format_args!("{}: {}", style(label).cyan(), verdict));
    }

    /// `<action>: <verdict>` for a local repair.
    pub fn repair(&mut self, action: &str, verdict: &Verdict) {
        self.line(format_args!("{}: {}", style(action).yellow(), verdict));
    }

    pub fn warn(&mut self, message: &str) {
        self.line(format_args!("{}", style(message).yellow()));
    }

    pub fn error(&mut self, err: &dyn fmt::Display) {
        self.line(format_args!("{}", style(err.to_string()).red()));
    }

    pub fn text(&mut self, text: &str) {
        for line in text.lines() {
            self.line(format_args!("{}", line));
        }
    }

    fn line(&mut self, args: fmt::Arguments<'_>) {
        let mut block = self.task.block.borrow_mut();
        let _ = block.write_fmt(args);
        block.push(b'\n');
    }
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    use super::memory::MemorySink;
    use super::*;
    use crate::core::testing::FakeGit;

    fn coordinator(sink: &MemorySink, only_updated: bool) -> OutputCoordinator {
        console::set_colors_enabled(false);
        OutputCoordinator::new(Box::new(sink.clone()), Box::new(DefaultHeader), only_updated)
    }

    #[test]
    fn header_is_printed_once_per_task() {
        let sink = MemorySink::default();
        let output = coordinator(&sink, false);
        let git = FakeGit::new();
        let path = PathBuf::from("/fleet/github.com/org/app");
        git.add_repo(&path, "https://github.com/org/app.git", "main", "c1");

        output.set_active(5);
        let task = output.task(&git, &path, 3, 7);
        {
            let mut token = task.lock();
            token.repair("remove reference refs/heads/broken", &Verdict::Success);
            token.step("pull", &Verdict::DryRun);
        }
        task.lock().step("gc", &Verdict::Success);
        task.finish();

        let text = sink.contents();
        assert_eq!(text.matches("[3/7]").count(), 1);
        assert!(text.contains("(active: 5)"));
        assert!(text.contains("https://github.com/org/app.git"));
        assert!(text.contains("main"));
        assert!(text.contains("remove reference refs/heads/broken: success"));
        assert!(text.contains("pull: dry-run"));
        assert!(text.contains("gc: success"));
    }

    #[test]
    fn alternating_tasks_keep_their_lines_under_their_own_header() {
        let sink = MemorySink::default();
        let output = coordinator(&sink, true);
        let git = FakeGit::new();
        let first = PathBuf::from("/fleet/first");
        let second = PathBuf::from("/fleet/second");
        git.add_repo(&first, "https://example.com/first.git", "main", "c1");
        git.add_repo(&second, "https://example.com/second.git", "main", "c1");

        let a = output.task(&git, &first, 1, 2);
        let b = output.task(&git, &second, 2, 2);
        a.lock().step("pull", &Verdict::Success);
        b.lock().step("pull", &Verdict::Success);
        a.lock().step("gc", &Verdict::Success);
        b.finish();
        a.finish();

        let text = sink.contents();
        let lines: Vec<&str> = text.lines().filter(|line| !line.is_empty()).collect();
        let second_at = lines
            .iter()
            .position(|line| *line == "/fleet/second")
            .expect("second header");
        let first_at = lines
            .iter()
            .position(|line| *line == "/fleet/first")
            .expect("first header");
        assert!(second_at < first_at);
        assert_eq!(&lines[first_at + 3..], &["pull: success", "gc: success"]);
        assert_eq!(lines[second_at + 3], "pull: success");
        assert_eq!(text.matches("gc: success").count(), 1);
    }

    #[test]
    fn nothing_reaches_the_sink_before_the_block_closes() {
        let sink = MemorySink::default();
        let output = coordinator(&sink, false);
        let git = FakeGit::new();
        let path = PathBuf::from("/fleet/app");
        git.add_repo(&path, "https://example.com/app.git", "main", "c1");

        let task = output.task(&git, &path, 1, 1);
        task.lock().step("pull", &Verdict::Success);
        assert!(sink.contents().is_empty());
        drop(task);
        assert!(sink.contents().contains("pull: success"));
    }

    #[test]
    fn flushing_an_empty_block_prints_nothing() {
        let sink = MemorySink::default();
        let output = coordinator(&sink, false);
        let git = FakeGit::new();
        let path = PathBuf::from("/fleet/app");
        git.add_repo(&path, "https://example.com/app.git", "main", "c1");

        output.task(&git, &path, 1, 1).flush();
        assert!(sink.contents().is_empty());
    }

    #[test]
    fn quiet_repository_still_gets_a_header() {
        let sink = MemorySink::default();
        let output = coordinator(&sink, false);
        let git = FakeGit::new();
        let path = PathBuf::from("/fleet/quiet");
        git.add_repo(&path, "https://example.com/quiet.git", "main", "c1");

        output.task(&git, &path, 1, 1).finish();
        assert!(sink.contents().contains("/fleet/quiet"));
    }

    #[test]
    fn only_updated_defers_header_until_something_prints() {
        let sink = MemorySink::default();
        let output = coordinator(&sink, true);
        let git = FakeGit::new();
        let quiet = PathBuf::from("/fleet/quiet");
        let noisy = PathBuf::from("/fleet/noisy");
        git.add_repo(&quiet, "https://example.com/quiet.git", "main", "c1");
        git.add_repo(&noisy, "https://example.com/noisy.git", "main", "c1");

        output.task(&git, &quiet, 1, 2).finish();
        let task = output.task(&git, &noisy, 2, 2);
        task.lock().step("pull", &Verdict::Success);
        task.finish();

        let text = sink.contents();
        assert!(!text.contains("/fleet/quiet"));
        assert!(text.contains("/fleet/noisy"));
        assert!(text.contains("[2/2]"));
    }

    #[test]
    fn concurrent_blocks_are_not_interleaved() {
        let sink = MemorySink::default();
        let output = Arc::new(coordinator(&sink, true));
        let git = Arc::new(FakeGit::new());
        let paths: Vec<PathBuf> = (0..8)
            .map(|i| PathBuf::from(format!("/fleet/repo-{i}")))
            .collect();
        for path in &paths {
            git.add_repo(path, "https://example.com/r.git", "main", "c1");
        }

        let handles: Vec<_> = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| {
                let output = Arc::clone(&output);
                let git = Arc::clone(&git);
                thread::spawn(move || {
                    let task = output.task(git.as_ref(), &path, i + 1, 8);
                    let mut token = task.lock();
                    token.step("first", &Verdict::Success);
                    token.step("second", &Verdict::Success);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join writer");
        }

        let text = sink.contents();
        let lines: Vec<&str> = text.lines().collect();
        for (pos, line) in lines.iter().enumerate() {
            if line.starts_with("first:") {
                assert_eq!(lines.get(pos + 1).copied(), Some("second: success"));
            }
        }
        assert_eq!(text.matches("first: success").count(), 8);
    }
}
