use std::env;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use crate::config::resolve::load_settings;
use crate::config::{settings, ConfigError, Settings};
use crate::core::listing::{self, SortKey, StateFilter};
use crate::core::{locator, reclone};
use crate::core::repo::RepositoryInfo;
use crate::core::retry::RetryPolicy;
use crate::core::run::{self, RunRequest};
use crate::core::{OperationKind, TaskOptions};
use crate::error::{FleetError, Result};
use crate::git::CliGit;
use crate::util::output::{self, OutputCoordinator};
use crate::util::parallel::{self, CancelReason, CancelToken};

#[derive(Parser, Debug)]
#[command(name = "repofleet")]
#[command(about = "Keeps a fleet of local git clones up to date", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[arg(long, global = true)]
    pub no_color: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pull every repository, repairing clones that cannot be pulled
    #[command(visible_alias = "up")]
    Update(UpdateArgs),
    /// Repair every repository without pulling
    Fix(BatchArgs),
    /// Repack repositories with loose objects
    Gc(BatchArgs),
    /// Delete repositories and clone them again from their remote
    #[command(visible_alias = "reset")]
    Reclone(RecloneArgs),
    /// List repositories
    #[command(visible_alias = "ls")]
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    pub roots: Vec<PathBuf>,
    #[arg(long)]
    pub dry_run: bool,
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,
    #[arg(short = 's', long)]
    pub no_errors: bool,
    #[arg(short = 'u', long)]
    pub only_updated: bool,
    #[arg(long, value_parser = parse_duration_arg)]
    pub exec_timeout: Option<Duration>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub batch: BatchArgs,
    #[arg(long, value_parser = parse_duration_arg)]
    pub retry_timeout: Option<Duration>,
}

#[derive(Args, Debug)]
pub struct RecloneArgs {
    /// Repository directories to replace
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
    #[arg(long)]
    pub dry_run: bool,
    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListFormat {
    #[default]
    Text,
    Json,
    Table,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    pub roots: Vec<PathBuf>,
    #[arg(short = 'o', long, value_enum, ignore_case = true, default_value_t = ListFormat::Text)]
    pub output: ListFormat,
    /// Sort by [±]time|name|commits; a leading `-` reverses the order
    #[arg(short = 's', long, allow_hyphen_values = true)]
    pub sort: Option<SortKey>,
    /// Keep only all|active|inactive repositories
    #[arg(short = 'a', long, default_value = "all")]
    pub state: StateFilter,
    #[arg(short = 'A', long)]
    pub show_state: bool,
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,
}

pub fn run() {
    let cli = Cli::parse();
    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }
    init_tracing(cli.verbose);

    if let Err(err) = dispatch(cli) {
        output::error(&err.to_string());
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("REPOFLEET_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,repofleet={level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Update(args) => handle_batch(
            OperationKind::Update,
            args.batch,
            args.retry_timeout,
            cli.config,
        ),
        Commands::Fix(args) => handle_batch(OperationKind::Fix, args, None, cli.config),
        Commands::Gc(args) => handle_batch(OperationKind::Gc, args, None, cli.config),
        Commands::Reclone(args) => handle_reclone(args),
        Commands::List(args) => handle_list(args, cli.config),
    }
}

fn handle_batch(
    kind: OperationKind,
    args: BatchArgs,
    retry_timeout: Option<Duration>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let roots = resolve_roots(&args.roots)?;
    let settings = load_settings(config_path, &roots[0])?;
    let only_updated = args.only_updated || settings.run.only_updated;
    let request = build_request(kind, &args, retry_timeout, &settings, roots);

    let git = CliGit::new()?;
    let output = OutputCoordinator::stdout(only_updated);
    let cancel = CancelToken::with_deadline(request.timeout);
    listen_for_interrupt(cancel.clone());

    let prepared = with_spinner("discovering repositories", || run::prepare(&request))?;
    let summary = run::execute(&git, prepared, &request, &output, cancel)?;

    output.line(&format!(
        "{} took {} (total: {})",
        kind.name(),
        format_elapsed(summary.elapsed),
        format_elapsed(summary.since_created())
    ));
    Ok(())
}

fn build_request(
    kind: OperationKind,
    args: &BatchArgs,
    retry_timeout: Option<Duration>,
    settings: &Settings,
    roots: Vec<PathBuf>,
) -> RunRequest {
    let mut retry = RetryPolicy::from(&settings.retry);
    if let Some(limit) = retry_timeout {
        retry = retry.with_max_elapsed(limit);
    }

    RunRequest {
        roots,
        kind,
        workers: args.workers.unwrap_or(settings.run.workers).max(1),
        suppress_errors: args.no_errors || settings.run.no_errors,
        timeout: args.exec_timeout.or(settings.run.exec_timeout),
        options: TaskOptions {
            dry_run: args.dry_run,
            retry,
            probe_timeout: settings.probe.timeout,
            gc_threshold: settings.gc.object_threshold,
        },
    }
}

fn handle_reclone(args: RecloneArgs) -> Result<()> {
    let paths = resolve_roots(&args.paths)?;
    if !args.dry_run {
        reclone::ensure_outside(&env::current_dir()?, &paths)?;
    }

    let assume_yes = args.yes || args.dry_run;
    if !assume_yes && !console::Term::stderr().is_term() {
        return Err(FleetError::Other(anyhow::anyhow!(
            "reclone requires confirmation; rerun with --yes for non-interactive use"
        )));
    }
    let listed: Vec<String> = paths.iter().map(|path| path.display().to_string()).collect();
    let prompt = format!(
        "Delete and re-clone {} repository path(s): {}",
        paths.len(),
        listed.join(", ")
    );
    let confirmed = output::confirm(&prompt, assume_yes)
        .map_err(|err| FleetError::Other(anyhow::Error::new(err)))?;
    if !confirmed {
        return Err(FleetError::Other(anyhow::anyhow!("operation canceled")));
    }

    let git = CliGit::new()?;
    let coordinator = OutputCoordinator::stdout(false);
    let started = Instant::now();
    reclone::run(&git, &paths, &coordinator, args.dry_run)?;
    coordinator.line(&format!("reclone took {}", format_elapsed(started.elapsed())));
    Ok(())
}

fn handle_list(args: ListArgs, config_path: Option<PathBuf>) -> Result<()> {
    let roots = resolve_roots(&args.roots)?;
    let settings = load_settings(config_path, &roots[0])?;
    let paths = with_spinner("discovering repositories", || locator::locate(&roots))?;

    let git = CliGit::new()?;
    // filtering by state implies showing it
    let show_state = args.show_state || args.state != StateFilter::All;
    let probe_timeout = show_state.then_some(settings.probe.timeout);
    let jobs = args.workers.or(Some(settings.run.workers));
    let results = parallel::run_in_parallel(paths, jobs, |path| {
        RepositoryInfo::collect(&git, &path, probe_timeout)
    });

    let mut infos = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(info) => infos.push(info),
            Err(err) => tracing::warn!(error = %err, "skipping repository"),
        }
    }

    infos.retain(|info| args.state.admits(info.active));
    if let Some(key) = args.sort {
        listing::sort(&mut infos, key);
    }

    match args.output {
        ListFormat::Json => {
            let json = serde_json::to_string_pretty(&infos)
                .map_err(|err| FleetError::Other(anyhow::Error::new(err)))?;
            println!("{json}");
        }
        ListFormat::Table => {
            listing::render_table(&mut io::stdout().lock(), &infos, show_state)?;
        }
        ListFormat::Text => {
            for info in &infos {
                println!("{}", render_list_line(info));
            }
        }
    }
    Ok(())
}

fn render_list_line(info: &RepositoryInfo) -> String {
    let mut line = format!("{}", style(info.path.display()).bold());
    if let Some(branch) = &info.branch {
        line.push_str(&format!(" {}", style(branch).cyan()));
    }
    if !info.is_clean {
        line.push_str(&format!(" {}", style("dirty").yellow()));
    }
    match info.active {
        Some(true) => line.push_str(&format!(" {}", style(listing::state_label(true)).green())),
        Some(false) => line.push_str(&format!(" {}", style(listing::state_label(false)).red())),
        None => {}
    }
    line.push_str(&format!(" ({} commits", info.commit_count));
    if let Some(updated) = info.last_updated {
        line.push_str(&format!(", last {}", updated.date()));
    }
    line.push(')');
    line
}

fn resolve_roots(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let requested = if roots.is_empty() {
        vec![env::current_dir()?]
    } else {
        roots.to_vec()
    };

    requested
        .into_iter()
        .map(|root| match root.canonicalize() {
            Ok(path) if path.is_dir() => Ok(path),
            _ => Err(ConfigError::InvalidRoot(root).into()),
        })
        .collect()
}

fn parse_duration_arg(value: &str) -> std::result::Result<Duration, String> {
    settings::parse_duration(value).map_err(|err| err.to_string())
}

fn format_elapsed(elapsed: Duration) -> String {
    let rounded = if elapsed >= Duration::from_secs(1) {
        Duration::from_secs(elapsed.as_secs())
    } else {
        Duration::from_millis(elapsed.subsec_millis().into())
    };
    humantime::format_duration(rounded).to_string()
}

fn with_spinner<T>(message: &str, work: impl FnOnce() -> T) -> T {
    let spinner = if console::Term::stderr().is_term() {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            bar.set_style(style);
        }
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Some(bar)
    } else {
        None
    };

    let result = work();
    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }
    result
}

/// First Ctrl-C cancels cooperatively; a second one exits at once.
fn listen_for_interrupt(cancel: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::warn!(error = %err, "ctrl-c listener unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                output::warn("interrupted, waiting for running tasks (Ctrl-C again to exit)");
                cancel.cancel(CancelReason::Interrupted);
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "could not start ctrl-c listener");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use time::macros::datetime;

    use super::*;

    fn batch(cli: Cli) -> BatchArgs {
        match cli.command {
            Commands::Update(args) => args.batch,
            Commands::Fix(args) | Commands::Gc(args) => args,
            Commands::Reclone(_) | Commands::List(_) => panic!("not a batch command"),
        }
    }

    #[test]
    fn parses_update_alias_and_flags() {
        let cli = Cli::try_parse_from([
            "repofleet",
            "up",
            "-j",
            "4",
            "-s",
            "-u",
            "--dry-run",
            "--exec-timeout",
            "1h",
            "--retry-timeout",
            "30s",
            "/src",
        ])
        .expect("parse");
        let Commands::Update(args) = cli.command else {
            panic!("expected update");
        };
        assert_eq!(args.retry_timeout, Some(Duration::from_secs(30)));
        assert_eq!(args.batch.workers, Some(4));
        assert!(args.batch.no_errors && args.batch.only_updated && args.batch.dry_run);
        assert_eq!(args.batch.exec_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(args.batch.roots, vec![PathBuf::from("/src")]);
    }

    #[test]
    fn retry_timeout_is_update_only() {
        assert!(Cli::try_parse_from(["repofleet", "fix", "--retry-timeout", "1m"]).is_err());
        assert!(Cli::try_parse_from(["repofleet", "gc", "--exec-timeout", "soon"]).is_err());
    }

    #[test]
    fn parses_list_alias() {
        let cli = Cli::try_parse_from(["repofleet", "ls", "-A", "-o", "JSON"]).expect("parse");
        let Commands::List(args) = cli.command else {
            panic!("expected list");
        };
        assert!(args.show_state);
        assert_eq!(args.output, ListFormat::Json);
        assert_eq!(args.state, StateFilter::All);
        assert!(args.sort.is_none());
        assert!(args.roots.is_empty());
    }

    #[test]
    fn parses_list_sort_and_state() {
        let cli = Cli::try_parse_from([
            "repofleet", "list", "-s", "-time", "-a", "archived", "-o", "table", "/src",
        ])
        .expect("parse");
        let Commands::List(args) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(args.sort, "-time".parse().ok());
        assert_eq!(args.state, StateFilter::Inactive);
        assert_eq!(args.output, ListFormat::Table);
        assert_eq!(args.roots, vec![PathBuf::from("/src")]);

        assert!(Cli::try_parse_from(["repofleet", "ls", "-s", "size"]).is_err());
        assert!(Cli::try_parse_from(["repofleet", "ls", "-a", "gone"]).is_err());
    }

    #[test]
    fn parses_reclone_alias() {
        let cli = Cli::try_parse_from(["repofleet", "reset", "-y", "/src/app"]).expect("parse");
        let Commands::Reclone(args) = cli.command else {
            panic!("expected reclone");
        };
        assert!(args.yes && !args.dry_run);
        assert_eq!(args.paths, vec![PathBuf::from("/src/app")]);

        assert!(Cli::try_parse_from(["repofleet", "reclone"]).is_err());
    }

    #[test]
    fn flags_override_settings() {
        let mut settings = Settings::default();
        settings.run.workers = 3;
        settings.run.exec_timeout = Some(Duration::from_secs(60));
        settings.run.no_errors = true;

        let cli = Cli::try_parse_from(["repofleet", "fix", "-j", "7"]).expect("parse");
        let args = batch(cli);
        let request = build_request(OperationKind::Fix, &args, None, &settings, vec![]);
        assert_eq!(request.workers, 7);
        assert!(request.suppress_errors);
        assert_eq!(request.timeout, Some(Duration::from_secs(60)));
        assert_eq!(request.options.gc_threshold, 1);

        let cli = Cli::try_parse_from(["repofleet", "update", "--exec-timeout", "5s"])
            .expect("parse");
        let args = batch(cli);
        let request = build_request(
            OperationKind::Update,
            &args,
            Some(Duration::from_secs(45)),
            &settings,
            vec![],
        );
        assert_eq!(request.workers, 3);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(request.options.retry.max_elapsed, Duration::from_secs(45));
    }

    #[test]
    fn rejects_missing_roots() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let missing = dir.path().join("nope");
        let err = resolve_roots(&[missing]).expect_err("missing root");
        assert!(matches!(err, FleetError::Config(ConfigError::InvalidRoot(_))));

        let roots = resolve_roots(&[dir.path().to_path_buf()]).expect("resolve");
        assert!(roots[0].is_absolute());
    }

    #[test]
    fn formats_elapsed_time() {
        assert_eq!(format_elapsed(Duration::from_millis(1500)), "1s");
        assert_eq!(format_elapsed(Duration::from_millis(250)), "250ms");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn renders_list_line() {
        console::set_colors_enabled(false);
        let info = RepositoryInfo {
            path: Path::new("/src/github.com/org/app").to_path_buf(),
            id: None,
            url: None,
            branch: Some("main".to_string()),
            is_clean: false,
            last_updated: Some(datetime!(2024-03-01 12:00 UTC)),
            commit_count: 42,
            active: Some(false),
        };
        assert_eq!(
            render_list_line(&info),
            "/src/github.com/org/app main dirty inactive (42 commits, last 2024-03-01)"
        );
    }
}
