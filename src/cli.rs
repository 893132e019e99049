use crate::config::loader::{self, LoadReport};
use crate::config::{Config, ConfigOverrides, ConfigStore, ConfigValue};
use crate::error::RunError;
use crate::model::{CommandSpec, RunKind, RunReport};
use crate::orchestrator::{read_commands, run_once, run_session, Runner};
use crate::phrases::PhrasePicker;
use crate::sink::{NotifyLevel, TerminalSink};
use crate::supervisor::process::TokioSpawner;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "build-runner",
    version,
    about = "Run a project's build or clean command with output capture and a timeout watchdog"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Override a config field for this invocation (repeatable), e.g. --set notify=false
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    pub set: Vec<String>,

    /// Stop the job after this long (e.g. 90s, 5m); 0s disables the watchdog
    #[arg(long, global = true)]
    pub timeout: Option<humantime::Duration>,

    /// Time between the soft stop and the hard kill
    #[arg(long, global = true)]
    pub kill_grace: Option<humantime::Duration>,

    /// Ignore the global and project config files
    #[arg(long, global = true)]
    pub no_config: bool,

    /// Print a JSON report on stdout for every finished run
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins when set
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the build command
    Build(RunArgs),
    /// Run the clean command
    Clean(RunArgs),
    /// Print the status string ("[project]" or nothing)
    Status,
    /// Read build/clean/stop/set/status/quit commands from stdin
    Session,
    /// Print the merged configuration as JSON
    Config,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Command line run through the platform shell instead of the configured one
    #[arg(long, conflicts_with = "argv")]
    pub cmd: Option<String>,

    /// Program and arguments run directly instead of the configured command
    #[arg(last = true)]
    pub argv: Vec<String>,
}

impl RunArgs {
    fn overriding(&self) -> Option<CommandSpec> {
        match (&self.cmd, self.argv.is_empty()) {
            (Some(line), _) => Some(CommandSpec::Shell(line.clone())),
            (None, false) => Some(CommandSpec::Argv(self.argv.clone())),
            (None, true) => None,
        }
    }
}

/// Config record built from files plus command-line overrides, and what went wrong.
pub struct LoadedConfig {
    pub store: ConfigStore,
    pub report: LoadReport,
    /// Directory of the project file, used as the job's working directory.
    pub project_root: Option<PathBuf>,
}

/// Fold the command-line layer (`--set`, `--timeout`, `--kill-grace`) into overrides.
pub fn cli_overrides(args: &Cli) -> Result<ConfigOverrides> {
    let mut overrides = ConfigOverrides::new();
    for assignment in &args.set {
        overrides
            .set_assignment(assignment)
            .with_context(|| format!("invalid --set `{assignment}`"))?;
    }
    if let Some(timeout) = args.timeout {
        overrides.set(
            "timeout_seconds",
            ConfigValue::number(whole_seconds(timeout.into()) as f64),
        );
    }
    if let Some(grace) = args.kill_grace {
        let grace: Duration = grace.into();
        overrides.set("kill_grace_ms", ConfigValue::number(grace.as_millis() as f64));
    }
    Ok(overrides)
}

/// Seconds, rounded up so a sub-second timeout never disables the watchdog.
fn whole_seconds(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Defaults, then the global file, then the project file, then the command line.
pub fn build_store(args: &Cli, global: Option<&Path>, cwd: &Path) -> Result<LoadedConfig> {
    let mut store = ConfigStore::new(Config::default());
    let (mut report, project_root) = if args.no_config {
        (LoadReport::default(), None)
    } else {
        let report = loader::load(&mut store, global, cwd);
        let root = loader::find_project_file(cwd).and_then(|p| p.parent().map(Path::to_path_buf));
        (report, root)
    };

    let overrides = cli_overrides(args)?;
    for issue in store.merge(&overrides) {
        report.failures.push(RunError::ConfigLoadFailure {
            path: PathBuf::from("<command line>"),
            field: Some(issue.field),
            reason: issue.reason,
        });
    }
    Ok(LoadedConfig {
        store,
        report,
        project_root,
    })
}

/// Execute the parsed command line. Returns the process exit code.
pub async fn run(args: Cli) -> Result<i32> {
    let cwd = std::env::current_dir().context("failed to determine the working directory")?;
    let global = loader::global_config_path();
    let loaded = build_store(&args, global.as_deref(), &cwd)?;
    tracing::debug!(sources = ?loaded.report.sources, "configuration loaded");

    match args.command.clone() {
        Command::Status => {
            report_failures(&loaded.report, |msg| eprintln!("warning: {msg}"));
            println!("{}", crate::status::status_line(loaded.store.get()));
            Ok(0)
        }
        Command::Config => {
            report_failures(&loaded.report, |msg| eprintln!("warning: {msg}"));
            let out = serde_json::to_string_pretty(loaded.store.get())?;
            println!("{out}");
            Ok(0)
        }
        Command::Build(run_args) => run_one(&args, loaded, RunKind::Build, run_args).await,
        Command::Clean(run_args) => run_one(&args, loaded, RunKind::Clean, run_args).await,
        Command::Session => run_interactive(&args, loaded).await,
    }
}

fn report_failures(report: &LoadReport, mut emit: impl FnMut(&str)) {
    for failure in &report.failures {
        emit(&failure.to_string());
    }
}

fn new_runner(
    loaded: LoadedConfig,
) -> (
    Runner<TerminalSink, TokioSpawner>,
    mpsc::UnboundedReceiver<crate::model::JobEvent>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut runner = Runner::new(
        loaded.store,
        TerminalSink::spawn(),
        TokioSpawner::new(loaded.project_root),
        PhrasePicker::default(),
        events_tx,
    );
    for failure in &loaded.report.failures {
        let level = if failure.is_warning() {
            NotifyLevel::Warn
        } else {
            NotifyLevel::Error
        };
        runner.notify(&failure.to_string(), level);
    }
    (runner, events_rx)
}

fn print_report(report: &RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

async fn run_one(args: &Cli, loaded: LoadedConfig, kind: RunKind, run_args: RunArgs) -> Result<i32> {
    let (mut runner, mut events) = new_runner(loaded);
    let outcome = run_once(&mut runner, &mut events, kind, run_args.overriding()).await;
    // The sink owns stdout until it is closed; the JSON report goes after it.
    runner.into_sink().close().await;

    match outcome {
        Ok(Some(report)) => {
            tracing::info!(job = %report.job, code = report.exit_code, "run finished");
            if args.json {
                print_report(&report)?;
            }
            Ok(if report.success { 0 } else { 1 })
        }
        Ok(None) => Ok(0),
        // Already reported through the sink.
        Err(_) => Ok(1),
    }
}

async fn run_interactive(args: &Cli, loaded: LoadedConfig) -> Result<i32> {
    let (mut runner, mut events) = new_runner(loaded);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_commands(cmd_tx));

    let mut reports = Vec::new();
    run_session(&mut runner, &mut events, cmd_rx, |report| reports.push(report)).await;
    let sink = runner.into_sink();
    sink.close().await;

    if args.json {
        for report in &reports {
            print_report(report)?;
        }
    }
    let failed = reports.last().is_some_and(|r| !r.success);
    Ok(i32::from(failed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).expect("valid command line")
    }

    #[test]
    fn run_args_select_the_override_kind() {
        let cli = parse(&["build-runner", "build", "--cmd", "make -j4 | tee log"]);
        let Command::Build(run) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(
            run.overriding(),
            Some(CommandSpec::Shell("make -j4 | tee log".into()))
        );

        let cli = parse(&["build-runner", "clean", "--", "cargo", "clean"]);
        let Command::Clean(run) = cli.command else {
            panic!("expected clean");
        };
        assert_eq!(
            run.overriding(),
            Some(CommandSpec::Argv(vec!["cargo".into(), "clean".into()]))
        );

        let cli = parse(&["build-runner", "build"]);
        let Command::Build(run) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(run.overriding(), None);
    }

    #[test]
    fn cmd_and_argv_conflict() {
        assert!(Cli::try_parse_from(["build-runner", "build", "--cmd", "make", "--", "make"]).is_err());
    }

    #[test]
    fn command_line_layer_wins_over_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join(".build-runner.json"),
            r#"{"project_name": "from-file", "timeout_seconds": 10, "notify": false}"#,
        )
        .unwrap();
        let cli = parse(&[
            "build-runner",
            "--set",
            "project_name=cli",
            "--timeout",
            "1500ms",
            "--kill-grace",
            "250ms",
            "status",
        ]);
        let loaded = build_store(&cli, None, tmp.path()).expect("store");
        let cfg = loaded.store.get();
        assert_eq!(cfg.project_name.as_deref(), Some("cli"));
        assert_eq!(cfg.timeout_seconds, 2);
        assert_eq!(cfg.kill_grace_ms, 250);
        assert!(!cfg.notify);
        assert_eq!(loaded.project_root.as_deref(), Some(tmp.path()));
    }

    #[test]
    fn project_file_wins_over_global_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let global = tmp.path().join("global.json");
        std::fs::write(
            &global,
            r#"{"project_name": "global", "build_key": "F7", "kill_grace_ms": 900}"#,
        )
        .unwrap();
        let project = tmp.path().join("proj");
        std::fs::create_dir(&project).unwrap();
        std::fs::write(
            project.join(".build-runner.json"),
            r#"{"project_name": "local"}"#,
        )
        .unwrap();

        let cli = parse(&["build-runner", "status"]);
        let loaded = build_store(&cli, Some(&global), &project).expect("store");
        let cfg = loaded.store.get();
        assert_eq!(cfg.project_name.as_deref(), Some("local"));
        assert_eq!(cfg.build_key.as_deref(), Some("F7"));
        assert_eq!(cfg.kill_grace_ms, 900);
        assert!(loaded.report.failures.is_empty());

        let cli = parse(&["build-runner", "--no-config", "status"]);
        let loaded = build_store(&cli, Some(&global), &project).expect("store");
        assert_eq!(loaded.store.get().project_name, None);
    }

    #[test]
    fn bad_command_line_values_become_load_failures() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cli = parse(&["build-runner", "--no-config", "--set", "display_mode=diagonal", "config"]);
        let loaded = build_store(&cli, None, tmp.path()).expect("store");
        assert_eq!(loaded.report.failures.len(), 1);
        assert!(loaded.report.failures[0].to_string().contains("display_mode"));
        assert_eq!(loaded.project_root, None);

        let cli = parse(&["build-runner", "--set", "no-equals", "config"]);
        assert!(cli_overrides(&cli).is_err());
    }

    #[test]
    fn sub_second_timeouts_round_up() {
        assert_eq!(whole_seconds(Duration::from_millis(1)), 1);
        assert_eq!(whole_seconds(Duration::from_secs(3)), 3);
        assert_eq!(whole_seconds(Duration::ZERO), 0);
    }
}
