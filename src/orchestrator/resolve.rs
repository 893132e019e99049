//! Turning a run request into the argv that will actually be executed.

use crate::config::Config;
use crate::model::{CommandSpec, RunKind};

/// A command ready to spawn, plus the text shown in the run header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub argv: Vec<String>,
    pub display: String,
}

impl ResolvedCommand {
    pub fn from_spec(spec: &CommandSpec) -> Self {
        match spec {
            CommandSpec::Shell(line) => Self {
                argv: shell_argv(line),
                display: line.clone(),
            },
            CommandSpec::Argv(argv) => Self {
                argv: argv.clone(),
                display: display_argv(argv),
            },
        }
    }
}

/// Resolve the command for `kind`.
///
/// Build: override, then `build_command`, then the platform builder.
/// Clean: override, then `clean_command`; `None` means nothing is configured.
/// Blank strings and empty lists are skipped at every step.
pub fn resolve(kind: RunKind, overriding: Option<&CommandSpec>, cfg: &Config) -> Option<ResolvedCommand> {
    let configured = match kind {
        RunKind::Build => cfg.build_command.as_ref(),
        RunKind::Clean => cfg.clean_command.as_ref(),
    };
    let chosen = overriding
        .filter(|c| !c.is_blank())
        .or(configured.filter(|c| !c.is_blank()));
    match (chosen, kind) {
        (Some(spec), _) => Some(ResolvedCommand::from_spec(spec)),
        (None, RunKind::Build) => Some(default_builder(std::env::var("MAKE").ok().as_deref())),
        (None, RunKind::Clean) => None,
    }
}

/// The platform builder. `make_var` is the value of `$MAKE`, when set.
pub fn default_builder(make_var: Option<&str>) -> ResolvedCommand {
    let argv: Vec<String> = match make_var {
        Some(value) => value.split_whitespace().map(str::to_string).collect(),
        None => vec![PLATFORM_BUILDER.to_string()],
    };
    ResolvedCommand {
        display: display_argv(&argv),
        argv,
    }
}

#[cfg(windows)]
const PLATFORM_BUILDER: &str = "nmake";
#[cfg(not(windows))]
const PLATFORM_BUILDER: &str = "make";

/// Wrap a command line for the platform interpreter so pipes and redirects work.
pub fn shell_argv(line: &str) -> Vec<String> {
    #[cfg(windows)]
    let (shell, flag) = ("cmd", "/C");
    #[cfg(not(windows))]
    let (shell, flag) = ("sh", "-c");
    vec![shell.to_string(), flag.to_string(), line.to_string()]
}

fn display_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
