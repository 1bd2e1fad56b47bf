// src/cli/args.rs

//! Argument structs parsed by each action handler.

use crate::models::{Dialect, TimeoutStrategy};
use clap::Parser;
use std::path::PathBuf;

/// Arguments of `agentsh run`.
#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Runs a command once and waits for it."
)]
pub struct RunArgs {
    /// Kill the command after this many milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// How a timed-out command is stopped: immediate-kill, ctrl-c-only, kill-only, progressive.
    #[arg(long)]
    pub strategy: Option<TimeoutStrategy>,

    /// Run the command through this shell instead of executing it directly.
    #[arg(long)]
    pub shell: Option<Dialect>,

    /// Working directory of the command.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Print the result as JSON instead of streaming the output.
    #[arg(long)]
    pub json: bool,

    /// The program and its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Arguments of `agentsh shell`.
#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Starts an interactive prompt backed by a persistent shell session."
)]
pub struct ShellArgs {
    /// The shell dialect. Defaults to AGENTSH_SHELL, the settings file, then the platform.
    #[arg(long, short)]
    pub dialect: Option<Dialect>,

    /// Timeout for each command, in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// Arguments of `agentsh escape`.
#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Prints arguments escaped for a shell dialect."
)]
pub struct EscapeArgs {
    /// The shell dialect to escape for.
    #[arg(long, short)]
    pub dialect: Option<Dialect>,

    /// Escape for text piped to the shell's stdin instead of an argv position.
    #[arg(long)]
    pub stdin: bool,

    /// The arguments to escape.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Arguments of `agentsh which`.
#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Shows which executable backs each shell dialect."
)]
pub struct WhichArgs {
    /// Dialects to resolve. Defaults to all of them.
    pub dialects: Vec<Dialect>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_keep_command_flags() {
        let args = RunArgs::try_parse_from([
            "--timeout-ms",
            "500",
            "--strategy",
            "kill-only",
            "--",
            "grep",
            "-r",
            "needle",
        ])
        .unwrap();
        assert_eq!(args.timeout_ms, Some(500));
        assert_eq!(args.strategy, Some(TimeoutStrategy::KillOnly));
        assert_eq!(args.command, vec!["grep", "-r", "needle"]);
    }

    #[test]
    fn test_run_args_require_a_command() {
        assert!(RunArgs::try_parse_from(["--json"]).is_err());
    }

    #[test]
    fn test_which_args_parse_dialect_aliases() {
        let args = WhichArgs::try_parse_from(["pwsh", "bash"]).unwrap();
        assert_eq!(args.dialects, vec![Dialect::PowerShell, Dialect::Bash]);
    }
}
