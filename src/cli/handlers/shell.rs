// src/cli/handlers/shell.rs

//! `agentsh shell`: interactive loop over a persistent session.

use crate::{
    CancellationToken,
    cli::{CliError, args::ShellArgs, handlers::commons},
    core::{
        service::{ExecService, ToolOutput, ToolRequest, ToolStatus},
        settings,
    },
    models::Dialect,
    system::events::EventSink,
};
use anyhow::Result;
use clap::Parser;
use colored::*;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Empty,
    Exit,
    Help,
    Jobs,
    Background(String),
    Output { handle: String, clear: bool },
    Kill { handle: String, force: bool },
    /// A built-in typed with missing or malformed arguments.
    Usage(&'static str),
    Shell(String),
}

/// Splits prompt input into built-ins (`:` prefixed) and plain shell commands.
fn parse_repl_line(line: &str) -> ReplCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(builtin) = trimmed.strip_prefix(':') else {
        return ReplCommand::Shell(line.trim_end().to_string());
    };

    let (name, rest) = builtin
        .split_once(char::is_whitespace)
        .map_or((builtin, ""), |(n, r)| (n, r.trim()));
    let words: Vec<&str> = rest.split_whitespace().collect();
    let flag = |f: &str| words.iter().any(|w| *w == f);
    let handle = words.iter().find(|w| !w.starts_with("--")).map(|w| w.to_string());

    match name {
        "exit" | "quit" | "q" => ReplCommand::Exit,
        "help" | "h" | "?" => ReplCommand::Help,
        "jobs" => ReplCommand::Jobs,
        "bg" if !rest.is_empty() => ReplCommand::Background(rest.to_string()),
        "bg" => ReplCommand::Usage(":bg <command>"),
        "out" => match handle {
            Some(handle) => ReplCommand::Output {
                handle,
                clear: flag("--clear"),
            },
            None => ReplCommand::Usage(":out <handle> [--clear]"),
        },
        "kill" => match handle {
            Some(handle) => ReplCommand::Kill {
                handle,
                force: flag("--force"),
            },
            None => ReplCommand::Usage(":kill <handle> [--force]"),
        },
        _ => ReplCommand::Usage(":help"),
    }
}

/// Main entry point for the `shell` command.
pub fn handle(args: Vec<String>, cancel: &CancellationToken) -> Result<()> {
    let shell_args = ShellArgs::try_parse_from(&args)?;
    let settings = settings::load_or_default();
    let dialect = commons::pick_dialect(shell_args.dialect, &settings);
    let timeout_ms = shell_args.timeout_ms;

    let runtime = commons::build_runtime()?;
    let outcome = runtime.block_on(async {
        let service = ExecService::from_settings(settings, EventSink::none());
        let sweeper = service.start_sweeper();

        println!(
            "{}",
            format!(t!("shell.info.banner"), dialect = dialect).bold()
        );
        let outcome = repl(&service, dialect, timeout_ms, cancel).await;

        // Every exit path, Ctrl+C included, takes the background jobs down with us.
        service.shutdown().await;
        sweeper.abort();
        outcome
    });
    // The stdin reader blocks on a thread of its own; do not wait for it.
    runtime.shutdown_timeout(Duration::from_millis(100));
    outcome
}

async fn repl(
    service: &ExecService,
    dialect: Dialect,
    timeout_ms: Option<u64>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} ", format!("{}>", dialect).cyan().bold());
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                cancel.store(true, Ordering::SeqCst);
                println!();
                return Err(CliError::Interrupted.into());
            }
        };
        // EOF (Ctrl+D) ends the session like `:exit`.
        let Some(line) = line else {
            println!();
            return Ok(());
        };

        let request = match parse_repl_line(&line) {
            ReplCommand::Empty => continue,
            ReplCommand::Exit => return Ok(()),
            ReplCommand::Help => {
                println!("{}", t!("shell.help"));
                continue;
            }
            ReplCommand::Usage(usage) => {
                println!("{} {}", t!("shell.label.usage").yellow(), usage);
                continue;
            }
            ReplCommand::Jobs => ToolRequest::List,
            ReplCommand::Background(command) => ToolRequest::Launch {
                command,
                args: Vec::new(),
                shell: Some(dialect),
                name: None,
            },
            ReplCommand::Output { handle, clear } => ToolRequest::Poll { handle, clear },
            ReplCommand::Kill { handle, force } => ToolRequest::Kill { handle, force },
            ReplCommand::Shell(command) => ToolRequest::Session {
                dialect: Some(dialect),
                command,
                timeout_ms,
            },
        };

        let is_session = matches!(request, ToolRequest::Session { .. });
        match service.handle(request, None).await {
            Ok(output) if is_session => print_session_output(&output),
            Ok(output) => print!("{}", output.render()),
            Err(e) => eprintln!("{}: {}", "Error".red().bold(), e),
        }
    }
}

fn print_session_output(output: &ToolOutput) {
    print!("{}", output.stdout);
    if !output.stderr.is_empty() {
        eprint!("{}", output.stderr.red());
    }
    match output.status {
        ToolStatus::TimedOut => println!("{}", t!("shell.warning.timed_out").yellow()),
        ToolStatus::Failed => {
            let code = output.exit_code.unwrap_or_default();
            println!("{}", format!(t!("shell.info.exit_code"), code = code).dimmed());
        }
        _ => {}
    }
}
