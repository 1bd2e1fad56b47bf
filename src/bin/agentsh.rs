// src/bin/agentsh.rs

//! Entry point of the `agentsh` command-line tool.

use agentsh::{
    CancellationToken,
    cli::{Cli, CliError, handlers},
};
use anyhow::Result;
use clap::{CommandFactory, Parser};
use colored::*;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

// --- Command Definition and Registry ---

/// A CLI action, its aliases, and its synchronous handler.
struct CommandDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    handler: fn(Vec<String>, &CancellationToken) -> Result<()>,
}

/// Every action the binary understands. Handlers parse their own arguments.
static COMMAND_REGISTRY: &[CommandDefinition] = &[
    CommandDefinition {
        name: "escape",
        aliases: &["quote"],
        handler: handlers::escape::handle,
    },
    CommandDefinition {
        name: "run",
        aliases: &["exec"],
        handler: handlers::run::handle,
    },
    CommandDefinition {
        name: "shell",
        aliases: &["sh", "repl"],
        handler: handlers::shell::handle,
    },
    CommandDefinition {
        name: "which",
        aliases: &[],
        handler: handlers::which::handle,
    },
];

/// Finds a command definition by name or alias.
fn find_command(name: &str) -> Option<&'static CommandDefinition> {
    COMMAND_REGISTRY
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

/// Sets up logging, dispatches to the handler and centralizes error reporting.
fn main() {
    let cancellation_token = Arc::new(AtomicBool::new(false));
    env_logger::init();

    if let Err(e) = run_cli(Cli::parse(), cancellation_token) {
        match e.downcast_ref::<CliError>() {
            // Interrupted by Ctrl+C: exit quietly like a shell would.
            Some(CliError::Interrupted) => std::process::exit(130),
            // The child's own exit code is passed through.
            Some(CliError::Exit(code)) => std::process::exit(*code),
            None => {
                eprintln!("\n{}: {}", "Error".red().bold(), e);
                std::process::exit(1);
            }
        }
    }
}

fn run_cli(cli: Cli, cancellation_token: CancellationToken) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);

    let Some(action) = cli.action else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match find_command(&action) {
        Some(command) => (command.handler)(cli.args, &cancellation_token),
        None => Err(anyhow::anyhow!(
            agentsh::t!("cli.error.unknown_action"),
            action = action.yellow()
        )),
    }
}
