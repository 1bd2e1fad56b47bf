// src/cli/mod.rs

//! Command-line surface of the `agentsh` binary.

use clap::Parser;
use thiserror::Error;

pub mod args;
pub mod handlers;

/// Errors that end the process with a specific exit code instead of an error message.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliError {
    /// The user pressed Ctrl+C.
    #[error("Interrupted")]
    Interrupted,
    /// The executed command finished with a non-zero exit code, which becomes ours.
    #[error("Command exited with code {0}")]
    Exit(i32),
}

/// Builds the color-aware full help string at runtime.
fn build_help_string() -> &'static str {
    let use_colors = colored::control::SHOULD_COLORIZE.should_colorize();

    let template = t!("cli.help.template");

    let title = if use_colors { "\x1b[1;33m" } else { "" }; // Bold Yellow
    let cmd = if use_colors { "\x1b[36m" } else { "" }; // Cyan
    let dim = if use_colors { "\x1b[2m" } else { "" };
    let reset = if use_colors { "\x1b[0m" } else { "" };

    let formatted = template
        .replace("<title>", title)
        .replace("</title>", reset)
        .replace("<cmd>", cmd)
        .replace("</cmd>", reset)
        .replace("<dim>", dim)
        .replace("</dim>", reset);

    // clap wants a 'static template; this runs once per process.
    Box::leak(formatted.into_boxed_str())
}

/// agentsh: process execution and persistent shell sessions for a coding agent.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    help_template = { build_help_string() },
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
#[command(disable_help_subcommand = true)]
#[command(trailing_var_arg = true)]
pub struct Cli {
    /// The action to perform (`run`, `shell`, `escape`, `which`).
    pub action: Option<String>,

    /// Arguments for the action, parsed by its handler.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}
