// src/cli/handlers/escape.rs

//! `agentsh escape`: prints escaped arguments.

use crate::{
    CancellationToken,
    cli::{args::EscapeArgs, handlers::commons},
    core::settings,
    system::escape::{self, EscapeContext},
};
use anyhow::{Result, anyhow};
use clap::Parser;

/// Main entry point for the `escape` command. Prints the escaped arguments on one line.
pub fn handle(args: Vec<String>, _cancel: &CancellationToken) -> Result<()> {
    let escape_args = EscapeArgs::try_parse_from(&args)?;
    if escape_args.args.is_empty() {
        return Err(anyhow!(t!("escape.error.no_args")));
    }

    let settings = settings::load_or_default();
    let dialect = commons::pick_dialect(escape_args.dialect, &settings);
    let context = if escape_args.stdin {
        EscapeContext::Stdin
    } else {
        EscapeContext::Argv
    };

    let escaped: Vec<String> = escape_args
        .args
        .iter()
        .map(|arg| escape::escape(dialect, arg, context).into_owned())
        .collect();
    println!("{}", escaped.join(" "));
    Ok(())
}
