// src/cli/handlers/which.rs

//! `agentsh which`: shows the resolved shell binaries.

use crate::{
    CancellationToken,
    cli::args::WhichArgs,
    core::settings,
    models::Dialect,
    system::resolver::ShellResolver,
};
use anyhow::{Result, anyhow};
use clap::Parser;
use colored::*;

/// Main entry point for the `which` command.
///
/// Prints the resolved executable of each requested dialect. Fails only when none of them
/// could be resolved.
pub fn handle(args: Vec<String>, _cancel: &CancellationToken) -> Result<()> {
    let which_args = WhichArgs::try_parse_from(&args)?;
    let settings = settings::load_or_default();
    let resolver = ShellResolver::from_settings(&settings);

    let dialects = if which_args.dialects.is_empty() {
        Dialect::ALL.to_vec()
    } else {
        which_args.dialects
    };

    let mut resolved = 0;
    for dialect in &dialects {
        match resolver.resolve(*dialect) {
            Ok(path) => {
                resolved += 1;
                let marker = if *dialect == settings.dialect() { "*" } else { " " };
                println!(
                    "{} {:<12} {}",
                    marker.green().bold(),
                    dialect.name().cyan(),
                    path.display()
                );
            }
            Err(e) => println!("  {:<12} {}", dialect.name().cyan(), e.to_string().red()),
        }
    }

    if resolved == 0 {
        return Err(anyhow!(t!("which.error.none_resolved")));
    }
    Ok(())
}
