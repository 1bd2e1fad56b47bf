// src/cli/handlers/run.rs

//! `agentsh run`: one-shot execution with live output.

use crate::{
    CancellationToken,
    cli::{CliError, args::RunArgs, handlers::commons},
    core::{service::ToolOutput, settings},
    models::{CompletionState, ProcessResult, ProcessSpec},
    system::{
        executor::ProcessRunner,
        output::{OutputLine, OutputStream},
        resolver::ShellResolver,
    },
};
use anyhow::{Result, anyhow};
use clap::Parser;
use colored::*;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Main entry point for the `run` command.
pub fn handle(args: Vec<String>, cancel: &CancellationToken) -> Result<()> {
    let run_args = RunArgs::try_parse_from(&args)?;
    let settings = settings::load_or_default();

    // 1. Build the spec. The first word is the program.
    let mut words = run_args.command.into_iter();
    let program = words
        .next()
        .ok_or_else(|| anyhow!(t!("run.error.no_command")))?;
    let mut spec = ProcessSpec::new(program)
        .args(words)
        .strategy(run_args.strategy.unwrap_or(settings.default_strategy));
    spec.timeout = run_args
        .timeout_ms
        .map(Duration::from_millis)
        .or_else(|| settings.default_timeout());
    spec.shell = run_args.shell;
    spec.cwd = run_args.cwd;

    // 2. Execute, streaming lines live unless JSON was requested.
    let resolver = Arc::new(ShellResolver::from_settings(&settings));
    let runtime = commons::build_runtime()?;
    let result = runtime.block_on(async {
        let watcher = commons::watch_interrupt(cancel);
        let result = if run_args.json {
            ProcessRunner::new(resolver).run(&spec, Some(cancel)).await
        } else {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let printer = tokio::spawn(print_lines(rx));
            let runner = ProcessRunner::new(resolver).with_subscriber(tx);
            let result = runner.run(&spec, Some(cancel)).await;
            drop(runner);
            let _ = tokio::time::timeout(Duration::from_millis(500), printer).await;
            result
        };
        watcher.abort();
        result
    });

    // 3. Report.
    if run_args.json {
        let code = result.exit_code;
        let state = result.state;
        println!("{}", serde_json::to_string_pretty(&ToolOutput::from_process(result))?);
        return exit_status(state, code);
    }
    report(result)
}

async fn print_lines(mut rx: UnboundedReceiver<OutputLine>) {
    while let Some(line) = rx.recv().await {
        match line.stream {
            OutputStream::Stdout => println!("{}", line.text),
            OutputStream::Stderr => eprintln!("{}", line.text),
        }
    }
    let _ = std::io::stdout().flush();
}

fn report(result: ProcessResult) -> Result<()> {
    match result.state {
        CompletionState::Completed => {
            log::debug!("Command finished in {:?}", result.duration);
            exit_status(result.state, result.exit_code)
        }
        CompletionState::TimedOut => {
            eprintln!(
                "\n{} {}",
                t!("run.warning.timed_out").yellow().bold(),
                result.error_message.unwrap_or_default().yellow()
            );
            exit_status(result.state, result.exit_code)
        }
        CompletionState::Canceled => Err(CliError::Interrupted.into()),
        CompletionState::Error => Err(anyhow!(
            t!("run.error.start_failed"),
            reason = result.error_message.unwrap_or_default()
        )),
    }
}

/// Maps the final state to the process exit code of `agentsh` itself.
fn exit_status(state: CompletionState, exit_code: i32) -> Result<()> {
    match state {
        CompletionState::Completed if exit_code == 0 => Ok(()),
        CompletionState::Completed => Err(CliError::Exit(exit_code).into()),
        CompletionState::Canceled => Err(CliError::Interrupted.into()),
        CompletionState::TimedOut | CompletionState::Error => Err(CliError::Exit(1).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_mapping() {
        assert!(exit_status(CompletionState::Completed, 0).is_ok());
        let err = exit_status(CompletionState::Completed, 3).unwrap_err();
        assert_eq!(err.downcast_ref::<CliError>(), Some(&CliError::Exit(3)));
        let err = exit_status(CompletionState::Canceled, -1).unwrap_err();
        assert_eq!(err.downcast_ref::<CliError>(), Some(&CliError::Interrupted));
    }
}
