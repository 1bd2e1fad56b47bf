// src/system/executor.rs

//! One-shot process execution with timeouts, cancellation and escalating termination.

use crate::{
    CancellationToken,
    constants::{
        INTERRUPT_ONLY_GRACE, POLL_INTERVAL, PROGRESSIVE_GRACE, READER_DRAIN_TIMEOUT,
        REAP_TIMEOUT, SENTINEL_EXIT_CODE,
    },
    models::{CompletionState, Dialect, ProcessErrorKind, ProcessResult, ProcessSpec, TimeoutStrategy},
    system::{
        escape,
        output::{self, OutputSubscriber, ReaderOptions, SharedBuffers},
        resolver::{ResolveError, ShellResolver},
        signals::{self, KillScope},
    },
};
use std::io::{self, ErrorKind};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Why a command line or spec could not be turned into a process.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Unbalanced quotes or a dangling escape.
    #[error("Command could not be parsed: {0}")]
    CommandParse(String),
    /// Blank command line.
    #[error("No command specified to run.")]
    EmptyCommand,
    /// The spec routes through a shell whose binary cannot be found.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Splits a command line into program and arguments using POSIX shell word rules.
pub fn parse_command_line(command_line: &str) -> Result<(String, Vec<String>), ExecutionError> {
    let trimmed = command_line.trim();
    if trimmed.is_empty() {
        return Err(ExecutionError::EmptyCommand);
    }
    let mut parts = shlex::split(trimmed)
        .ok_or_else(|| ExecutionError::CommandParse(trimmed.to_string()))?
        .into_iter();
    let program = parts.next().ok_or(ExecutionError::EmptyCommand)?;
    Ok((program, parts.collect()))
}

/// How the race between the process and its deadline ended.
enum Outcome {
    Exited(io::Result<std::process::ExitStatus>),
    TimedOut,
    Canceled,
}

/// Runs one external command to completion, timeout or cancellation.
///
/// `run` never returns an error: start failures, timeouts and cancellations are all encoded
/// in the returned [`ProcessResult`], and no child outlives the call.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    resolver: Arc<ShellResolver>,
    subscriber: Option<OutputSubscriber>,
}

impl ProcessRunner {
    /// A runner that routes shell specs through binaries found by `resolver`.
    pub fn new(resolver: Arc<ShellResolver>) -> Self {
        Self {
            resolver,
            subscriber: None,
        }
    }

    /// Streams every captured line to `subscriber` while the process runs.
    pub fn with_subscriber(mut self, subscriber: OutputSubscriber) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// The resolver shared with sessions and the background registry.
    pub fn resolver(&self) -> &Arc<ShellResolver> {
        &self.resolver
    }

    /// Turns a spec into a ready-to-spawn command with all pipes redirected.
    ///
    /// Specs routed through a shell are joined into one argv-escaped command line and handed
    /// to the resolved shell binary; everything else is executed directly.
    pub fn prepare(&self, spec: &ProcessSpec) -> Result<Command, ExecutionError> {
        if spec.program.trim().is_empty() {
            return Err(ExecutionError::EmptyCommand);
        }

        let (program, args) = match spec.shell {
            Some(dialect) => {
                let shell_path = self.resolver.resolve(dialect)?;
                let line = escape::join_command_line(dialect, &spec.program, &spec.args);
                let shell_spec = dialect.command_spec(&shell_path, &line);
                (shell_spec.program, shell_spec.args)
            }
            None => (spec.program.clone(), spec.args.clone()),
        };

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(dunce::simplified(cwd));
        }
        #[cfg(unix)]
        command.process_group(0);

        Ok(command)
    }

    /// Spawns the process described by `spec` without waiting for it.
    ///
    /// On Windows a program that cannot be found is retried through `cmd /C`, which makes
    /// shell built-ins such as `echo` or `dir` usable as direct commands.
    pub fn spawn(&self, spec: &ProcessSpec) -> io::Result<Child> {
        let mut command = self.prepare(spec).map_err(into_start_error)?;
        match command.spawn() {
            Ok(child) => Ok(child),
            Err(e)
                if e.kind() == ErrorKind::NotFound
                    && cfg!(target_os = "windows")
                    && spec.shell.is_none() =>
            {
                log::debug!(
                    "Command '{}' not found. Retrying with cmd /C.",
                    spec.program
                );
                let fallback = spec.clone().through_shell(Dialect::Cmd);
                self.prepare(&fallback).map_err(into_start_error)?.spawn()
            }
            Err(e) => Err(e),
        }
    }

    /// Executes `spec` and waits for it, honoring its timeout and the optional cancel token.
    pub async fn run(&self, spec: &ProcessSpec, cancel: Option<&CancellationToken>) -> ProcessResult {
        let started = Instant::now();

        // 1. Resolve and start the process. Failures become results, not errors.
        let mut child = match self.spawn(spec) {
            Ok(child) => child,
            Err(e) => {
                log::debug!("Failed to start '{}': {}", spec.display_line(), e);
                return ProcessResult::start_failure(e, started.elapsed());
            }
        };
        let pid = child.id();
        log::debug!("Started '{}' (PID: {:?})", spec.display_line(), pid);

        // 2. Drain both pipes concurrently so a chatty process cannot fill them and block.
        let buffers = SharedBuffers::new();
        let options = ReaderOptions {
            encoding: spec.encoding,
            subscriber: self.subscriber.clone(),
            hidden: None,
        };
        let capture = output::capture_child(&mut child, &buffers, &options);

        // 3. Feed stdin on its own task and close it, so a process that never reads cannot
        //    stall the race below.
        if let (Some(payload), Some(stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(write_stdin(stdin, payload));
        }

        // 4. Race exit against the deadline and the cancel token.
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            () = sleep_or_forever(spec.timeout) => Outcome::TimedOut,
            () = wait_for_cancel(cancel) => Outcome::Canceled,
        };

        let mut result = ProcessResult {
            stdout: String::new(),
            stderr: String::new(),
            merged: String::new(),
            exit_code: SENTINEL_EXIT_CODE,
            state: CompletionState::Completed,
            duration: Duration::ZERO,
            error_kind: None,
            error_message: None,
            fault: None,
        };

        match outcome {
            Outcome::Exited(Ok(status)) => {
                result.exit_code = signals::exit_code_of(status);
                if result.exit_code != 0 {
                    result.error_kind = Some(ProcessErrorKind::Crashed);
                }
            }
            Outcome::Exited(Err(e)) => {
                log::warn!("Failed to wait for '{}': {}", spec.display_line(), e);
                let _ = signals::force_kill(&mut child, KillScope::Group);
                result.state = CompletionState::Error;
                result.error_kind = Some(ProcessErrorKind::Other);
                result.error_message = Some(e.to_string());
                result.fault = Some(e);
            }
            Outcome::TimedOut => {
                let timeout = spec.timeout.unwrap_or_default();
                log::debug!(
                    "'{}' timed out after {:?}, escalating with {:?}.",
                    spec.display_line(),
                    timeout,
                    spec.strategy
                );
                result.state = CompletionState::TimedOut;
                result.error_kind = Some(ProcessErrorKind::Timeout);
                result.error_message = Some(format!("Process timed out after {} ms", timeout.as_millis()));
                if let Err(e) = escalate(&mut child, spec.strategy).await {
                    result.error_kind = Some(signals::classify_signal_error(&e));
                    result.fault = Some(e);
                }
            }
            Outcome::Canceled => {
                log::debug!("'{}' canceled, escalating with {:?}.", spec.display_line(), spec.strategy);
                result.state = CompletionState::Canceled;
                result.error_kind = Some(ProcessErrorKind::Killed);
                result.error_message = Some("Process was canceled".to_string());
                if let Err(e) = escalate(&mut child, spec.strategy).await {
                    result.error_kind = Some(signals::classify_signal_error(&e));
                    result.fault = Some(e);
                }
            }
        }

        // 5. Collect whatever the readers got. Readers that never see EOF mean a grandchild
        //    still holds the pipes; it belongs to the finished command, so take it down too.
        let drained = capture.drain(READER_DRAIN_TIMEOUT).await;
        if let (false, Some(pid)) = (drained, pid) {
            log::debug!("Pipes of PID {} still open after exit, killing its group.", pid);
            if let Err(e) = signals::kill_group(pid) {
                log::warn!("Failed to kill process group {}: {}", pid, e);
            }
        }

        let output = buffers.lock().take();
        result.stdout = output.stdout;
        result.stderr = output.stderr;
        result.merged = output.merged;
        result.duration = started.elapsed();
        result
    }
}

fn into_start_error(error: ExecutionError) -> io::Error {
    match error {
        ExecutionError::Resolve(e) => io::Error::new(ErrorKind::NotFound, e),
        other => io::Error::new(ErrorKind::InvalidInput, other),
    }
}

/// Brings a process down according to `strategy` and reaps it with a bounded wait.
async fn escalate(child: &mut Child, strategy: TimeoutStrategy) -> io::Result<()> {
    match strategy {
        TimeoutStrategy::ImmediateKill => signals::force_kill(child, KillScope::Group)?,
        TimeoutStrategy::KillOnly => signals::force_kill(child, KillScope::Leader)?,
        TimeoutStrategy::CtrlCOnly => {
            if let Err(e) = signals::interrupt(child) {
                log::debug!("Interrupt failed: {}", e);
            }
            if signals::wait_for_exit(child, INTERRUPT_ONLY_GRACE).await.is_some() {
                return Ok(());
            }
            // Same backstop as kill-on-drop, applied before returning.
            log::warn!("Process ignored the interrupt, killing it.");
            signals::force_kill(child, KillScope::Leader)?;
        }
        TimeoutStrategy::Progressive => {
            match signals::interrupt(child) {
                Ok(()) => {
                    if signals::wait_for_exit(child, PROGRESSIVE_GRACE).await.is_some() {
                        return Ok(());
                    }
                    log::debug!("Process survived the interrupt grace window, killing.");
                }
                Err(e) => log::debug!("Interrupt failed ({}), killing.", e),
            }
            signals::force_kill(child, KillScope::Group)?;
        }
    }

    if signals::wait_for_exit(child, REAP_TIMEOUT).await.is_none() {
        log::warn!("Process did not exit within {:?} of being killed.", REAP_TIMEOUT);
    }
    Ok(())
}

pub(crate) async fn write_stdin(mut stdin: tokio::process::ChildStdin, payload: String) {
    match stdin.write_all(payload.as_bytes()).await {
        Ok(()) => {}
        // The process may legitimately exit without reading its input.
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            log::debug!("Process closed stdin before the payload was written.");
        }
        Err(e) => log::warn!("Failed to write stdin payload: {}", e),
    }
    let _ = stdin.shutdown().await;
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_cancel(token: Option<&CancellationToken>) {
    let Some(token) = token else {
        return std::future::pending().await;
    };
    while !token.load(Ordering::SeqCst) {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Arc::new(ShellResolver::default()))
    }

    #[test]
    fn test_parse_command_line() {
        let (program, args) = parse_command_line("grep -n 'two words' file.txt").unwrap();
        assert_eq!(program, "grep");
        assert_eq!(args, vec!["-n", "two words", "file.txt"]);
        assert!(matches!(parse_command_line("   "), Err(ExecutionError::EmptyCommand)));
        assert!(matches!(
            parse_command_line("echo 'unterminated"),
            Err(ExecutionError::CommandParse(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_executable_is_start_failure() {
        let result = runner()
            .run(&ProcessSpec::new("definitely-not-a-real-binary-4242"), None)
            .await;
        assert_eq!(result.state, CompletionState::Error);
        assert_eq!(result.error_kind, Some(ProcessErrorKind::StartFailure));
        assert_eq!(result.exit_code, SENTINEL_EXIT_CODE);
        assert!(result.fault.is_some());
    }

    #[tokio::test]
    async fn test_unresolvable_shell_is_start_failure() {
        let runner = ProcessRunner::new(Arc::new(
            ShellResolver::default().with_override(Dialect::PowerShell, "/nonexistent/pwsh"),
        ));
        let result = runner
            .run(&ProcessSpec::new("Get-Date").through_shell(Dialect::PowerShell), None)
            .await;
        assert_eq!(result.error_kind, Some(ProcessErrorKind::StartFailure));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_completed_with_real_exit_code() {
        let spec = ProcessSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let result = runner().run(&spec, None).await;
        assert_eq!(result.state, CompletionState::Completed);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.error_kind, Some(ProcessErrorKind::Crashed));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(result.merged.contains("out\n") && result.merged.contains("err\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_payload_is_written_and_closed() {
        let spec = ProcessSpec::new("cat").stdin("line one\nline two\n");
        let result = runner().run(&spec, None).await;
        assert!(result.success());
        assert_eq!(result.stdout, "line one\nline two\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_output_does_not_deadlock() {
        let spec = ProcessSpec::new("sh")
            .args(["-c", "i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done"])
            .timeout(Duration::from_secs(30));
        let result = runner().run(&spec, None).await;
        assert!(result.success());
        assert_eq!(result.stdout.lines().count(), 20000);
        assert_eq!(result.stdout.lines().last(), Some("line-19999"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_progressive_timeout_terminates_process() {
        let spec = ProcessSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(500))
            .strategy(TimeoutStrategy::Progressive);
        let started = Instant::now();
        let result = runner().run(&spec, None).await;
        assert_eq!(result.state, CompletionState::TimedOut);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.error_kind, Some(ProcessErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    /// False once the process is gone or only a zombie is left.
    #[cfg(target_os = "linux")]
    fn pid_is_running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => {
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next());
                state != Some('Z')
            }
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_every_strategy_leaves_no_process_behind() {
        for strategy in [
            TimeoutStrategy::ImmediateKill,
            TimeoutStrategy::KillOnly,
            TimeoutStrategy::CtrlCOnly,
            TimeoutStrategy::Progressive,
        ] {
            // --- Setup ---
            let spec = ProcessSpec::new("sh")
                .args(["-c", "echo $$; exec sleep 5"])
                .timeout(Duration::from_millis(300))
                .strategy(strategy);

            // --- Execute ---
            let result = runner().run(&spec, None).await;

            // --- Assert ---
            assert_eq!(result.state, CompletionState::TimedOut, "{:?}", strategy);
            let pid = result.stdout.trim().to_string();
            assert!(!pid.is_empty(), "{:?}: no pid in {:?}", strategy, result);
            assert!(!pid_is_running(&pid), "{:?}: PID {} still running", strategy, pid);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let spec = ProcessSpec::new("sh")
            .args(["-c", "echo partial; sleep 30"])
            .timeout(Duration::from_millis(300))
            .strategy(TimeoutStrategy::ImmediateKill);
        let result = runner().run(&spec, None).await;
        assert_eq!(result.state, CompletionState::TimedOut);
        assert_eq!(result.stdout, "partial\n");
        assert!(result.duration < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_grandchild_holding_pipes_does_not_hang_run() {
        let spec = ProcessSpec::new("sh")
            .args(["-c", "sleep 30 & echo done"])
            .timeout(Duration::from_secs(10));
        let started = Instant::now();
        let result = runner().run(&spec, None).await;
        assert!(result.success());
        assert_eq!(result.stdout, "done\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_token_stops_process() {
        let token: CancellationToken = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.store(true, Ordering::SeqCst);
        });
        let spec = ProcessSpec::new("sleep").arg("10").strategy(TimeoutStrategy::KillOnly);
        let result = runner().run(&spec, Some(&token)).await;
        assert_eq!(result.state, CompletionState::Canceled);
        assert_eq!(result.error_kind, Some(ProcessErrorKind::Killed));
        assert_eq!(result.exit_code, SENTINEL_EXIT_CODE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_routing_escapes_arguments() {
        let spec = ProcessSpec::new("printf")
            .args(["%s|%s", "a b", "it's"])
            .through_shell(Dialect::Bash);
        let result = runner().run(&spec, None).await;
        assert!(result.success(), "{:?}", result);
        assert_eq!(result.stdout, "a b|it's");
    }
}
