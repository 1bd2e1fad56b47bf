// src/core/service.rs

//! # Execution Service
//!
//! The composition root of the crate. `ExecService` owns one resolver, one set of shell
//! sessions and one background registry, and turns tool requests from the agent loop into
//! plain-data `ToolOutput`s. One-shot execution goes through the `CommandRunner` trait so
//! callers can substitute a fake runner.

use crate::{
    CancellationToken,
    constants::SENTINEL_EXIT_CODE,
    models::{
        CompletionState, Dialect, OutputSnapshot, ProcessResult, ProcessSpec, Settings,
        TimeoutStrategy,
    },
    system::{
        background::{BackgroundInfo, BackgroundRegistry},
        events::EventSink,
        executor::{self, ExecutionError, ProcessRunner},
        resolver::ShellResolver,
        session::{SessionError, ShellSessions},
    },
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

// --- Runner seam ---

/// Executes one-shot process specs.
pub trait CommandRunner: Send + Sync {
    fn run_command(
        &self,
        spec: ProcessSpec,
        cancel: Option<CancellationToken>,
    ) -> impl Future<Output = ProcessResult> + Send;
}

impl CommandRunner for ProcessRunner {
    fn run_command(
        &self,
        spec: ProcessSpec,
        cancel: Option<CancellationToken>,
    ) -> impl Future<Output = ProcessResult> + Send {
        async move { self.run(&spec, cancel.as_ref()).await }
    }
}

// --- Requests and responses ---

/// One tool invocation from the agent loop.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    /// Run a command once and wait for it.
    Run {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        shell: Option<Dialect>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        stdin: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        strategy: Option<TimeoutStrategy>,
    },
    /// Run a command line inside the persistent session of a dialect.
    Session {
        #[serde(default)]
        dialect: Option<Dialect>,
        command: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Start a command in the background and return its handle.
    Launch {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        shell: Option<Dialect>,
        #[serde(default)]
        name: Option<String>,
    },
    /// Read a background process's output.
    Poll {
        handle: String,
        #[serde(default)]
        clear: bool,
    },
    /// Stop a background process.
    Kill {
        handle: String,
        #[serde(default)]
        force: bool,
    },
    /// List every background process.
    List,
}

/// Outcome category of a tool call.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ToolStatus {
    /// Finished with exit code zero.
    Success,
    /// Finished with a non-zero exit code.
    Failed,
    TimedOut,
    Canceled,
    /// Could not be started or failed unexpectedly.
    Error,
    /// A background process is still running (or was just launched).
    Running,
    /// A background process has exited.
    Exited,
    Killed,
    /// No background process has the requested handle.
    NotFound,
    Listed,
}

/// The plain-data answer handed back to the agent loop.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub status: ToolStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub merged: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobSummary>,
}

/// One line of a `List` answer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub handle: String,
    pub name: String,
    pub pid: Option<u32>,
    pub running: bool,
    pub age_secs: u64,
}

impl From<BackgroundInfo> for JobSummary {
    fn from(info: BackgroundInfo) -> Self {
        Self {
            handle: info.handle,
            name: info.name,
            pid: info.pid,
            running: info.running,
            age_secs: info.age.as_secs(),
        }
    }
}

impl ToolOutput {
    fn status_only(status: ToolStatus) -> Self {
        Self {
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            merged: String::new(),
            handle: None,
            jobs: Vec::new(),
        }
    }

    fn with_message(status: ToolStatus, message: String) -> Self {
        Self {
            stderr: message.clone(),
            merged: message,
            ..Self::status_only(status)
        }
    }

    /// Output captured before a session command failed, with an optional error line
    /// appended to stderr.
    fn from_partial(
        status: ToolStatus,
        exit_code: i32,
        partial: OutputSnapshot,
        message: Option<String>,
    ) -> Self {
        let mut stderr = partial.stderr;
        let mut merged = partial.merged;
        if let Some(message) = message {
            append_line(&mut stderr, &message);
            append_line(&mut merged, &message);
        }
        Self {
            status,
            exit_code: Some(exit_code),
            stdout: partial.stdout,
            stderr,
            merged,
            handle: None,
            jobs: Vec::new(),
        }
    }

    /// Converts a one-shot result. Error details are appended to stderr.
    pub fn from_process(result: ProcessResult) -> Self {
        let status = match result.state {
            CompletionState::Completed if result.exit_code == 0 => ToolStatus::Success,
            CompletionState::Completed => ToolStatus::Failed,
            CompletionState::TimedOut => ToolStatus::TimedOut,
            CompletionState::Canceled => ToolStatus::Canceled,
            CompletionState::Error => ToolStatus::Error,
        };
        let mut stderr = result.stderr;
        let mut merged = result.merged;
        let message = result.error_message.filter(|_| status != ToolStatus::Failed);
        if let Some(message) = message {
            append_line(&mut stderr, &message);
            append_line(&mut merged, &message);
        }
        Self {
            status,
            exit_code: Some(result.exit_code),
            stdout: result.stdout,
            stderr,
            merged,
            handle: None,
            jobs: Vec::new(),
        }
    }

    /// Plain-text rendering for the next model turn.
    pub fn render(&self) -> String {
        let mut text = String::new();
        let status = match self.status {
            ToolStatus::Success | ToolStatus::Failed => None,
            ToolStatus::TimedOut => Some("timed out"),
            ToolStatus::Canceled => Some("canceled"),
            ToolStatus::Error => Some("error"),
            ToolStatus::Running => Some("running"),
            ToolStatus::Exited => Some("exited"),
            ToolStatus::Killed => Some("killed"),
            ToolStatus::NotFound => Some("not found"),
            ToolStatus::Listed => None,
        };
        if let Some(status) = status {
            let _ = writeln!(text, "Status: {}", status);
        }
        if let Some(code) = self.exit_code {
            let _ = writeln!(text, "Exit code: {}", code);
        }
        if let Some(handle) = &self.handle {
            let _ = writeln!(text, "Handle: {}", handle);
        }
        if self.status == ToolStatus::Listed {
            if self.jobs.is_empty() {
                text.push_str("No background processes.\n");
            }
            for job in &self.jobs {
                let _ = writeln!(
                    text,
                    "{}  {}  pid={}  {}  {}s",
                    job.handle,
                    if job.running { "running" } else { "exited" },
                    job.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    job.name,
                    job.age_secs
                );
            }
            return text;
        }
        if self.merged.is_empty() {
            text.push_str("(no output)\n");
        } else {
            text.push_str(&self.merged);
            if !self.merged.ends_with('\n') {
                text.push('\n');
            }
        }
        text
    }
}

fn append_line(buffer: &mut String, line: &str) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(line);
    buffer.push('\n');
}

/// Failures that keep a request from producing any output.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

// --- Service ---

/// Composition root for process execution.
#[derive(Debug)]
pub struct ExecService<R: CommandRunner = ProcessRunner> {
    runner: R,
    resolver: Arc<ShellResolver>,
    sessions: ShellSessions,
    background: Arc<BackgroundRegistry>,
    settings: Settings,
}

impl ExecService<ProcessRunner> {
    /// Builds the service from settings with the real process runner.
    pub fn from_settings(settings: Settings, events: EventSink) -> Self {
        let resolver = Arc::new(ShellResolver::from_settings(&settings));
        let runner = ProcessRunner::new(resolver.clone());
        Self::with_runner(runner, resolver, settings, events)
    }
}

impl<R: CommandRunner> ExecService<R> {
    /// Builds the service around a custom one-shot runner. Sessions and background jobs
    /// still use real processes.
    pub fn with_runner(
        runner: R,
        resolver: Arc<ShellResolver>,
        settings: Settings,
        events: EventSink,
    ) -> Self {
        let sessions = ShellSessions::new(resolver.clone(), &settings, events.clone());
        let background = Arc::new(
            BackgroundRegistry::new(ProcessRunner::new(resolver.clone()), events)
                .with_kill_grace(settings.background_kill_grace()),
        );
        Self {
            runner,
            resolver,
            sessions,
            background,
            settings,
        }
    }

    /// Settings the service was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The per-dialect persistent shells.
    pub fn sessions(&self) -> &ShellSessions {
        &self.sessions
    }

    /// The background job registry.
    pub fn background(&self) -> &Arc<BackgroundRegistry> {
        &self.background
    }

    /// Starts the periodic eviction of old background processes.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        self.background.spawn_sweeper(
            self.settings.background_sweep_interval(),
            self.settings.background_max_age(),
        )
    }

    /// Kills every session shell and every background process.
    pub async fn shutdown(&self) {
        self.background.shutdown_all().await;
        self.sessions.shutdown_all().await;
    }

    /// Executes one tool request.
    ///
    /// Expected failures (non-zero exits, timeouts, unknown handles) are encoded in the
    /// output; only failures to start a session or parse a command are errors.
    pub async fn handle(
        &self,
        request: ToolRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<ToolOutput, ServiceError> {
        match request {
            ToolRequest::Run {
                command,
                args,
                shell,
                cwd,
                stdin,
                timeout_ms,
                strategy,
            } => {
                let mut spec = match self.build_spec(&command, args, shell) {
                    Ok(spec) => spec,
                    Err(ExecutionError::Resolve(e)) => {
                        return Ok(ToolOutput::with_message(ToolStatus::Error, format!("{}\n", e)));
                    }
                    Err(e) => return Err(e.into()),
                };
                spec.cwd = cwd;
                spec.stdin = stdin;
                spec.timeout = timeout_ms
                    .map(Duration::from_millis)
                    .or_else(|| self.settings.default_timeout());
                spec.strategy = strategy.unwrap_or(self.settings.default_strategy);
                let result = self.runner.run_command(spec, cancel).await;
                Ok(ToolOutput::from_process(result))
            }
            ToolRequest::Session {
                dialect,
                command,
                timeout_ms,
            } => {
                let dialect = dialect.unwrap_or_else(|| self.settings.dialect());
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.settings.session_timeout());
                self.run_in_session(dialect, &command, timeout).await
            }
            ToolRequest::Launch {
                command,
                args,
                shell,
                name,
            } => {
                let spec = match self.build_spec(&command, args, shell) {
                    Ok(spec) => spec,
                    Err(ExecutionError::Resolve(e)) => {
                        return Ok(ToolOutput::with_message(ToolStatus::Error, format!("{}\n", e)));
                    }
                    Err(e) => return Err(e.into()),
                };
                let handle = self.background.launch(spec, name.as_deref());
                Ok(ToolOutput {
                    handle: Some(handle),
                    ..ToolOutput::status_only(ToolStatus::Running)
                })
            }
            ToolRequest::Poll { handle, clear } => {
                if !self.background.contains(&handle) {
                    let snapshot = self.background.get_output(&handle, false);
                    return Ok(ToolOutput::with_message(ToolStatus::NotFound, snapshot.stderr));
                }
                let running = self.background.is_running(&handle);
                let snapshot = self.background.get_output(&handle, clear);
                Ok(ToolOutput {
                    status: if running {
                        ToolStatus::Running
                    } else {
                        ToolStatus::Exited
                    },
                    exit_code: None,
                    stdout: snapshot.stdout,
                    stderr: snapshot.stderr,
                    merged: snapshot.merged,
                    handle: Some(handle),
                    jobs: Vec::new(),
                })
            }
            ToolRequest::Kill { handle, force } => {
                let status = if self.background.kill(&handle, force).await {
                    ToolStatus::Killed
                } else if self.background.contains(&handle) {
                    ToolStatus::Error
                } else {
                    ToolStatus::NotFound
                };
                Ok(ToolOutput {
                    handle: Some(handle),
                    ..ToolOutput::status_only(status)
                })
            }
            ToolRequest::List => Ok(ToolOutput {
                jobs: self
                    .background
                    .list_all()
                    .into_iter()
                    .map(JobSummary::from)
                    .collect(),
                ..ToolOutput::status_only(ToolStatus::Listed)
            }),
        }
    }

    async fn run_in_session(
        &self,
        dialect: Dialect,
        command: &str,
        timeout: Duration,
    ) -> Result<ToolOutput, ServiceError> {
        match self.sessions.get(dialect).run(command, timeout).await {
            Ok(output) => Ok(ToolOutput {
                status: if output.exit_code == 0 {
                    ToolStatus::Success
                } else {
                    ToolStatus::Failed
                },
                exit_code: Some(output.exit_code),
                stdout: output.stdout,
                stderr: output.stderr,
                merged: output.merged,
                handle: None,
                jobs: Vec::new(),
            }),
            Err(SessionError::Timeout { partial, .. }) => Ok(ToolOutput::from_partial(
                ToolStatus::TimedOut,
                SENTINEL_EXIT_CODE,
                partial,
                None,
            )),
            // A lost or restarted shell still hands back what the command printed.
            Err(e) => {
                let message = e.to_string();
                match e {
                    SessionError::Exited {
                        exit_code, partial, ..
                    } => Ok(ToolOutput::from_partial(
                        ToolStatus::Error,
                        exit_code.unwrap_or(SENTINEL_EXIT_CODE),
                        partial,
                        Some(message),
                    )),
                    SessionError::Restarted { partial, .. } => Ok(ToolOutput::from_partial(
                        ToolStatus::Error,
                        SENTINEL_EXIT_CODE,
                        partial,
                        Some(message),
                    )),
                    other => Err(other.into()),
                }
            }
        }
    }

    /// Turns the command fields of a request into a process spec.
    ///
    /// A command with no separate arguments is a full command line: it is split with shell
    /// word rules for direct execution, or handed verbatim to the shell when one is named.
    fn build_spec(
        &self,
        command: &str,
        args: Vec<String>,
        shell: Option<Dialect>,
    ) -> Result<ProcessSpec, ExecutionError> {
        match (shell, args.is_empty()) {
            (Some(dialect), true) => {
                let path = self.resolver.resolve(dialect)?;
                Ok(dialect.command_spec(&path, command))
            }
            (Some(dialect), false) => Ok(ProcessSpec::new(command).args(args).through_shell(dialect)),
            (None, true) => {
                let (program, args) = executor::parse_command_line(command)?;
                Ok(ProcessSpec::new(program).args(args))
            }
            (None, false) => Ok(ProcessSpec::new(command).args(args)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every spec and answers with a canned result.
    #[derive(Debug, Default)]
    struct FakeRunner {
        seen: Mutex<Vec<ProcessSpec>>,
        state: Option<CompletionState>,
    }

    impl CommandRunner for FakeRunner {
        fn run_command(
            &self,
            spec: ProcessSpec,
            _cancel: Option<CancellationToken>,
        ) -> impl Future<Output = ProcessResult> + Send {
            self.seen.lock().unwrap().push(spec);
            let state = self.state.unwrap_or(CompletionState::Completed);
            async move {
                ProcessResult {
                    stdout: "partial\n".to_string(),
                    stderr: String::new(),
                    merged: "partial\n".to_string(),
                    exit_code: if state == CompletionState::Completed { 0 } else { -1 },
                    state,
                    duration: Duration::from_millis(5),
                    error_kind: None,
                    error_message: (state != CompletionState::Completed)
                        .then(|| "Process timed out after 100 ms".to_string()),
                    fault: None,
                }
            }
        }
    }

    fn service(runner: FakeRunner, settings: Settings) -> ExecService<FakeRunner> {
        let resolver = Arc::new(ShellResolver::from_settings(&settings));
        ExecService::with_runner(runner, resolver, settings, EventSink::none())
    }

    fn run_request(command: &str) -> ToolRequest {
        ToolRequest::Run {
            command: command.to_string(),
            args: Vec::new(),
            shell: None,
            cwd: None,
            stdin: None,
            timeout_ms: None,
            strategy: None,
        }
    }

    #[tokio::test]
    async fn test_run_splits_command_line_and_applies_defaults() {
        // --- Setup ---
        let settings = Settings {
            default_timeout_ms: Some(1500),
            default_strategy: TimeoutStrategy::KillOnly,
            ..Settings::default()
        };
        let service = service(FakeRunner::default(), settings);

        // --- Execute ---
        let output = service.handle(run_request("git log -n 'two words'"), None).await.unwrap();

        // --- Assert ---
        assert_eq!(output.status, ToolStatus::Success);
        let seen = service.runner.seen.lock().unwrap();
        let spec = seen.first().unwrap();
        assert_eq!(spec.program, "git");
        assert_eq!(spec.args, vec!["log", "-n", "two words"]);
        assert_eq!(spec.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(spec.strategy, TimeoutStrategy::KillOnly);
    }

    #[tokio::test]
    async fn test_run_timeout_keeps_partial_output() {
        let runner = FakeRunner {
            state: Some(CompletionState::TimedOut),
            ..FakeRunner::default()
        };
        let service = service(runner, Settings::default());

        let output = service.handle(run_request("sleep 5"), None).await.unwrap();

        assert_eq!(output.status, ToolStatus::TimedOut);
        assert_eq!(output.exit_code, Some(-1));
        assert_eq!(output.stdout, "partial\n");
        let text = output.render();
        assert!(text.contains("Status: timed out"));
        assert!(text.contains("partial"));
        assert!(text.contains("Process timed out after 100 ms"));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let service = service(FakeRunner::default(), Settings::default());
        let err = service.handle(run_request("  "), None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Execution(ExecutionError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_unknown_handles_are_reported_not_failed() {
        let service = service(FakeRunner::default(), Settings::default());

        let polled = service
            .handle(
                ToolRequest::Poll {
                    handle: "bg-missing".to_string(),
                    clear: false,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(polled.status, ToolStatus::NotFound);
        assert!(polled.stderr.contains("bg-missing"));

        let killed = service
            .handle(
                ToolRequest::Kill {
                    handle: "bg-missing".to_string(),
                    force: true,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(killed.status, ToolStatus::NotFound);

        let listed = service.handle(ToolRequest::List, None).await.unwrap();
        assert_eq!(listed.status, ToolStatus::Listed);
        assert!(listed.render().contains("No background processes."));
    }

    #[test]
    fn test_requests_deserialize_from_tool_json() {
        let request: ToolRequest =
            serde_json::from_str(r#"{"tool":"session","dialect":"pwsh","command":"Get-Date"}"#)
                .unwrap();
        assert_eq!(
            request,
            ToolRequest::Session {
                dialect: Some(Dialect::PowerShell),
                command: "Get-Date".to_string(),
                timeout_ms: None,
            }
        );
        let request: ToolRequest = serde_json::from_str(r#"{"tool":"list"}"#).unwrap();
        assert_eq!(request, ToolRequest::List);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_and_background_round_trip() {
        let service = ExecService::from_settings(Settings::default(), EventSink::none());

        let output = service
            .handle(
                ToolRequest::Session {
                    dialect: Some(Dialect::Bash),
                    command: "echo hi".to_string(),
                    timeout_ms: Some(10_000),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.status, ToolStatus::Success);
        assert_eq!(output.stdout, "hi\n");

        let launched = service
            .handle(
                ToolRequest::Launch {
                    command: "sleep 30".to_string(),
                    args: Vec::new(),
                    shell: None,
                    name: Some("sleeper".to_string()),
                },
                None,
            )
            .await
            .unwrap();
        let handle = launched.handle.clone().unwrap();
        assert_eq!(launched.status, ToolStatus::Running);

        let listed = service.handle(ToolRequest::List, None).await.unwrap();
        assert_eq!(listed.jobs.len(), 1);
        assert_eq!(listed.jobs.first().map(|j| j.name.as_str()), Some("sleeper"));

        let killed = service
            .handle(ToolRequest::Kill { handle, force: true }, None)
            .await
            .unwrap();
        assert_eq!(killed.status, ToolStatus::Killed);

        service.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_session_reports_partial_output() {
        let service = ExecService::from_settings(Settings::default(), EventSink::none());

        let output = service
            .handle(
                ToolRequest::Session {
                    dialect: Some(Dialect::Bash),
                    command: "echo bye; exit 3".to_string(),
                    timeout_ms: Some(10_000),
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(output.status, ToolStatus::Error);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "bye\n");
        assert!(output.stderr.contains("exited while running the command"));
        assert!(output.render().contains("bye"));
        service.shutdown().await;
    }
}
