// src/system/session.rs

//! Long-lived shell processes driven through an output-marker protocol.
//!
//! Every command is wrapped so the shell prints `<marker><exit code>` on its own stdout line
//! once the command finishes. The session waits for that line, recovers the exit code and
//! strips the protocol lines before handing the output back. One async mutex per session
//! serializes commands, so output of two calls can never interleave.

use crate::{
    constants::{DEFAULT_WARMUP_TIMEOUT, REAP_TIMEOUT, SESSION_POLL_INTERVAL},
    models::{Dialect, OutputSnapshot, Settings},
    system::{
        dialect::{generate_marker, marker_regex},
        events::{EventSink, ExecEvent},
        executor::ProcessRunner,
        output::{self, CaptureHandles, OutputSubscriber, ReaderOptions, SharedBuffers},
        resolver::{ResolveError, ShellResolver},
        signals::{self, KillScope},
    },
};
use regex::Regex;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;

/// Failure of one session command. Only the in-flight command is affected; a dead shell is
/// respawned by the next call.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The dialect's shell binary could not be found.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The shell binary was found but the process could not be started.
    #[error("Failed to start the {dialect} session: {source}")]
    Spawn {
        dialect: Dialect,
        #[source]
        source: io::Error,
    },
    /// A freshly started shell never printed the marker of its warm-up no-op.
    #[error("The {0} session did not answer its warm-up command.")]
    Warmup(Dialect),
    /// The marker did not arrive in time. The shell keeps running the command.
    #[error("Command timed out after {} ms.", .timeout.as_millis())]
    Timeout {
        timeout: Duration,
        partial: OutputSnapshot,
    },
    /// The shell process died before printing the marker.
    #[error("The {dialect} session exited while running the command (exit code: {exit_code:?}).")]
    Exited {
        dialect: Dialect,
        exit_code: Option<i32>,
        partial: OutputSnapshot,
    },
    /// A command abandoned by an earlier timeout was still running when this call's deadline
    /// passed. The shell was killed and the new command was not run; the next call starts
    /// a fresh shell.
    #[error(
        "The {dialect} session was still busy with an earlier timed-out command and was \
         restarted; the command was not run."
    )]
    Restarted {
        dialect: Dialect,
        partial: OutputSnapshot,
    },
    /// Writing to the shell's stdin failed; the shell was discarded.
    #[error("I/O error while talking to the {dialect} session: {source}")]
    Io {
        dialect: Dialect,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Output captured before the command failed, if the failure happened mid-command.
    pub fn partial_output(&self) -> Option<&OutputSnapshot> {
        match self {
            Self::Timeout { partial, .. }
            | Self::Exited { partial, .. }
            | Self::Restarted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// Output of one completed session command, protocol lines removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutput {
    pub stdout: String,
    pub stderr: String,
    pub merged: String,
    pub exit_code: i32,
    pub duration: Duration,
}

/// Start-up parameters of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Appended to the dialect's own session arguments.
    pub extra_args: Vec<String>,
    /// Bound for the warm-up round-trip after every (re)spawn.
    pub warmup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            extra_args: Vec::new(),
            warmup_timeout: DEFAULT_WARMUP_TIMEOUT,
        }
    }
}

/// A running shell process and its pipes.
#[derive(Debug)]
struct LiveShell {
    child: Child,
    stdin: ChildStdin,
    capture: CaptureHandles,
}

#[derive(Debug, Default)]
struct SessionState {
    shell: Option<LiveShell>,
    /// Commands that timed out but whose markers have not been seen yet.
    abandoned: usize,
}

enum MarkerWait {
    /// The requested number of markers arrived; holds the last marker line.
    Found(String),
    Exited(Option<i32>),
    TimedOut,
}

/// One persistent shell of a single dialect.
#[derive(Debug)]
pub struct ShellSession {
    dialect: Dialect,
    resolver: Arc<ShellResolver>,
    config: SessionConfig,
    marker: String,
    marker_re: Regex,
    buffers: SharedBuffers,
    subscriber: Option<OutputSubscriber>,
    events: EventSink,
    state: Mutex<SessionState>,
}

impl ShellSession {
    /// Creates the session object. No process is started until the first `run`.
    pub fn new(dialect: Dialect, resolver: Arc<ShellResolver>, config: SessionConfig) -> Self {
        let marker = generate_marker();
        let marker_re = marker_regex(&marker);
        Self {
            dialect,
            resolver,
            config,
            marker,
            marker_re,
            buffers: SharedBuffers::new(),
            subscriber: None,
            events: EventSink::none(),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Forwards every non-protocol output line to `subscriber` as it arrives.
    pub fn with_subscriber(mut self, subscriber: OutputSubscriber) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Reports spawns and losses of the shell process to `events`.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// The dialect this session speaks.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The marker token of this session. Fixed for the session's lifetime.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// True while a shell process exists and has not exited.
    pub async fn is_alive(&self) -> bool {
        let mut state = self.state.lock().await;
        state
            .shell
            .as_mut()
            .is_some_and(|shell| signals::is_alive(&mut shell.child))
    }

    /// Runs `command` in the shell and waits until its marker line arrives.
    ///
    /// On timeout the shell is left running and the partial output is returned inside the
    /// error; the next call first waits for the abandoned command's marker and discards its
    /// output. If that marker does not arrive within the next call's own timeout, the shell
    /// is killed and [`SessionError::Restarted`] carries the abandoned command's output.
    pub async fn run(&self, command: &str, timeout: Duration) -> Result<SessionOutput, SessionError> {
        let mut state = self.state.lock().await;
        let started = Instant::now();
        let deadline = started + timeout;

        // 1. Make sure a live, warmed-up shell exists.
        self.ensure_alive(&mut state).await?;

        // 2. Consume markers of commands abandoned by earlier timeouts.
        if state.abandoned > 0 {
            self.consume_abandoned(&mut state, deadline).await?;
        }
        self.buffers.clear();

        // 3. Send the wrapped command.
        let wrapped = self.dialect.wrap_command(&self.marker, command);
        if let Err(e) = self.send(&mut state, &wrapped).await {
            self.discard_shell(&mut state).await;
            return Err(SessionError::Io {
                dialect: self.dialect,
                source: e,
            });
        }

        // 4. Wait for the marker, the shell's death, or the deadline.
        let outcome = match state.shell.as_mut() {
            Some(shell) => self.wait_for_markers(shell, 1, deadline).await,
            None => MarkerWait::Exited(None),
        };

        match outcome {
            MarkerWait::Found(line) => {
                // 5. Recover the exit code and remove protocol lines.
                let exit_code = self.dialect.parse_exit_code(&self.marker, &line);
                let output = self.stripped(self.buffers.read(true));
                log::debug!(
                    "{} session command finished with {} in {:?}",
                    self.dialect,
                    exit_code,
                    started.elapsed()
                );
                Ok(SessionOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    merged: output.merged,
                    exit_code,
                    duration: started.elapsed(),
                })
            }
            MarkerWait::TimedOut => {
                state.abandoned += 1;
                log::debug!(
                    "{} session command timed out after {:?}; {} command(s) pending.",
                    self.dialect,
                    timeout,
                    state.abandoned
                );
                Err(SessionError::Timeout {
                    timeout,
                    partial: self.stripped(self.buffers.snapshot()),
                })
            }
            MarkerWait::Exited(exit_code) => {
                let partial = self.stripped(self.buffers.read(true));
                self.discard_shell(&mut state).await;
                Err(SessionError::Exited {
                    dialect: self.dialect,
                    exit_code,
                    partial,
                })
            }
        }
    }

    /// Kills the shell process, if any. The next `run` starts a fresh one.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut shell) = state.shell.take() {
            log::debug!("Shutting down {} session (PID: {:?})", self.dialect, shell.child.id());
            if let Err(e) = signals::force_kill(&mut shell.child, KillScope::Group) {
                log::warn!("Failed to kill {} session: {}", self.dialect, e);
            }
            let _ = signals::wait_for_exit(&mut shell.child, REAP_TIMEOUT).await;
            shell.capture.abort();
        }
        state.abandoned = 0;
        self.buffers.clear();
    }

    // --- Internals ---

    async fn ensure_alive(&self, state: &mut SessionState) -> Result<(), SessionError> {
        if let Some(shell) = state.shell.as_mut() {
            if signals::is_alive(&mut shell.child) {
                return Ok(());
            }
            log::debug!("{} session died since the last command, respawning.", self.dialect);
            self.discard_shell(state).await;
        }

        // 1. Resolve the binary before touching any process.
        let path = self.resolver.resolve(self.dialect)?;
        let spec = self.dialect.session_spec(&path, &self.config.extra_args);
        let mut command = ProcessRunner::new(self.resolver.clone())
            .prepare(&spec)
            .map_err(|e| SessionError::Spawn {
                dialect: self.dialect,
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            })?;
        command.stdin(Stdio::piped());

        // 2. Spawn and attach readers. Marker lines never reach the live subscriber.
        let mut child = command.spawn().map_err(|source| SessionError::Spawn {
            dialect: self.dialect,
            source,
        })?;
        let stdin = child.stdin.take().ok_or_else(|| SessionError::Spawn {
            dialect: self.dialect,
            source: io::Error::new(io::ErrorKind::BrokenPipe, "shell stdin is not piped"),
        })?;
        self.buffers.clear();
        let options = ReaderOptions {
            subscriber: self.subscriber.clone(),
            hidden: Some(self.marker_re.clone()),
            ..ReaderOptions::default()
        };
        let capture = output::capture_child(&mut child, &self.buffers, &options);
        let pid = child.id();
        state.shell = Some(LiveShell {
            child,
            stdin,
            capture,
        });
        state.abandoned = 0;
        log::debug!("Spawned {} session (PID: {:?})", self.dialect, pid);
        self.events.emit(ExecEvent::SessionSpawned {
            dialect: self.dialect,
            pid,
        });

        // 3. Warm-up round-trip: a wrapped no-op must come back before real work is accepted.
        let warmup = self.dialect.wrap_command(&self.marker, self.dialect.ops().no_op);
        let deadline = Instant::now() + self.config.warmup_timeout;
        let answered = match self.send(state, &warmup).await {
            Ok(()) => match state.shell.as_mut() {
                Some(shell) => matches!(
                    self.wait_for_markers(shell, 1, deadline).await,
                    MarkerWait::Found(_)
                ),
                None => false,
            },
            Err(e) => {
                log::debug!("Writing the warm-up command failed: {}", e);
                false
            }
        };
        if !answered {
            self.discard_shell(state).await;
            return Err(SessionError::Warmup(self.dialect));
        }
        self.buffers.clear();
        Ok(())
    }

    /// Waits for the markers of commands abandoned by earlier timeouts and drops their
    /// output. A shell still stuck at `deadline` is discarded, with whatever the abandoned
    /// commands printed returned as partial output.
    async fn consume_abandoned(
        &self,
        state: &mut SessionState,
        deadline: Instant,
    ) -> Result<(), SessionError> {
        let pending = state.abandoned;
        let outcome = match state.shell.as_mut() {
            Some(shell) => self.wait_for_markers(shell, pending, deadline).await,
            None => MarkerWait::Exited(None),
        };
        match outcome {
            MarkerWait::Found(_) => {
                log::debug!("Discarded output of {} abandoned command(s).", pending);
                state.abandoned = 0;
                Ok(())
            }
            MarkerWait::TimedOut => {
                log::warn!(
                    "{} session is still busy with {} abandoned command(s), restarting it.",
                    self.dialect,
                    pending
                );
                let partial = self.stripped(self.buffers.read(true));
                self.discard_shell(state).await;
                Err(SessionError::Restarted {
                    dialect: self.dialect,
                    partial,
                })
            }
            MarkerWait::Exited(exit_code) => {
                let partial = self.stripped(self.buffers.read(true));
                self.discard_shell(state).await;
                Err(SessionError::Exited {
                    dialect: self.dialect,
                    exit_code,
                    partial,
                })
            }
        }
    }

    async fn send(&self, state: &mut SessionState, text: &str) -> io::Result<()> {
        let shell = state
            .shell
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "session is not running"))?;
        shell.stdin.write_all(text.as_bytes()).await?;
        shell.stdin.flush().await
    }

    /// Polls the stdout buffer until it holds `count` marker lines.
    async fn wait_for_markers(&self, shell: &mut LiveShell, count: usize, deadline: Instant) -> MarkerWait {
        loop {
            if let Some(line) = self.nth_marker_line(count) {
                return MarkerWait::Found(line);
            }
            if let Ok(Some(status)) = shell.child.try_wait() {
                // Give the readers a moment to flush what the shell wrote before dying.
                tokio::time::sleep(SESSION_POLL_INTERVAL).await;
                if let Some(line) = self.nth_marker_line(count) {
                    return MarkerWait::Found(line);
                }
                return MarkerWait::Exited(Some(signals::exit_code_of(status)));
            }
            if Instant::now() >= deadline {
                return MarkerWait::TimedOut;
            }
            tokio::time::sleep(SESSION_POLL_INTERVAL).await;
        }
    }

    fn nth_marker_line(&self, count: usize) -> Option<String> {
        let buffers = self.buffers.lock();
        buffers
            .stdout
            .lines()
            .filter(|line| self.marker_re.is_match(line))
            .nth(count.saturating_sub(1))
            .map(str::to_string)
    }

    fn stripped(&self, snapshot: OutputSnapshot) -> OutputSnapshot {
        OutputSnapshot {
            stdout: output::strip_marker_lines(&snapshot.stdout, &self.marker_re, true),
            stderr: output::strip_marker_lines(&snapshot.stderr, &self.marker_re, false),
            merged: output::strip_marker_lines(&snapshot.merged, &self.marker_re, true),
        }
    }

    /// Drops the current shell, killing it if it is still around.
    async fn discard_shell(&self, state: &mut SessionState) {
        if let Some(mut shell) = state.shell.take() {
            let _ = signals::force_kill(&mut shell.child, KillScope::Group);
            let _ = signals::wait_for_exit(&mut shell.child, REAP_TIMEOUT).await;
            shell.capture.abort();
            self.events.emit(ExecEvent::SessionLost {
                dialect: self.dialect,
            });
        }
        state.abandoned = 0;
    }
}

/// One lazily started session per dialect.
#[derive(Debug)]
pub struct ShellSessions {
    bash: Arc<ShellSession>,
    cmd: Arc<ShellSession>,
    powershell: Arc<ShellSession>,
}

impl ShellSessions {
    /// Builds the three session objects from settings. No shell is started yet.
    pub fn new(resolver: Arc<ShellResolver>, settings: &Settings, events: EventSink) -> Self {
        Self::build(resolver, settings, events, None)
    }

    /// Like [`ShellSessions::new`], streaming every session's output to `subscriber`.
    pub fn with_subscriber(
        resolver: Arc<ShellResolver>,
        settings: &Settings,
        events: EventSink,
        subscriber: OutputSubscriber,
    ) -> Self {
        Self::build(resolver, settings, events, Some(subscriber))
    }

    fn build(
        resolver: Arc<ShellResolver>,
        settings: &Settings,
        events: EventSink,
        subscriber: Option<OutputSubscriber>,
    ) -> Self {
        let make = |dialect: Dialect| {
            let config = SessionConfig {
                extra_args: settings
                    .shell(dialect)
                    .map(|s| s.extra_args.clone())
                    .unwrap_or_default(),
                warmup_timeout: settings.warmup_timeout(),
            };
            let mut session =
                ShellSession::new(dialect, resolver.clone(), config).with_events(events.clone());
            if let Some(subscriber) = &subscriber {
                session = session.with_subscriber(subscriber.clone());
            }
            Arc::new(session)
        };
        Self {
            bash: make(Dialect::Bash),
            cmd: make(Dialect::Cmd),
            powershell: make(Dialect::PowerShell),
        }
    }

    /// The session of `dialect`. Its shell starts on the first `run`.
    pub fn get(&self, dialect: Dialect) -> &Arc<ShellSession> {
        match dialect {
            Dialect::Bash => &self.bash,
            Dialect::Cmd => &self.cmd,
            Dialect::PowerShell => &self.powershell,
        }
    }

    /// Kills every session's shell.
    pub async fn shutdown_all(&self) {
        for dialect in Dialect::ALL {
            self.get(dialect).shutdown().await;
        }
    }
}
