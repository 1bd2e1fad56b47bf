// src/models.rs

//! Plain data shared by every layer: dialects, process specs and results, settings.

use crate::constants::SENTINEL_EXIT_CODE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// --- SHELL DIALECTS ---

/// One of the three supported shell languages.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// GNU Bash (or any POSIX-compatible `bash` binary).
    Bash,
    /// Windows `cmd.exe`.
    Cmd,
    /// PowerShell 7 (`pwsh`) or Windows PowerShell.
    #[serde(alias = "pwsh")]
    PowerShell,
}

impl Dialect {
    /// Every dialect, in a stable order.
    pub const ALL: [Self; 3] = [Self::Bash, Self::Cmd, Self::PowerShell];

    /// The lowercase name used in config files and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Cmd => "cmd",
            Self::PowerShell => "powershell",
        }
    }

    /// The dialect a fresh install uses when nothing else is configured.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            Self::Cmd
        } else {
            Self::Bash
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bash" | "sh" => Ok(Self::Bash),
            "cmd" | "cmd.exe" => Ok(Self::Cmd),
            "powershell" | "pwsh" | "ps" => Ok(Self::PowerShell),
            other => Err(format!(
                "Unknown shell dialect '{}'. Expected one of: bash, cmd, powershell.",
                other
            )),
        }
    }
}

// --- PROCESS SPECIFICATION ---

/// How a process that outlives its timeout is brought down.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutStrategy {
    /// Force-kill the whole process group at once.
    ImmediateKill,
    /// Send only an interrupt and wait for the process to honor it.
    CtrlCOnly,
    /// Force-kill the direct child only.
    KillOnly,
    /// Interrupt, wait a short grace window, then force-kill.
    #[default]
    Progressive,
}

impl FromStr for TimeoutStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "immediate-kill" | "immediate" => Ok(Self::ImmediateKill),
            "ctrl-c-only" | "ctrlc" | "interrupt" => Ok(Self::CtrlCOnly),
            "kill-only" | "kill" => Ok(Self::KillOnly),
            "progressive" => Ok(Self::Progressive),
            other => Err(format!(
                "Unknown timeout strategy '{}'. Expected one of: immediate-kill, ctrl-c-only, kill-only, progressive.",
                other
            )),
        }
    }
}

/// Text encoding used to decode captured output.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    /// UTF-8; invalid sequences are replaced with U+FFFD.
    #[default]
    Utf8,
    /// ISO-8859-1, every byte maps to the code point of the same value.
    Latin1,
}

impl OutputEncoding {
    /// Decodes one chunk of raw output.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

/// Everything needed to start one external process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub strategy: TimeoutStrategy,
    pub encoding: OutputEncoding,
    /// When set, `program` and `args` are joined into one command line and handed to this
    /// dialect's shell instead of being executed directly.
    pub shell: Option<Dialect>,
}

impl ProcessSpec {
    /// Creates a spec that executes `program` directly.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds or replaces one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Text written to the child's stdin, which is then closed.
    pub fn stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    /// Bounds the run; without it the process may run forever.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// How the process is stopped on timeout or cancellation.
    pub fn strategy(mut self, strategy: TimeoutStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// How captured bytes are decoded into text.
    pub fn encoding(mut self, encoding: OutputEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Runs the program line through `dialect`'s shell instead of directly.
    pub fn through_shell(mut self, dialect: Dialect) -> Self {
        self.shell = Some(dialect);
        self
    }

    /// A short human-readable rendering of the command, for logs and display names.
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// --- PROCESS RESULTS ---

/// How a process run ended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionState {
    Completed,
    TimedOut,
    Canceled,
    Error,
}

/// Classification attached to anything that did not end in a clean zero exit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessErrorKind {
    /// The process could not be started at all.
    StartFailure,
    /// The process outlived its timeout.
    Timeout,
    /// The process was terminated by this crate (cancellation, explicit kill).
    Killed,
    /// The process exited on its own with a non-zero code.
    Crashed,
    /// The OS refused an operation on the process.
    AccessDenied,
    Other,
}

/// The outcome of one `ProcessRunner::run` call.
#[derive(Debug)]
pub struct ProcessResult {
    pub stdout: String,
    pub stderr: String,
    /// Both streams in arrival order. Ordering across streams is best-effort.
    pub merged: String,
    pub exit_code: i32,
    pub state: CompletionState,
    pub duration: Duration,
    pub error_kind: Option<ProcessErrorKind>,
    pub error_message: Option<String>,
    pub fault: Option<std::io::Error>,
}

impl ProcessResult {
    /// A result for a process that never started.
    pub fn start_failure(error: std::io::Error, duration: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            merged: String::new(),
            exit_code: SENTINEL_EXIT_CODE,
            state: CompletionState::Error,
            duration,
            error_kind: Some(ProcessErrorKind::StartFailure),
            error_message: Some(error.to_string()),
            fault: Some(error),
        }
    }

    /// True only for a completed run with exit code zero.
    pub fn success(&self) -> bool {
        self.state == CompletionState::Completed && self.exit_code == 0
    }
}

/// A point-in-time copy of a process's three output buffers.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSnapshot {
    pub stdout: String,
    pub stderr: String,
    pub merged: String,
}

// --- SETTINGS (FOR TOML) ---

/// Per-dialect overrides from `settings.toml`.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellConfig {
    /// Explicit path to the shell binary. `~` and environment variables are expanded.
    pub path: Option<String>,
    /// Extra arguments appended to the session start arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// The contents of `settings.toml`. Durations are in milliseconds.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Falls back to the platform default when unset.
    pub default_dialect: Option<Dialect>,
    /// Unset means one-shot commands never time out.
    pub default_timeout_ms: Option<u64>,
    pub default_strategy: TimeoutStrategy,
    pub session_timeout_ms: u64,
    pub warmup_timeout_ms: u64,
    /// Background jobs older than this are evicted by the sweeper.
    pub background_max_age_secs: u64,
    pub background_sweep_interval_secs: u64,
    /// Wait between interrupt and force kill when a background job is killed.
    pub background_kill_grace_ms: u64,
    /// Keyed by dialect name (`bash`, `cmd`, `powershell`).
    pub shells: HashMap<String, ShellConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            default_dialect: None,
            default_timeout_ms: None,
            default_strategy: TimeoutStrategy::default(),
            session_timeout_ms: duration_ms(DEFAULT_SESSION_TIMEOUT),
            warmup_timeout_ms: duration_ms(DEFAULT_WARMUP_TIMEOUT),
            background_max_age_secs: BACKGROUND_MAX_AGE.as_secs(),
            background_sweep_interval_secs: BACKGROUND_SWEEP_INTERVAL.as_secs(),
            background_kill_grace_ms: duration_ms(BACKGROUND_KILL_GRACE),
            shells: HashMap::new(),
        }
    }
}

impl Settings {
    /// The override block for a dialect, if one was configured.
    pub fn shell(&self, dialect: Dialect) -> Option<&ShellConfig> {
        self.shells.get(dialect.name()).or_else(|| match dialect {
            Dialect::PowerShell => self.shells.get("pwsh"),
            _ => None,
        })
    }

    /// The configured default dialect, else the platform's.
    pub fn dialect(&self) -> Dialect {
        self.default_dialect.unwrap_or_else(Dialect::platform_default)
    }

    /// Timeout of one-shot commands; `None` waits indefinitely.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Per-command timeout inside a shell session.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Bound for a session's warm-up round-trip.
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }

    /// Age after which a background job is evicted.
    pub fn background_max_age(&self) -> Duration {
        Duration::from_secs(self.background_max_age_secs)
    }

    /// Never shorter than one second, so a `0` in the file cannot spin the sweeper.
    pub fn background_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.background_sweep_interval_secs)
            .max(crate::constants::MIN_SWEEP_INTERVAL)
    }

    /// Grace period between interrupt and force kill for background jobs.
    pub fn background_kill_grace(&self) -> Duration {
        Duration::from_millis(self.background_kill_grace_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_str_accepts_aliases() {
        assert_eq!("pwsh".parse::<Dialect>().unwrap(), Dialect::PowerShell);
        assert_eq!(" BASH ".parse::<Dialect>().unwrap(), Dialect::Bash);
        assert_eq!("cmd.exe".parse::<Dialect>().unwrap(), Dialect::Cmd);
        assert!("fish".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_timeout_strategy_defaults_to_progressive() {
        assert_eq!(TimeoutStrategy::default(), TimeoutStrategy::Progressive);
        assert_eq!(ProcessSpec::new("ls").strategy, TimeoutStrategy::Progressive);
        assert_eq!(
            "kill_only".parse::<TimeoutStrategy>().unwrap(),
            TimeoutStrategy::KillOnly
        );
    }

    #[test]
    fn test_latin1_decoding_maps_bytes_to_code_points() {
        let decoded = OutputEncoding::Latin1.decode(&[0x63, 0x61, 0x66, 0xE9]);
        assert_eq!(decoded, "café");
        let lossy = OutputEncoding::Utf8.decode(&[0x63, 0xE9]);
        assert_eq!(lossy, "c\u{FFFD}");
    }

    #[test]
    fn test_settings_parse_partial_toml() {
        let content = r#"
            default_dialect = "pwsh"
            session_timeout_ms = 5000

            [shells.bash]
            path = "~/bin/bash"
        "#;
        let settings: Settings = toml::from_str(content).unwrap();
        assert_eq!(settings.dialect(), Dialect::PowerShell);
        assert_eq!(settings.session_timeout(), Duration::from_millis(5000));
        assert_eq!(
            settings.shell(Dialect::Bash).and_then(|s| s.path.as_deref()),
            Some("~/bin/bash")
        );
        // Untouched keys keep their defaults.
        assert_eq!(settings.default_strategy, TimeoutStrategy::Progressive);
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let settings: Settings = toml::from_str("background_sweep_interval_secs = 0").unwrap();
        assert_eq!(settings.background_sweep_interval(), Duration::from_secs(1));
    }
}
