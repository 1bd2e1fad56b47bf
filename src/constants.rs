// src/constants.rs

//! Names, limits and default durations shared across the crate.

use std::time::Duration;

/// The name of the agentsh configuration directory (inside the system config dir).
pub const CONFIG_DIR_NAME: &str = "agentsh";

/// The name of the settings file (inside the config directory).
pub const SETTINGS_FILENAME: &str = "settings.toml";

/// Exit code reported for timed out, canceled and never-started processes.
pub const SENTINEL_EXIT_CODE: i32 = -1;

/// Prefix of every background process handle.
pub const BACKGROUND_HANDLE_PREFIX: &str = "bg-";

/// Prefix of the per-session marker token.
pub const MARKER_PREFIX: &str = "__AGENTSH_";

/// Suffix of the per-session marker token.
pub const MARKER_SUFFIX: &str = "__";

/// Grace window between interrupt and force-kill for the progressive strategy.
pub const PROGRESSIVE_GRACE: Duration = Duration::from_millis(1000);

/// How long an interrupt-only timeout waits for the process to honor the interrupt.
pub const INTERRUPT_ONLY_GRACE: Duration = Duration::from_millis(3000);

/// Upper bound for reaping a child after a kill signal.
pub const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for draining the pipe readers once the process is gone.
pub const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll interval for cancellation tokens and liveness checks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll interval of the session marker wait.
pub const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default timeout for a single session command.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout of the warm-up round-trip performed after a session (re)spawn.
pub const DEFAULT_WARMUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace window given to a background process after a non-forced kill.
pub const BACKGROUND_KILL_GRACE: Duration = Duration::from_millis(3000);

/// Background records older than this are force-killed by the sweeper.
pub const BACKGROUND_MAX_AGE: Duration = Duration::from_secs(8 * 60 * 60);

/// Shortest accepted interval between two background sweeps.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between two background sweeps.
pub const BACKGROUND_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
