// src/system/signals.rs

//! Interrupt, force-kill and liveness primitives for child processes.
//!
//! Children are started in their own process group on Unix, so signals go to the whole
//! group and reach grandchildren spawned by a shell. Windows has no interrupt that can be
//! targeted at a single console child; there the interrupt reports `Unsupported` and
//! callers escalate to a kill.

use std::io;
use std::time::Duration;
use tokio::process::Child;

/// Which processes a force-kill reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillScope {
    /// The child's whole process group (Unix), or just the child elsewhere.
    Group,
    /// Only the direct child.
    Leader,
}

/// Asks the child (and its process group) to stop, like Ctrl+C in a terminal.
#[cfg(unix)]
pub fn interrupt(child: &Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process already reaped"))?;
    let pgid = Pid::from_raw(i32::try_from(pid).map_err(io::Error::other)?);
    killpg(pgid, Signal::SIGINT).map_err(io::Error::from)
}

#[cfg(not(unix))]
pub fn interrupt(_child: &Child) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interrupt signals are not supported on this platform",
    ))
}

/// Forcefully terminates the child. Already-exited processes are not an error.
pub fn force_kill(child: &mut Child, scope: KillScope) -> io::Result<()> {
    #[cfg(unix)]
    {
        if scope == KillScope::Group {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let pgid = Pid::from_raw(i32::try_from(pid).map_err(io::Error::other)?);
                match killpg(pgid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(io::Error::from(e)),
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = scope;

    match child.start_kill() {
        Ok(()) => Ok(()),
        // `start_kill` on a reaped child reports InvalidInput.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e),
    }
}

/// Force-kills the process group led by `pid`, for groups whose leader is already reaped.
#[cfg(unix)]
pub fn kill_group(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(i32::try_from(pid).map_err(io::Error::other)?);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> io::Result<()> {
    Ok(())
}

/// True while the child has not exited. Reaps the child as a side effect once it has.
pub fn is_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Waits up to `limit` for the child to exit, returning its exit code when it did.
pub async fn wait_for_exit(child: &mut Child, limit: Duration) -> Option<i32> {
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => Some(exit_code_of(status)),
        Ok(Err(e)) => {
            log::warn!("Failed to wait for child process: {}", e);
            None
        }
        Err(_) => None,
    }
}

/// The exit code of a finished process. On Unix a signal death reports `128 + signo`.
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    crate::constants::SENTINEL_EXIT_CODE
}

/// Maps an I/O error from a signal call to the crate's error taxonomy.
pub fn classify_signal_error(error: &io::Error) -> crate::models::ProcessErrorKind {
    match error.kind() {
        io::ErrorKind::PermissionDenied => crate::models::ProcessErrorKind::AccessDenied,
        _ => crate::models::ProcessErrorKind::Other,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sleep(secs: &str) -> Child {
        Command::new("sleep")
            .arg(secs)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_interrupt_stops_sleep() {
        let mut child = spawn_sleep("10");
        assert!(is_alive(&mut child));
        interrupt(&child).unwrap();
        let code = wait_for_exit(&mut child, Duration::from_secs(2)).await;
        assert_eq!(code, Some(128 + 2));
        assert!(!is_alive(&mut child));
    }

    #[tokio::test]
    async fn test_force_kill_is_idempotent() {
        let mut child = spawn_sleep("10");
        force_kill(&mut child, KillScope::Group).unwrap();
        assert_eq!(
            wait_for_exit(&mut child, Duration::from_secs(2)).await,
            Some(128 + 9)
        );
        // Killing a reaped process is fine.
        force_kill(&mut child, KillScope::Group).unwrap();
        force_kill(&mut child, KillScope::Leader).unwrap();
    }
}
