// src/system/events.rs

//! Structured lifecycle events for background jobs and shell sessions.

use crate::models::Dialect;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Facts about process lifecycles, emitted for observability collaborators.
///
/// Every event is also written to the `log` facade at debug level (launch failures at error
/// level); the channel is for consumers that want structured values instead of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ExecEvent {
    /// A background process started.
    Launched {
        handle: String,
        name: String,
        pid: Option<u32>,
    },
    /// A background process could not be started. Its record stays, marked failed.
    LaunchFailed {
        handle: String,
        error: String,
    },
    /// `is_running` was asked about a known handle.
    LivenessChecked {
        handle: String,
        running: bool,
    },
    /// A background process was stopped and its handle removed.
    Killed {
        handle: String,
        /// False when the process honored the interrupt within the grace window.
        forced: bool,
    },
    /// The sweeper force-killed a record older than the maximum age.
    Evicted {
        handle: String,
        age: Duration,
    },
    /// A shell session process was (re)started.
    SessionSpawned {
        dialect: Dialect,
        pid: Option<u32>,
    },
    /// A shell session process died or was discarded.
    SessionLost {
        dialect: Dialect,
    },
}

/// Optional sink for `ExecEvent`s. Sending never blocks and never fails the caller.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<UnboundedSender<ExecEvent>>);

impl EventSink {
    /// Sends every event to `sender`.
    pub fn new(sender: UnboundedSender<ExecEvent>) -> Self {
        Self(Some(sender))
    }

    /// A sink that only logs.
    pub fn none() -> Self {
        Self(None)
    }

    /// Logs `event` and forwards it if a receiver is attached. A dropped receiver is ignored.
    pub fn emit(&self, event: ExecEvent) {
        match &event {
            ExecEvent::LaunchFailed { handle, error } => {
                log::error!("Background process '{}' failed to start: {}", handle, error);
            }
            other => log::debug!("{:?}", other),
        }
        if let Some(sender) = &self.0 {
            let _ = sender.send(event);
        }
    }
}
