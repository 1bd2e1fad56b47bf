//! # System Interaction Layer
//!
//! Everything that touches operating-system processes lives here. The rest of the crate
//! only sees typed requests and results.
//!
//! ## Modules
//!
//! - **`executor`**: One-shot process execution with concurrent pipe capture, timeouts,
//!   cancellation and the four termination strategies.
//! - **`session`**: Persistent Bash, Cmd and PowerShell processes driven by an output-marker
//!   protocol, one serialized session per dialect.
//! - **`background`**: Handle-addressed fire-and-forget processes with live liveness checks
//!   and age-based eviction.
//! - **`dialect`**: The static per-dialect table of wrappers, exit-code parsers and start
//!   arguments.
//! - **`escape`**: Quoting of arguments for each dialect, for argv and for stdin text.
//! - **`resolver`**: Locating the shell binary of a dialect.
//! - **`output`**: Line-buffered stdout/stderr readers and marker stripping.
//! - **`signals`**: Interrupt, force-kill and liveness primitives.
//! - **`events`**: Structured lifecycle events for observers.

pub mod background;
pub mod dialect;
pub mod escape;
pub mod events;
pub mod executor;
pub mod output;
pub mod resolver;
pub mod session;
pub mod signals;
