//! # agentsh
//!
//! Process execution layer for a CLI coding agent: one-shot commands, persistent shell
//! sessions driven by an output-marker protocol, and detached background jobs tracked by
//! opaque handles.

include!(concat!(env!("OUT_DIR"), "/translations.rs"));

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Shared flag polled by long-running operations; setting it to `true` requests cancellation.
pub type CancellationToken = Arc<AtomicBool>;

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod system;
