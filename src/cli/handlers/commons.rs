// src/cli/handlers/commons.rs

//! Shared helpers used by multiple handlers.

use crate::{
    CancellationToken,
    models::{Dialect, Settings},
};
use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

/// Builds the multi-threaded runtime every async handler runs on.
pub fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context(t!("common.error.runtime"))
}

/// Sets `token` when the user presses Ctrl+C. Must be called inside the runtime.
pub fn watch_interrupt(token: &CancellationToken) -> JoinHandle<()> {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::debug!("Ctrl+C received, requesting cancellation.");
            token.store(true, Ordering::SeqCst);
        }
    })
}

/// The dialect an explicit flag asks for, else the configured default.
pub fn pick_dialect(flag: Option<Dialect>, settings: &Settings) -> Dialect {
    flag.unwrap_or_else(|| settings.dialect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_dialect_prefers_flag() {
        let settings = Settings {
            default_dialect: Some(Dialect::PowerShell),
            ..Settings::default()
        };
        assert_eq!(pick_dialect(Some(Dialect::Bash), &settings), Dialect::Bash);
        assert_eq!(pick_dialect(None, &settings), Dialect::PowerShell);
    }
}
