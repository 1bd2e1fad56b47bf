// src/core/settings.rs

//! Loading `settings.toml` and applying environment overrides.

use crate::{
    core::paths::{self, PathError},
    models::{Dialect, Settings},
};
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Environment variable that overrides the default dialect.
pub const SHELL_ENV_VAR: &str = "AGENTSH_SHELL";

/// Errors from reading, parsing or writing the settings file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Could not read or write '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid settings file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Could not serialize default settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Loads `settings.toml` from the config directory, writing a default file on first use.
pub fn load_settings() -> Result<Settings, ConfigError> {
    let path = paths::get_settings_path()?;
    load_settings_from(&path)
}

/// Loads settings from `path`. A missing file is created with the defaults.
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };

    if !path.exists() {
        let defaults = Settings::default();
        let content = toml::to_string_pretty(&defaults)?;
        fs::write(path, content).map_err(io_err)?;
        log::debug!("Wrote default settings to '{}'", path.display());
        return Ok(defaults);
    }

    let content = fs::read_to_string(path).map_err(io_err)?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Loads settings, falling back to defaults (with a warning) when they are unavailable.
/// Environment overrides are applied in both cases.
pub fn load_or_default() -> Settings {
    let mut settings = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Using default settings: {}", e);
            Settings::default()
        }
    };
    apply_env_overrides(&mut settings);
    settings
}

/// Applies `AGENTSH_SHELL` on top of the file settings. Invalid values are ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(value) = env::var(SHELL_ENV_VAR) {
        match value.parse::<Dialect>() {
            Ok(dialect) => settings.default_dialect = Some(dialect),
            Err(e) => log::warn!("Ignoring {}: {}", SHELL_ENV_VAR, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeoutStrategy;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        // --- Setup ---
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        // --- Execute ---
        let settings = load_settings_from(&path).unwrap();

        // --- Assert ---
        assert_eq!(settings, Settings::default());
        assert!(path.is_file());
        let reloaded = load_settings_from(&path).unwrap();
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn test_existing_file_is_parsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            "default_strategy = \"immediate-kill\"\n[shells.powershell]\nextra_args = [\"-Sta\"]\n",
        )
        .unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.default_strategy, TimeoutStrategy::ImmediateKill);
        assert_eq!(
            settings.shell(Dialect::PowerShell).map(|s| s.extra_args.clone()),
            Some(vec!["-Sta".to_string()])
        );
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "session_timeout_ms = \"soon\"").unwrap();

        let err = load_settings_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("settings.toml"));
    }
}
