// src/system/resolver.rs

//! Locating the executable behind each shell dialect.

use crate::models::{Dialect, Settings};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Why no executable could be found for a dialect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Nothing on `PATH` (or at the default location) matched.
    #[error("No '{binary}' executable for the {dialect} dialect was found on PATH.")]
    NotFound { dialect: Dialect, binary: String },
    /// The dialect does not exist on this platform (`cmd` off Windows).
    #[error("The {0} dialect is not available on this operating system.")]
    Unsupported(Dialect),
    /// A path override references an unknown variable or home directory.
    #[error("Configured path '{path}' for the {dialect} dialect could not be expanded: {reason}")]
    InvalidOverride {
        dialect: Dialect,
        path: String,
        reason: String,
    },
}

/// Finds the executable behind each shell dialect.
///
/// Configured overrides win. Otherwise non-Windows systems assume the dialect binary is on
/// `PATH`, while Windows searches `PATH` and prefers builds from a known vendor directory.
/// The first successful lookup per dialect is cached for the resolver's lifetime.
#[derive(Debug, Default)]
pub struct ShellResolver {
    overrides: HashMap<Dialect, String>,
    cache: Mutex<HashMap<Dialect, PathBuf>>,
}

impl ShellResolver {
    /// Creates a resolver that honors the `[shells.*] path` entries of the settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let overrides = Dialect::ALL
            .into_iter()
            .filter_map(|d| {
                settings
                    .shell(d)
                    .and_then(|s| s.path.clone())
                    .map(|path| (d, path))
            })
            .collect();
        Self {
            overrides,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Adds or replaces the explicit path for one dialect.
    pub fn with_override(mut self, dialect: Dialect, path: impl Into<String>) -> Self {
        self.overrides.insert(dialect, path.into());
        self
    }

    /// Returns the executable path for `dialect`, or a typed error before any spawn happens.
    pub fn resolve(&self, dialect: Dialect) -> Result<PathBuf, ResolveError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = cache.get(&dialect) {
            return Ok(path.clone());
        }

        let resolved = match self.overrides.get(&dialect) {
            Some(template) => expand_override(dialect, template)?,
            None if cfg!(target_os = "windows") => resolve_windows(dialect)?,
            None => resolve_unix(dialect)?,
        };

        log::debug!("Resolved {} dialect to '{}'", dialect, resolved.display());
        cache.insert(dialect, resolved.clone());
        Ok(resolved)
    }
}

fn expand_override(dialect: Dialect, template: &str) -> Result<PathBuf, ResolveError> {
    let expanded = shellexpand::full(template).map_err(|e| ResolveError::InvalidOverride {
        dialect,
        path: template.to_string(),
        reason: e.to_string(),
    })?;
    Ok(dunce::simplified(Path::new(expanded.as_ref())).to_path_buf())
}

fn resolve_unix(dialect: Dialect) -> Result<PathBuf, ResolveError> {
    match dialect {
        Dialect::Cmd => Err(ResolveError::Unsupported(dialect)),
        Dialect::Bash | Dialect::PowerShell => Ok(PathBuf::from(dialect.ops().unix_binary)),
    }
}

fn resolve_windows(dialect: Dialect) -> Result<PathBuf, ResolveError> {
    if dialect == Dialect::Cmd {
        // cmd.exe lives in System32, which is always searched by CreateProcess.
        return Ok(env::var_os("COMSPEC")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("cmd.exe")));
    }

    let ops = dialect.ops();
    let path_var = env::var_os("PATH").unwrap_or_default();
    ops.windows_binaries
        .iter()
        .find_map(|binary| find_in_path(binary, &path_var, ops.vendor_marker))
        .ok_or_else(|| ResolveError::NotFound {
            dialect,
            binary: ops.windows_binaries.join(" / "),
        })
}

/// Searches every directory of `path_var` for `binary`.
///
/// When `vendor_marker` is set, a match whose path contains the marker (case-insensitive)
/// wins over earlier matches; otherwise the first match wins.
pub fn find_in_path(
    binary: &str,
    path_var: &std::ffi::OsStr,
    vendor_marker: Option<&str>,
) -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = env::split_paths(path_var)
        .map(|dir| dir.join(binary))
        .filter(|candidate| candidate.is_file())
        .collect();

    let preferred = vendor_marker.and_then(|marker| {
        let marker = marker.to_lowercase();
        candidates
            .iter()
            .find(|c| c.to_string_lossy().to_lowercase().contains(&marker))
    });

    preferred
        .or_else(|| candidates.first())
        .map(|p| dunce::simplified(p).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_find_in_path_prefers_vendor_marker() {
        // --- Setup ---
        let root = tempdir().unwrap();
        let system = root.path().join("Windows").join("System32");
        let vendor = root.path().join("Git").join("bin");
        fs::create_dir_all(&system).unwrap();
        fs::create_dir_all(&vendor).unwrap();
        fs::write(system.join("bash.exe"), b"").unwrap();
        fs::write(vendor.join("bash.exe"), b"").unwrap();
        let path_var = env::join_paths([&system, &vendor]).unwrap();

        // --- Execute ---
        let preferred = find_in_path("bash.exe", &path_var, Some("git"));
        let first = find_in_path("bash.exe", &path_var, None);

        // --- Assert ---
        assert_eq!(preferred, Some(vendor.join("bash.exe")));
        assert_eq!(first, Some(system.join("bash.exe")));
    }

    #[test]
    fn test_find_in_path_missing_binary() {
        let root = tempdir().unwrap();
        let path_var = env::join_paths([root.path()]).unwrap();
        assert_eq!(find_in_path("pwsh.exe", &path_var, Some("PowerShell")), None);
    }

    #[test]
    fn test_override_wins_and_is_cached() {
        let resolver = ShellResolver::default().with_override(Dialect::Bash, "/opt/bash/bin/bash");
        let first = resolver.resolve(Dialect::Bash).unwrap();
        assert_eq!(first, PathBuf::from("/opt/bash/bin/bash"));
        assert_eq!(resolver.resolve(Dialect::Bash).unwrap(), first);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_resolution() {
        let resolver = ShellResolver::default();
        assert_eq!(resolver.resolve(Dialect::Bash).unwrap(), PathBuf::from("bash"));
        assert_eq!(
            resolver.resolve(Dialect::PowerShell).unwrap(),
            PathBuf::from("pwsh")
        );
        assert_eq!(
            resolver.resolve(Dialect::Cmd),
            Err(ResolveError::Unsupported(Dialect::Cmd))
        );
    }
}
