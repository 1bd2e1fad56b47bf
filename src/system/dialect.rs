// src/system/dialect.rs

//! Per-dialect protocol functions, kept as a static table of plain functions so every
//! dialect's quirks live side by side and `match` exhaustiveness covers new variants.

use crate::constants::{MARKER_PREFIX, MARKER_SUFFIX};
use crate::models::{Dialect, ProcessSpec};
use regex::Regex;
use std::path::Path;
use uuid::Uuid;

/// The pure functions and constants that make up one dialect.
#[derive(Debug)]
pub struct DialectOps {
    /// Wraps a user command so its exit code is echoed after the marker.
    pub wrap: fn(marker: &str, command: &str) -> String,
    /// Recovers the exit code from a marker line. Never fails.
    pub parse_exit_code: fn(marker: &str, line: &str) -> i32,
    /// Arguments that start a long-lived shell reading commands from stdin.
    pub session_args: &'static [&'static str],
    /// Flag that makes the shell run a single command line and exit.
    pub command_flag: &'static [&'static str],
    /// A command that does nothing, used for the warm-up round-trip.
    pub no_op: &'static str,
    /// Binary name looked up on Unix-like systems.
    pub unix_binary: &'static str,
    /// Binary names looked up on Windows, in preference order.
    pub windows_binaries: &'static [&'static str],
    /// A path fragment that identifies the preferred vendor build on Windows.
    pub vendor_marker: Option<&'static str>,
}

static BASH: DialectOps = DialectOps {
    wrap: wrap_bash,
    parse_exit_code: parse_marker_exit_code,
    session_args: &["--noprofile", "--norc"],
    command_flag: &["-c"],
    no_op: ":",
    unix_binary: "bash",
    windows_binaries: &["bash.exe"],
    vendor_marker: Some("Git"),
};

static CMD: DialectOps = DialectOps {
    wrap: wrap_cmd,
    parse_exit_code: parse_cmd_exit_code,
    session_args: &["/Q", "/D"],
    command_flag: &["/D", "/S", "/C"],
    no_op: "rem",
    unix_binary: "cmd",
    windows_binaries: &["cmd.exe"],
    vendor_marker: None,
};

static POWERSHELL: DialectOps = DialectOps {
    wrap: wrap_powershell,
    parse_exit_code: parse_marker_exit_code,
    session_args: &["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", "-"],
    command_flag: &["-NoLogo", "-NoProfile", "-NonInteractive", "-Command"],
    no_op: "$null",
    unix_binary: "pwsh",
    windows_binaries: &["pwsh.exe", "powershell.exe"],
    vendor_marker: Some("PowerShell"),
};

impl Dialect {
    /// The dispatch table for this dialect.
    pub fn ops(self) -> &'static DialectOps {
        match self {
            Self::Bash => &BASH,
            Self::Cmd => &CMD,
            Self::PowerShell => &POWERSHELL,
        }
    }

    /// Dialect text that runs `command` and then prints `<marker><exit code>` on its own line.
    pub fn wrap_command(self, marker: &str, command: &str) -> String {
        (self.ops().wrap)(marker, command)
    }

    /// Parses the exit code out of a line containing the marker; unparsable input yields 0.
    pub fn parse_exit_code(self, marker: &str, line: &str) -> i32 {
        (self.ops().parse_exit_code)(marker, line)
    }

    /// Spec for a long-lived shell process that reads commands from stdin.
    pub fn session_spec(self, shell_path: &Path, extra_args: &[String]) -> ProcessSpec {
        ProcessSpec::new(shell_path.to_string_lossy())
            .args(self.ops().session_args.iter().copied())
            .args(extra_args.iter().cloned())
    }

    /// Spec that hands one complete command line to this dialect's shell.
    pub fn command_spec(self, shell_path: &Path, command_line: &str) -> ProcessSpec {
        ProcessSpec::new(shell_path.to_string_lossy())
            .args(self.ops().command_flag.iter().copied())
            .arg(command_line)
    }
}

// --- Markers ---

/// Generates a fresh marker token that cannot plausibly collide with program output.
pub fn generate_marker() -> String {
    format!(
        "{}{}{}",
        MARKER_PREFIX,
        Uuid::new_v4().simple(),
        MARKER_SUFFIX
    )
}

/// The regex matching `<marker><optional whitespace><signed integer>` anywhere in a line.
pub fn marker_regex(marker: &str) -> Regex {
    Regex::new(&format!(r"{}\s*(-?\d+)", regex::escape(marker)))
        .expect("an escaped literal followed by a fixed pattern is a valid regex")
}

// --- Wrappers ---

// Every wrapper prints exactly one newline before the marker line, so the marker never
// shares a line with unterminated command output. Stripping relies on that separator.

fn wrap_bash(marker: &str, command: &str) -> String {
    // The command keeps a line of its own so trailing comments and heredocs stay intact.
    format!(
        "{command}\n__agentsh_ec=$?; printf '\\n{marker}%s\\n' \"$__agentsh_ec\"\n"
    )
}

fn wrap_cmd(marker: &str, command: &str) -> String {
    // %ERRORLEVEL% expands when a line is parsed, so the echo needs a line of its own.
    format!("{command}\r\necho.\r\necho {marker}%ERRORLEVEL%\r\n")
}

fn wrap_powershell(marker: &str, command: &str) -> String {
    format!(
        "$global:LASTEXITCODE = $null; try {{ {command}; $__agentsh_ok = $? }} catch {{ $__agentsh_ok = $false; Write-Error $_ }}; \
         $__agentsh_ec = if ($null -ne $global:LASTEXITCODE) {{ $global:LASTEXITCODE }} elseif ($__agentsh_ok) {{ 0 }} else {{ 1 }}; \
         [Console]::Out.WriteLine(''); [Console]::Out.WriteLine(\"{marker}$__agentsh_ec\")\n"
    )
}

// --- Exit code parsers ---

fn parse_marker_exit_code(marker: &str, line: &str) -> i32 {
    let Some((_, rest)) = line.split_once(marker) else {
        return 0;
    };
    let rest = rest.trim_start();
    let digits_end = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map_or(rest.len(), |(i, _)| i);
    rest.get(..digits_end)
        .and_then(|n| n.parse::<i32>().ok())
        .unwrap_or(0)
}

fn parse_cmd_exit_code(marker: &str, line: &str) -> i32 {
    // cmd.exe keeps the carriage return of CRLF line endings.
    parse_marker_exit_code(marker, line.trim_end_matches(['\r', ' ']))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "__AGENTSH_test__";

    #[test]
    fn test_parse_exit_code_variants() {
        for dialect in Dialect::ALL {
            assert_eq!(dialect.parse_exit_code(MARKER, "__AGENTSH_test__0"), 0);
            assert_eq!(dialect.parse_exit_code(MARKER, "__AGENTSH_test__  42"), 42);
            assert_eq!(dialect.parse_exit_code(MARKER, "__AGENTSH_test__-1"), -1);
            assert_eq!(dialect.parse_exit_code(MARKER, "out__AGENTSH_test__7\r"), 7);
            assert_eq!(dialect.parse_exit_code(MARKER, "__AGENTSH_test__abc"), 0);
            assert_eq!(dialect.parse_exit_code(MARKER, "no marker here"), 0);
            assert_eq!(
                dialect.parse_exit_code(MARKER, "__AGENTSH_test__99999999999999"),
                0
            );
        }
    }

    #[test]
    fn test_wrap_contains_command_and_marker() {
        let bash = Dialect::Bash.wrap_command(MARKER, "ls -la");
        assert!(bash.starts_with("ls -la\n"));
        assert!(bash.contains("__agentsh_ec=$?;"));
        assert!(bash.contains(MARKER));

        let cmd = Dialect::Cmd.wrap_command(MARKER, "dir");
        assert!(cmd.contains("echo __AGENTSH_test__%ERRORLEVEL%"));

        let pwsh = Dialect::PowerShell.wrap_command(MARKER, "Get-Item .");
        assert!(pwsh.contains("try { Get-Item .;"));
        assert!(pwsh.contains("catch"));
        assert!(pwsh.ends_with('\n'));
    }

    #[test]
    fn test_marker_regex_matches_only_marker_lines() {
        let marker = generate_marker();
        let re = marker_regex(&marker);
        assert!(re.is_match(&format!("{marker}0")));
        assert!(re.is_match(&format!("{marker} -3")));
        assert!(!re.is_match(&format!("{marker}%ERRORLEVEL%")));
        assert!(!re.is_match("__AGENTSH_other__0"));
    }

    #[test]
    fn test_generated_markers_are_unique() {
        let a = generate_marker();
        let b = generate_marker();
        assert_ne!(a, b);
        assert!(a.starts_with(MARKER_PREFIX) && a.ends_with(MARKER_SUFFIX));
    }

    #[test]
    fn test_specs_use_dispatch_table_arguments() {
        let path = Path::new("/bin/bash");
        let spec = Dialect::Bash.command_spec(path, "echo hi");
        assert_eq!(spec.program, "/bin/bash");
        assert_eq!(spec.args, vec!["-c", "echo hi"]);

        let session = Dialect::PowerShell.session_spec(Path::new("pwsh"), &["-Foo".to_string()]);
        assert_eq!(session.args.last().map(String::as_str), Some("-Foo"));
        assert!(session.args.contains(&"-NoProfile".to_string()));
    }
}
