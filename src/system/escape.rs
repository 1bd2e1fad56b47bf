// src/system/escape.rs

//! Dialect-aware escaping for the two places text is injected into a shell:
//! a single OS argv token, and a line written to an already-running shell's stdin.

use crate::models::Dialect;
use std::borrow::Cow;

/// Where the escaped text ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeContext {
    /// One token of a command line that the shell itself will parse (e.g. `bash -c "..."`).
    Argv,
    /// Text fed to a running shell's line lexer through its standard input.
    Stdin,
}

const BASH_ARGV_SPECIALS: &[char] = &[
    ' ', '\t', '\n', '\'', '"', '\\', ';', '|', '<', '>', '&', '$', '`', '*', '?', '(', ')', '#',
    '~', '[', ']', '{', '}', '!',
];
const CMD_STDIN_SPECIALS: &[char] = &['^', '&', '|', '<', '>', '(', ')', '%'];
const CMD_ARGV_SPECIALS: &[char] = &[' ', '\t', '&', '|', '<', '>', '^', '"'];
const PWSH_STDIN_SPECIALS: &[char] = &['`', '"', '\'', '$', '&', ';', '(', ')', '|'];
const PWSH_ARGV_SPECIALS: &[char] = &[
    ' ', '\t', '"', '\'', '$', '&', ';', '(', ')', '|', '`', '{', '}', '@', ',', '<', '>',
];

/// Escapes `arg` for the given dialect and injection context.
///
/// Arguments that are already fully quoted, already escaped for `context`, or that contain
/// nothing the dialect treats specially are returned unchanged, so escaping is idempotent.
pub fn escape(dialect: Dialect, arg: &str, context: EscapeContext) -> Cow<'_, str> {
    let already_escaped =
        is_fully_quoted(dialect, arg) || is_escaped_for_stdin(dialect, arg, context);
    if !arg.is_empty() && already_escaped {
        return Cow::Borrowed(arg);
    }

    match (dialect, context) {
        (Dialect::Bash, EscapeContext::Stdin) => {
            if arg.contains('\'') {
                Cow::Owned(arg.replace('\'', "'\\''"))
            } else {
                Cow::Borrowed(arg)
            }
        }
        (Dialect::Bash, EscapeContext::Argv) => {
            if arg.is_empty() || arg.contains(BASH_ARGV_SPECIALS) {
                Cow::Owned(format!("'{}'", arg.replace('\'', "'\\''")))
            } else {
                Cow::Borrowed(arg)
            }
        }
        (Dialect::Cmd, EscapeContext::Stdin) => prefix_specials(arg, CMD_STDIN_SPECIALS, '^'),
        (Dialect::Cmd, EscapeContext::Argv) => {
            if arg.is_empty() || arg.contains(CMD_ARGV_SPECIALS) {
                Cow::Owned(double_quote(arg))
            } else {
                Cow::Borrowed(arg)
            }
        }
        (Dialect::PowerShell, EscapeContext::Stdin) => {
            prefix_specials(arg, PWSH_STDIN_SPECIALS, '`')
        }
        (Dialect::PowerShell, EscapeContext::Argv) => {
            if arg.is_empty() || arg.contains(PWSH_ARGV_SPECIALS) {
                Cow::Owned(double_quote(arg))
            } else {
                Cow::Borrowed(arg)
            }
        }
    }
}

/// Escapes every argument for argv context and joins them into one command line.
pub fn join_command_line(dialect: Dialect, program: &str, args: &[String]) -> String {
    let mut line = escape(dialect, program, EscapeContext::Argv).into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&escape(dialect, arg, EscapeContext::Argv));
    }
    line
}

/// True when the whole argument is one quoted token in the dialect's grammar, including
/// the forms this module produces for arguments with embedded quotes.
fn is_fully_quoted(dialect: Dialect, arg: &str) -> bool {
    match dialect {
        Dialect::Bash => is_bash_single_quoted(arg) || is_bash_double_quoted(arg),
        Dialect::Cmd => is_quoted_with_doubling(arg, '"'),
        Dialect::PowerShell => {
            is_quoted_with_doubling(arg, '"') || is_quoted_with_doubling(arg, '\'')
        }
    }
}

/// `'...'` segments, optionally joined by `\'`, as in `'it'\''s'`.
fn is_bash_single_quoted(arg: &str) -> bool {
    if !arg.starts_with('\'') || !arg.ends_with('\'') {
        return false;
    }
    let mut rest = arg;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("\\'") {
            rest = after;
        } else if let Some(after) = rest.strip_prefix('\'') {
            let Some(end) = after.find('\'') else {
                return false;
            };
            rest = after.get(end + 1..).unwrap_or_default();
        } else {
            return false;
        }
    }
    true
}

/// `"..."` whose inner double quotes are all backslash-escaped.
fn is_bash_double_quoted(arg: &str) -> bool {
    let Some(inner) = strip_quotes(arg, '"') else {
        return false;
    };
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if chars.next().is_none() {
                    return false;
                }
            }
            '"' => return false,
            _ => {}
        }
    }
    true
}

/// `<q>...<q>` whose inner quote characters only appear doubled, as in `"say ""hi"""`.
fn is_quoted_with_doubling(arg: &str, quote: char) -> bool {
    let Some(inner) = strip_quotes(arg, quote) else {
        return false;
    };
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == quote && chars.next() != Some(quote) {
            return false;
        }
    }
    true
}

fn strip_quotes(arg: &str, quote: char) -> Option<&str> {
    arg.strip_prefix(quote)?.strip_suffix(quote)
}

/// True when `arg` already is the output of stdin escaping for the dialect.
fn is_escaped_for_stdin(dialect: Dialect, arg: &str, context: EscapeContext) -> bool {
    if context != EscapeContext::Stdin {
        return false;
    }
    match dialect {
        Dialect::Bash => arg.contains('\'') && !arg.replace("'\\''", "").contains('\''),
        Dialect::Cmd => is_prefix_escaped(arg, CMD_STDIN_SPECIALS, '^'),
        Dialect::PowerShell => is_prefix_escaped(arg, PWSH_STDIN_SPECIALS, '`'),
    }
}

/// Every special character in `arg` is preceded by `escape_char`, and at least one is.
fn is_prefix_escaped(arg: &str, specials: &[char], escape_char: char) -> bool {
    let mut escaped_any = false;
    let mut chars = arg.chars();
    while let Some(c) = chars.next() {
        if c == escape_char {
            match chars.next() {
                Some(next) if specials.contains(&next) => escaped_any = true,
                _ => return false,
            }
        } else if specials.contains(&c) {
            return false;
        }
    }
    escaped_any
}

fn prefix_specials<'a>(arg: &'a str, specials: &[char], escape_char: char) -> Cow<'a, str> {
    if !arg.contains(specials) {
        return Cow::Borrowed(arg);
    }
    let mut escaped = String::with_capacity(arg.len() + 8);
    for c in arg.chars() {
        if specials.contains(&c) {
            escaped.push(escape_char);
        }
        escaped.push(c);
    }
    Cow::Owned(escaped)
}

fn double_quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', "\"\""))
}
