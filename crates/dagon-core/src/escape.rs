//! Shell quoting, result packaging and backend noise filtering.
//!
//! All string-built shell commands go through [`quote`] / [`join`]; nothing
//! else in the workspace escapes shell text by hand.

use std::borrow::Cow;

use dagon_types::task::TaskResult;
use serde_json::json;

/// Exit code reported when a command exceeds its time bound.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Quote one argument for a POSIX shell.
pub fn quote(arg: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(arg))
}

/// Quote and join an argument vector into one shell command line.
pub fn join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| quote(arg.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replace literal newlines and tabs with their two-character escapes.
pub fn escape_control(text: &str) -> String {
    text.replace('\n', "\\n").replace('\t', "\\t")
}

/// Package command output into the uniform structured result.
pub fn package_result(text: &str, code: i32) -> TaskResult {
    TaskResult {
        output: json!({ "result": escape_control(text) }).to_string(),
        code,
    }
}

/// Drop every line of `stderr` containing one of `markers`.
///
/// Lines written by the user's own script pass through untouched.
pub fn strip_noise(stderr: &str, markers: &[&str]) -> String {
    if markers.is_empty() {
        return stderr.to_string();
    }
    stderr
        .lines()
        .filter(|line| !markers.iter().any(|marker| line.contains(marker)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge stdout with filtered stderr into the text shown to the user.
pub fn combine_output(stdout: &str, stderr: &str, markers: &[&str]) -> String {
    let stdout = stdout.trim();
    let stderr = strip_noise(stderr, markers);
    let stderr = stderr.trim();
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}
