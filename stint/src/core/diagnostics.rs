//! Extract located diagnostics from validation check output.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Diagnostic;

/// Upper bound on diagnostics kept per check.
pub const MAX_DIAGNOSTICS_PER_CHECK: usize = 50;

static RUSTC_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^error(?:\[(?P<code>E\d+)\])?: (?P<msg>.+)$").expect("rustc header regex is valid")
});
static RUSTC_ARROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*--> (?P<loc>\S+:\d+(?::\d+)?)\s*$").expect("rustc arrow regex is valid")
});
static PATH_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<loc>[^\s:]+\.[A-Za-z0-9]+:\d+(?::\d+)?):\s*(?P<msg>.+)$")
        .expect("path line regex is valid")
});
static TEST_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test (?P<name>\S+) \.\.\. FAILED$").expect("test regex is valid")
});
static PYTEST_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^FAILED (?P<name>\S+)(?: - (?P<msg>.+))?$").expect("pytest regex is valid")
});

/// Parse compiler, linter and test-runner output into diagnostics.
///
/// Recognises rustc `error:` blocks with their `-->` location, generic
/// `path:line[:col]: message` lines and failed test lines. Duplicates are
/// dropped and at most `limit` diagnostics are returned.
pub fn parse_diagnostics(check: &str, output: &str, limit: usize) -> Vec<Diagnostic> {
    let mut found: Vec<Diagnostic> = Vec::new();
    let mut pending: Option<String> = None;

    let push = |found: &mut Vec<Diagnostic>, location: &str, message: &str| {
        if found.len() >= limit {
            return;
        }
        let diagnostic = Diagnostic {
            check: check.to_string(),
            location: location.to_string(),
            message: message.trim().to_string(),
        };
        if !found.contains(&diagnostic) {
            found.push(diagnostic);
        }
    };

    for line in output.lines() {
        let line = line.trim_end();
        if let Some(caps) = RUSTC_HEADER.captures(line) {
            if let Some(message) = pending.take() {
                push(&mut found, check, &message);
            }
            let message = match caps.name("code") {
                Some(code) => format!("{}: {}", code.as_str(), &caps["msg"]),
                None => caps["msg"].to_string(),
            };
            pending = Some(message);
            continue;
        }
        if let Some(caps) = RUSTC_ARROW.captures(line) {
            if let Some(message) = pending.take() {
                push(&mut found, &caps["loc"], &message);
            }
            continue;
        }
        if let Some(caps) = TEST_FAILED.captures(line) {
            push(&mut found, &caps["name"], "test failed");
            continue;
        }
        if let Some(caps) = PYTEST_FAILED.captures(line) {
            let message = caps.name("msg").map_or("test failed", |m| m.as_str());
            push(&mut found, &caps["name"], message);
            continue;
        }
        if let Some(caps) = PATH_LINE.captures(line) {
            push(&mut found, &caps["loc"], &caps["msg"]);
        }
    }
    if let Some(message) = pending.take() {
        push(&mut found, check, &message);
    }
    found
}

/// Last `max_lines` non-empty lines of `output`.
pub fn output_tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
