//! Lightweight symbol extraction for targeted source reads.
//!
//! Definitions are found by keyword on line starts, not by parsing, so the
//! results are approximate. Bodies are cut by indentation for `def` and by
//! brace balance otherwise; braces inside strings or comments can throw the
//! brace count off.

use std::sync::LazyLock;

use regex::Regex;

static DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?P<indent>[ \t]*)(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|const|unsafe|export|default|static|extern)\s+)*(?P<kind>fn|def|class|struct|enum|trait|function|func|interface)\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("definition regex is valid")
});

/// A named definition in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub kind: String,
    pub name: String,
    /// 1-based.
    pub line: usize,
}

fn is_function_kind(kind: &str) -> bool {
    matches!(kind, "fn" | "def" | "function" | "func")
}

/// Every definition in `source`, in file order.
pub fn list_symbols(source: &str) -> Vec<Symbol> {
    DEFINITION
        .captures_iter(source)
        .map(|caps| {
            let start = caps.get(0).map_or(0, |m| m.start());
            Symbol {
                kind: caps["kind"].to_string(),
                name: caps["name"].to_string(),
                line: source[..start].matches('\n').count() + 1,
            }
        })
        .collect()
}

/// Source text of the first function named `name`, from its definition line
/// to the end of its body.
pub fn function_source<'a>(source: &'a str, name: &str) -> Option<&'a str> {
    let caps = DEFINITION
        .captures_iter(source)
        .find(|caps| &caps["name"] == name && is_function_kind(&caps["kind"]))?;
    let start = caps.name("indent")?.end();
    let indent = caps["indent"].len();
    let rest = &source[start..];
    let len = if &caps["kind"] == "def" {
        indented_block_len(rest, indent)
    } else {
        braced_block_len(rest)
    };
    Some(rest[..len].trim_end())
}

/// Length of a definition line plus the lines indented deeper than it.
fn indented_block_len(text: &str, indent: usize) -> usize {
    let mut len = 0;
    for (index, line) in text.split_inclusive('\n').enumerate() {
        let body = line.trim_end();
        let depth = body.len() - body.trim_start().len();
        if index > 0 && !body.is_empty() && depth <= indent {
            break;
        }
        len += line.len();
    }
    len
}

/// Length up to the brace closing the first block, or up to a `;` ending a
/// bodiless declaration.
fn braced_block_len(text: &str) -> usize {
    let mut depth = 0usize;
    let mut opened = false;
    for (index, ch) in text.char_indices() {
        match ch {
            '{' => {
                depth += 1;
                opened = true;
            }
            '}' if opened => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return index + 1;
                }
            }
            ';' if !opened => return index + 1,
            _ => {}
        }
    }
    text.len()
}
