//! Prompt pack builder for model backend input.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::io::model::{ModelPhase, ModelRequest};

const PLANNING_TEMPLATE: &str = include_str!("prompts/planning.md");
const IMPLEMENTATION_TEMPLATE: &str = include_str!("prompts/implementation.md");
const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");

/// Droppable sections, least critical first.
const DROP_ORDER: [&str; 5] = ["memory", "tools", "plan", "guidance", "diagnostics"];

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("planning", PLANNING_TEMPLATE)
            .context("load planning template")?;
        env.add_template("implementation", IMPLEMENTATION_TEMPLATE)
            .context("load implementation template")?;
        env.add_template("retry", RETRY_TEMPLATE)
            .context("load retry template")?;
        Ok(Self { env })
    }

    fn render(&self, request: &ModelRequest) -> Result<String> {
        let name = match request.phase {
            ModelPhase::Planning => "planning",
            ModelPhase::Implementation => "implementation",
            ModelPhase::Retry => "retry",
        };
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(context! {
                attempt => request.attempt,
                feature => &request.feature,
                memory => &request.context.items,
                plan => &request.plan,
                diagnostics => &request.diagnostics,
                guidance => request.guidance.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                tools => &request.tools,
            })
            .with_context(|| format!("render {name} template"))?;
        Ok(rendered)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Section identifier (e.g., "contract", "feature").
    key: String,
    /// Whether this section is required (cannot be dropped).
    required: bool,
    /// Full section content including header.
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex is valid")
});

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps[1].to_string(),
                &caps[2] == "required",
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, end, key, required)) in markers.iter().enumerate() {
        let next = markers.get(i + 1).map_or(rendered.len(), |m| m.0);
        let content = rendered[*end..next].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // Still over budget: truncate the last section.
    let other_len: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        let mut cut = allowed.saturating_sub(12);
        while !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        last.content.truncate(cut);
        last.content.push_str("\n[truncated]");
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds a prompt within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    /// Create a builder with the given byte budget.
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, request: &ModelRequest) -> Result<String> {
        let rendered = PromptEngine::new()?.render(request)?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}
