//! Orchestrator configuration stored under `.stint/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::gateway::SandboxPolicy;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StintConfig {
    /// Implementation attempts per session before it fails.
    pub max_attempts: u32,

    /// Wall-clock budget in seconds for one implementation attempt (tools included).
    pub attempt_timeout_secs: u64,

    pub model: ModelConfig,
    pub context: ContextConfig,
    pub sandbox: SandboxConfig,
    pub validation: ValidationConfig,
    pub scope: ScopeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Agent command. `{schema}` and `{output}` are replaced with the response
    /// schema path and the path the agent must write its JSON answer to. The
    /// prompt is fed on stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Extra attempts when the backend fails or answers unusably.
    pub retries: u32,
    pub output_limit_bytes: usize,
    pub prompt_budget_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: [
                "codex",
                "exec",
                "--skip-git-repo-check",
                "--output-schema",
                "{schema}",
                "--output-last-message",
                "{output}",
                "-",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            timeout_secs: 15 * 60,
            retries: 2,
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub max_entries: usize,
    /// Token cap on the memory bundle (about four characters per token).
    pub max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_entries: 20,
            max_tokens: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Filesystem roots tools may touch, relative to the workspace root.
    pub allowed_roots: Vec<PathBuf>,
    pub allow_network: bool,
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
    pub max_file_bytes: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_roots: vec![PathBuf::from(".")],
            allow_network: false,
            timeout_secs: 5 * 60,
            max_output_bytes: 20_000,
            max_file_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    pub checks: Vec<CheckConfig>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            checks: vec![CheckConfig::default()],
        }
    }
}

/// One validation check: a command that passes when it exits zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckConfig {
    pub name: String,
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            name: "ci".to_string(),
            command: vec!["just".to_string(), "ci".to_string()],
            timeout_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScopeConfig {
    pub max_description_chars: usize,
    pub max_split: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            max_description_chars: 500,
            max_split: 4,
        }
    }
}

impl Default for StintConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_secs: 30 * 60,
            model: ModelConfig::default(),
            context: ContextConfig::default(),
            sandbox: SandboxConfig::default(),
            validation: ValidationConfig::default(),
            scope: ScopeConfig::default(),
        }
    }
}

impl StintConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(anyhow!("attempt_timeout_secs must be > 0"));
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.output_limit_bytes == 0 || self.model.prompt_budget_bytes == 0 {
            return Err(anyhow!(
                "model.output_limit_bytes and model.prompt_budget_bytes must be > 0"
            ));
        }
        if self.context.max_entries == 0 || self.context.max_tokens == 0 {
            return Err(anyhow!(
                "context.max_entries and context.max_tokens must be > 0"
            ));
        }
        if self.sandbox.allowed_roots.is_empty() {
            return Err(anyhow!("sandbox.allowed_roots must not be empty"));
        }
        if self.sandbox.timeout_secs == 0 || self.sandbox.max_output_bytes == 0 {
            return Err(anyhow!(
                "sandbox.timeout_secs and sandbox.max_output_bytes must be > 0"
            ));
        }
        if self.validation.checks.is_empty() {
            return Err(anyhow!("validation.checks must list at least one check"));
        }
        for check in &self.validation.checks {
            if check.name.trim().is_empty() {
                return Err(anyhow!("validation check name must not be empty"));
            }
            if check.command.is_empty() || check.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "validation check {} must have a non-empty command",
                    check.name
                ));
            }
            if check.timeout_secs == 0 {
                return Err(anyhow!(
                    "validation check {} timeout_secs must be > 0",
                    check.name
                ));
            }
        }
        if self.scope.max_description_chars == 0 || self.scope.max_split < 2 {
            return Err(anyhow!(
                "scope.max_description_chars must be > 0 and scope.max_split >= 2"
            ));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Sandbox policy with roots resolved against `root`.
    pub fn sandbox_policy(&self, root: &Path) -> SandboxPolicy {
        SandboxPolicy {
            allowed_roots: self
                .sandbox
                .allowed_roots
                .iter()
                .map(|r| crate::core::path::normalize(root, r))
                .collect(),
            allow_network: self.sandbox.allow_network,
            timeout: Duration::from_secs(self.sandbox.timeout_secs),
            max_output_bytes: self.sandbox.max_output_bytes,
            max_file_bytes: self.sandbox.max_file_bytes,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StintConfig::default()`.
pub fn load_config(path: &Path) -> Result<StintConfig> {
    if !path.exists() {
        let cfg = StintConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: StintConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StintConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, StintConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = StintConfig::default();
        cfg.validation.checks.push(CheckConfig {
            name: "lint".to_string(),
            command: vec!["cargo".to_string(), "clippy".to_string()],
            timeout_secs: 60,
        });
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_takes_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_attempts = 5\n\n[sandbox]\nallow_network = true\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_attempts, 5);
        assert!(cfg.sandbox.allow_network);
        assert_eq!(cfg.sandbox.timeout_secs, SandboxConfig::default().timeout_secs);
        assert_eq!(cfg.validation, ValidationConfig::default());
    }

    #[test]
    fn empty_check_list_is_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[validation]\nchecks = []\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("at least one check"));
    }

    #[test]
    fn sandbox_roots_resolve_against_workspace() {
        let cfg = StintConfig::default();
        let policy = cfg.sandbox_policy(Path::new("/work/repo"));
        assert_eq!(policy.allowed_roots, vec![PathBuf::from("/work/repo")]);
        assert!(!policy.allow_network);
    }
}
