//! Initialization helpers for `.stint/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{StintConfig, write_config};

/// All canonical paths within `.stint/` for a workspace root.
#[derive(Debug, Clone)]
pub struct StintPaths {
    pub root: PathBuf,
    pub stint_dir: PathBuf,
    pub config_path: PathBuf,
    /// One JSONL log per session.
    pub log_dir: PathBuf,
    /// Scratch space for model backend prompts, schemas and outputs.
    pub model_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl StintPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let stint_dir = root.join(".stint");
        Self {
            root: root.clone(),
            stint_dir: stint_dir.clone(),
            config_path: stint_dir.join("config.toml"),
            log_dir: stint_dir.join("log"),
            model_dir: stint_dir.join("model"),
            gitignore_path: stint_dir.join(".gitignore"),
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the existing config and gitignore. Logs are never touched.
    pub force: bool,
}

/// Create `.stint/` scaffolding in `root`.
///
/// Fails if `.stint/` already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<StintPaths> {
    let paths = StintPaths::new(root);
    if paths.stint_dir.exists() && !paths.stint_dir.is_dir() {
        return Err(anyhow!("stint init: .stint exists but is not a directory"));
    }
    if paths.stint_dir.exists() && !options.force {
        return Err(anyhow!(
            "stint init: .stint already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.stint_dir)?;
    create_dir(&paths.log_dir)?;
    create_dir(&paths.model_dir)?;

    write_config(&paths.config_path, &StintConfig::default())?;
    fs::write(&paths.gitignore_path, STINT_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const STINT_GITIGNORE: &str = "model/\n";
