//! Built-in workspace tools: shell commands, file operations and targeted
//! source reads.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde_json::Value;

use crate::core::symbols::{function_source, list_symbols};
use crate::io::gateway::{Access, Tool, ToolContext, ToolRegistry, ToolRun};
use crate::io::process::run_command_with_timeout;

/// Registry with every built-in tool.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(RunCommand)
        .register(ReadFile)
        .register(WriteFile)
        .register(AppendFile)
        .register(ListDir)
        .register(ListSymbols)
        .register(ReadFunction);
    registry
}

fn str_arg<'a>(arguments: &'a Value, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string argument `{key}`"))
}

fn opt_str_arg<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(Value::as_str)
}

/// Programs whose purpose is talking to the network.
static NETWORK_PROGRAMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s;&|(`])(curl|wget|ssh|scp|sftp|rsync|nc|ncat|telnet|ftp)(?:\s|$)")
        .expect("network program regex is valid")
});

/// Run a shell command (`sh -c`) inside the workspace.
///
/// Arguments: `command`, optional `cwd` and `timeout_secs` (never beyond the
/// policy timeout).
pub struct RunCommand;

impl Tool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace. Args: {\"command\": str, \"cwd\"?: str, \"timeout_secs\"?: int}"
    }

    fn access(&self, arguments: &Value, ctx: &ToolContext) -> Result<Vec<Access>> {
        let command = str_arg(arguments, "command")?;
        let cwd = ctx.resolve(opt_str_arg(arguments, "cwd").unwrap_or("."));
        let mut accesses = vec![Access::Execute { cwd }];
        for caps in NETWORK_PROGRAMS.captures_iter(command) {
            accesses.push(Access::Network(caps[1].to_string()));
        }
        Ok(accesses)
    }

    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun> {
        let command = str_arg(arguments, "command")?;
        let cwd = ctx.resolve(opt_str_arg(arguments, "cwd").unwrap_or("."));
        let timeout = arguments
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map_or(ctx.timeout, |secs| ctx.timeout.min(Duration::from_secs(secs)));

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&cwd);
        let output = run_command_with_timeout(
            cmd,
            None,
            timeout,
            ctx.policy.max_output_bytes,
            Some(&ctx.cancel),
        )
        .with_context(|| format!("run `{command}`"))?;

        Ok(ToolRun {
            success: output.success(),
            exit_code: output.status.code(),
            stdout: output.stdout_text("command"),
            stderr: output.stderr_text("command"),
            timed_out: output.timed_out,
        })
    }
}

/// Read a UTF-8 file. Arguments: `path`.
pub struct ReadFile;

impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Args: {\"path\": str}"
    }

    fn access(&self, arguments: &Value, ctx: &ToolContext) -> Result<Vec<Access>> {
        Ok(vec![Access::Read(ctx.resolve(str_arg(arguments, "path")?))])
    }

    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun> {
        let path = ctx.resolve(str_arg(arguments, "path")?);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(ToolRun::ok(contents))
    }
}

/// Create or replace a file. Arguments: `path`, `content`.
pub struct WriteFile;

impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file. Args: {\"path\": str, \"content\": str}"
    }

    fn access(&self, arguments: &Value, ctx: &ToolContext) -> Result<Vec<Access>> {
        let path = ctx.resolve(str_arg(arguments, "path")?);
        let bytes = str_arg(arguments, "content")?.len() as u64;
        Ok(vec![Access::Write { path, bytes }])
    }

    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun> {
        let path = ctx.resolve(str_arg(arguments, "path")?);
        let content = str_arg(arguments, "content")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        Ok(ToolRun::ok(format!(
            "wrote {} bytes to {}",
            content.len(),
            path.display()
        )))
    }
}

/// Append to a file, creating it if needed. Arguments: `path`, `content`.
pub struct AppendFile;

impl Tool for AppendFile {
    fn name(&self) -> &str {
        "append_file"
    }

    fn description(&self) -> &str {
        "Append text to a file, creating it if missing. Args: {\"path\": str, \"content\": str}"
    }

    fn access(&self, arguments: &Value, ctx: &ToolContext) -> Result<Vec<Access>> {
        let path = ctx.resolve(str_arg(arguments, "path")?);
        let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let bytes = existing + str_arg(arguments, "content")?.len() as u64;
        Ok(vec![Access::Write { path, bytes }])
    }

    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun> {
        let path = ctx.resolve(str_arg(arguments, "path")?);
        let content = str_arg(arguments, "content")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        Ok(ToolRun::ok(format!(
            "appended {} bytes to {}",
            content.len(),
            path.display()
        )))
    }
}

/// List a directory, one entry per line, directories suffixed with `/`.
/// Arguments: optional `path` (default: workspace root).
pub struct ListDir;

impl Tool for ListDir {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory entries. Args: {\"path\"?: str}"
    }

    fn access(&self, arguments: &Value, ctx: &ToolContext) -> Result<Vec<Access>> {
        let path = ctx.resolve(opt_str_arg(arguments, "path").unwrap_or("."));
        Ok(vec![Access::Read(path)])
    }

    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun> {
        let path = ctx.resolve(opt_str_arg(arguments, "path").unwrap_or("."));
        let mut names = Vec::new();
        for entry in fs::read_dir(&path).with_context(|| format!("list {}", path.display()))? {
            let entry = entry.with_context(|| format!("list {}", path.display()))?;
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(ToolRun::ok(names.join("\n")))
    }
}

/// Definitions in a file, or in the files of a directory (not recursive).
/// Arguments: `path`, optional `extension` filtering directory entries.
pub struct ListSymbols;

impl Tool for ListSymbols {
    fn name(&self) -> &str {
        "list_symbols"
    }

    fn description(&self) -> &str {
        "List function, type and class definitions without reading whole files. Args: {\"path\": str, \"extension\"?: str}"
    }

    fn access(&self, arguments: &Value, ctx: &ToolContext) -> Result<Vec<Access>> {
        Ok(vec![Access::Read(ctx.resolve(str_arg(arguments, "path")?))])
    }

    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun> {
        let path = ctx.resolve(str_arg(arguments, "path")?);
        let extension = opt_str_arg(arguments, "extension").map(|e| e.trim_start_matches('.'));

        let files = if path.is_dir() {
            let mut files = Vec::new();
            for entry in fs::read_dir(&path).with_context(|| format!("list {}", path.display()))? {
                let file = entry
                    .with_context(|| format!("list {}", path.display()))?
                    .path();
                let wanted = extension
                    .is_none_or(|ext| file.extension().and_then(|e| e.to_str()) == Some(ext));
                if file.is_file() && wanted {
                    files.push(file);
                }
            }
            files.sort();
            files
        } else {
            vec![path]
        };

        let mut listing = String::new();
        for file in files {
            // Binary files have no symbols worth listing.
            let Ok(source) = fs::read_to_string(&file) else {
                continue;
            };
            let symbols = list_symbols(&source);
            if symbols.is_empty() {
                continue;
            }
            let shown = file.strip_prefix(&ctx.workdir).unwrap_or(&file);
            listing.push_str(&format!("{}\n", shown.display()));
            for symbol in symbols {
                listing.push_str(&format!(
                    "  {} {} (line {})\n",
                    symbol.kind, symbol.name, symbol.line
                ));
            }
        }
        Ok(ToolRun::ok(listing))
    }
}

/// Source of one function instead of its whole file. Arguments: `path`, `name`.
pub struct ReadFunction;

impl Tool for ReadFunction {
    fn name(&self) -> &str {
        "read_function"
    }

    fn description(&self) -> &str {
        "Read the source of a single function from a file. Args: {\"path\": str, \"name\": str}"
    }

    fn access(&self, arguments: &Value, ctx: &ToolContext) -> Result<Vec<Access>> {
        Ok(vec![Access::Read(ctx.resolve(str_arg(arguments, "path")?))])
    }

    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun> {
        let path = ctx.resolve(str_arg(arguments, "path")?);
        let name = str_arg(arguments, "name")?;
        let source =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let body = function_source(&source, name)
            .ok_or_else(|| anyhow!("function `{name}` not found in {}", path.display()))?;
        Ok(ToolRun::ok(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancelToken;
    use crate::io::gateway::SandboxPolicy;
    use serde_json::json;

    fn context(root: &std::path::Path) -> ToolContext {
        ToolContext {
            workdir: root.to_path_buf(),
            policy: SandboxPolicy {
                allowed_roots: vec![root.to_path_buf()],
                allow_network: false,
                timeout: Duration::from_secs(10),
                max_output_bytes: 10_000,
                max_file_bytes: 1_000,
            },
            timeout: Duration::from_secs(10),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn file_tools_round_trip_inside_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());

        WriteFile
            .run(&json!({"path": "src/notes.txt", "content": "one\n"}), &ctx)
            .expect("write");
        AppendFile
            .run(&json!({"path": "src/notes.txt", "content": "two\n"}), &ctx)
            .expect("append");
        let read = ReadFile
            .run(&json!({"path": "src/notes.txt"}), &ctx)
            .expect("read");
        assert_eq!(read.stdout, "one\ntwo\n");

        let listing = ListDir.run(&json!({}), &ctx).expect("list");
        assert_eq!(listing.stdout, "src/");
    }

    #[test]
    fn append_declares_resulting_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        fs::write(temp.path().join("log.txt"), "x".repeat(900)).expect("seed");
        let access = AppendFile
            .access(&json!({"path": "log.txt", "content": "y".repeat(200)}), &ctx)
            .expect("access");
        assert_eq!(
            access,
            vec![Access::Write {
                path: temp.path().join("log.txt"),
                bytes: 1_100
            }]
        );
        assert!(ctx.policy.permits(&access[0]).is_err());
    }

    #[test]
    fn run_command_reports_exit_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let run = RunCommand
            .run(&json!({"command": "echo hi; exit 2"}), &ctx)
            .expect("run");
        assert!(!run.success);
        assert_eq!(run.exit_code, Some(2));
        assert_eq!(run.stdout, "hi\n");
    }

    #[test]
    fn run_command_declares_network_programs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let access = RunCommand
            .access(&json!({"command": "cargo build && curl -s https://x"}), &ctx)
            .expect("access");
        assert!(access.contains(&Access::Network("curl".to_string())));
        let local = RunCommand
            .access(&json!({"command": "cargo test --package curlish"}), &ctx)
            .expect("access");
        assert_eq!(local.len(), 1);
    }

    #[test]
    fn missing_arguments_are_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        assert!(WriteFile.access(&json!({"path": "a"}), &ctx).is_err());
        assert!(RunCommand.access(&json!({}), &ctx).is_err());
    }

    #[test]
    fn list_symbols_summarizes_matching_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(
            temp.path().join("src/retry.rs"),
            "pub struct Policy;\n\nfn delay(n: u32) -> u32 {\n    n * 2\n}\n",
        )
        .expect("seed");
        fs::write(temp.path().join("src/notes.md"), "fn not_code() {}\n").expect("seed");

        let run = ListSymbols
            .run(&json!({"path": "src", "extension": ".rs"}), &ctx)
            .expect("list");
        assert_eq!(
            run.stdout,
            "src/retry.rs\n  struct Policy (line 1)\n  fn delay (line 3)\n"
        );

        let single = ListSymbols
            .run(&json!({"path": "src/notes.md"}), &ctx)
            .expect("list");
        assert!(single.stdout.contains("fn not_code (line 1)"));
    }

    #[test]
    fn read_function_returns_only_that_function() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        fs::write(
            temp.path().join("client.py"),
            "import os\n\ndef fetch(url):\n    return os.path.join(url)\n\ndef close():\n    pass\n",
        )
        .expect("seed");

        let run = ReadFunction
            .run(&json!({"path": "client.py", "name": "fetch"}), &ctx)
            .expect("read");
        assert_eq!(run.stdout, "def fetch(url):\n    return os.path.join(url)");

        let err = ReadFunction
            .run(&json!({"path": "client.py", "name": "open"}), &ctx)
            .unwrap_err();
        assert!(err.to_string().contains("`open` not found"));
    }

    #[test]
    fn targeted_reads_declare_read_access() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let access = ReadFunction
            .access(&json!({"path": "../outside.rs", "name": "main"}), &ctx)
            .expect("access");
        assert!(ctx.policy.permits(&access[0]).is_err());
        assert!(ListSymbols.access(&json!({}), &ctx).is_err());
    }
}
