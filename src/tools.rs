use crate::error::{PipelineError, Result};
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::Path,
    process::{Command, Output},
    sync::{LazyLock, RwLock},
};

pub const BLASTN_ENV_BIN: &str = "SPECPRIMER_BLASTN_BIN";
pub const DEFAULT_BLASTN_BIN: &str = "blastn";
pub const BLASTDBCMD_ENV_BIN: &str = "SPECPRIMER_BLASTDBCMD_BIN";
pub const DEFAULT_BLASTDBCMD_BIN: &str = "blastdbcmd";

static TOOL_OVERRIDES: LazyLock<RwLock<HashMap<String, String>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn normalized_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Pin an executable for `env_var` for the rest of the process, or clear the
/// pin with an empty value.
pub fn set_tool_override(env_var: &str, configured: &str) {
    let mut guard = match TOOL_OVERRIDES.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match normalized_non_empty(configured) {
        Some(value) => {
            guard.insert(env_var.to_string(), value);
        }
        None => {
            guard.remove(env_var);
        }
    }
}

fn get_tool_override(env_var: &str) -> Option<String> {
    let guard = match TOOL_OVERRIDES.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.get(env_var).cloned()
}

/// Override, then environment, then the PATH name.
pub fn resolve_tool_executable(env_var: &str, default_bin: &str) -> String {
    get_tool_override(env_var)
        .or_else(|| {
            std::env::var(env_var)
                .ok()
                .and_then(|v| normalized_non_empty(&v))
        })
        .unwrap_or_else(|| default_bin.to_string())
}

pub fn blastn_executable() -> String {
    resolve_tool_executable(BLASTN_ENV_BIN, DEFAULT_BLASTN_BIN)
}

pub fn blastdbcmd_executable() -> String {
    resolve_tool_executable(BLASTDBCMD_ENV_BIN, DEFAULT_BLASTDBCMD_BIN)
}

/// Run `executable` to completion. A missing binary becomes
/// [`PipelineError::ToolNotFound`] naming the override variable.
pub fn run_tool(executable: &str, args: &[String], env_var: &str) -> Result<Output> {
    Command::new(executable).args(args).output().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            PipelineError::ToolNotFound {
                executable: executable.to_string(),
                env_var: env_var.to_string(),
            }
        } else {
            PipelineError::io(
                format!(
                    "Could not run '{}' with args [{}]",
                    executable,
                    args.join(" ")
                ),
                e,
            )
        }
    })
}

/// Map a finished process to an error. No exit code means the process was
/// killed by a signal, which counts as an interruption of `operation`.
pub fn check_status(
    executable: &str,
    output: &Output,
    operation: &str,
    partial_output: &Path,
) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    match output.status.code() {
        None => Err(PipelineError::Interrupted {
            operation: operation.to_string(),
            path: partial_output.display().to_string(),
        }),
        Some(code) => Err(PipelineError::ToolFailed {
            executable: executable.to_string(),
            status: Some(code),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
    }
}
