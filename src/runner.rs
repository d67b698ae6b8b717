//! Command Runner — locates and executes external privileged tools.
//!
//! Mirrors `traffictoll.utils.run`: splits the command line using POSIX
//! shell-word rules, resolves the head word through a cached path lookup,
//! and never interposes a shell. Failures to resolve the executable surface
//! as `ShaperError::MissingDependency`; nonzero exit codes are returned to
//! the caller rather than raised, since callers (the TC Driver in
//! particular) routinely inspect `tc`'s output even on failure.

use crate::error::ShaperError;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

/// Result of running a command: captured stdout (if requested) and exit status.
pub struct RunOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub struct Runner {
    path_cache: Mutex<HashMap<String, PathBuf>>,
}

impl Runner {
    pub fn new() -> Self {
        Self {
            path_cache: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, binary: &str) -> Result<PathBuf> {
        let mut cache = self.path_cache.lock().unwrap();
        if let Some(path) = cache.get(binary) {
            return Ok(path.clone());
        }

        let path = which::which(binary).map_err(|_| ShaperError::MissingDependency {
            hint: format!(
                "'{binary}' was not found on PATH; install it and make sure it is executable"
            ),
        })?;

        cache.insert(binary.to_string(), path.clone());
        Ok(path)
    }

    /// Run a command line, splitting it with POSIX shell-word rules.
    /// No shell is spawned. Does not raise on a nonzero exit.
    pub fn run(&self, command_line: &str, capture_stdout: bool) -> Result<RunOutput> {
        let words = shell_words::split(command_line)
            .with_context(|| format!("failed to tokenize command line: {command_line:?}"))?;
        let (head, rest) = words
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty command line"))?;

        let path = self.resolve(head)?;
        log::debug!("{}", command_line);

        let mut cmd = Command::new(&path);
        cmd.args(rest);
        if capture_stdout {
            cmd.stdout(std::process::Stdio::piped());
        } else {
            cmd.stdout(std::process::Stdio::null());
        }
        cmd.stderr(std::process::Stdio::piped());

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn {command_line:?}"))?;

        let stdout = if capture_stdout {
            String::from_utf8_lossy(&output.stdout).into_owned()
        } else {
            String::new()
        };

        Ok(RunOutput {
            exit_code: output.status.code(),
            stdout,
        })
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_and_runs_true() {
        let runner = Runner::new();
        let out = runner.run("true", false).unwrap();
        assert!(out.success());
    }

    #[test]
    fn missing_binary_is_missing_dependency() {
        let runner = Runner::new();
        let err = runner.run("definitely-not-a-real-binary-xyz", false);
        assert!(err.is_err());
    }

    #[test]
    fn captures_stdout() {
        let runner = Runner::new();
        let out = runner.run("echo hello", true).unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }
}
