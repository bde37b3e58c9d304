//! Command runner: executes one external command in a working copy.
//!
//! The runner holds no shared mutable state; any number of synchronizers may
//! call it concurrently. Every failure comes back as a [`CommandError`].

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::CommandError;

/// Seam between the engine and the operating system's process table.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` (program followed by its arguments) in `working_dir`.
    ///
    /// Returns trimmed stdout when the process exits with status 0.
    async fn run(
        &self,
        command: &[String],
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<String, CommandError>;
}

/// Production runner backed by `tokio::process`.
///
/// Children are spawned with `kill_on_drop`, so a timed-out invocation is
/// killed as soon as its wait future is dropped.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    envs: Vec<(String, String)>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment variable to every spawned command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &[String],
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        let Some((program, args)) = command.split_first() else {
            return Err(CommandError::SpawnFailure {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        tracing::debug!(
            program = %program,
            args = ?args,
            dir = %working_dir.display(),
            "running command",
        );

        let child = cmd.spawn().map_err(|source| CommandError::SpawnFailure {
            program: program.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(CommandError::SpawnFailure {
                    program: program.clone(),
                    source,
                })
            }
            Err(_) => {
                tracing::warn!(
                    program = %program,
                    dir = %working_dir.display(),
                    timeout_secs = timeout.as_secs_f64(),
                    "command timed out; child killed",
                );
                return Err(CommandError::Timeout {
                    program: program.clone(),
                    timeout,
                });
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(CommandError::ExitFailure {
                program: program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn success_returns_trimmed_stdout() {
        let dir = TempDir::new().expect("dir");
        let out = ProcessRunner::new()
            .run(&sh("printf '  hello\\n\\n'"), dir.path(), Duration::from_secs(5))
            .await
            .expect("run");
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = TempDir::new().expect("dir");
        std::fs::write(dir.path().join("marker.txt"), "x").expect("write");
        let out = ProcessRunner::new()
            .run(&sh("ls"), dir.path(), Duration::from_secs(5))
            .await
            .expect("run");
        assert!(out.contains("marker.txt"));
    }

    #[tokio::test]
    async fn non_zero_exit_captures_stderr_and_code() {
        let dir = TempDir::new().expect("dir");
        let err = ProcessRunner::new()
            .run(&sh("echo boom >&2; exit 3"), dir.path(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            CommandError::ExitFailure { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected exit failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let dir = TempDir::new().expect("dir");
        let command = vec!["reposync-definitely-not-a-binary".to_string()];
        let err = ProcessRunner::new()
            .run(&command, dir.path(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::SpawnFailure { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn empty_command_is_spawn_failure() {
        let dir = TempDir::new().expect("dir");
        let err = ProcessRunner::new()
            .run(&[], dir.path(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::SpawnFailure { .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = TempDir::new().expect("dir");
        let started = std::time::Instant::now();
        let err = ProcessRunner::new()
            .run(&sh("sleep 10"), dir.path(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn configured_env_reaches_child() {
        let dir = TempDir::new().expect("dir");
        let out = ProcessRunner::new()
            .with_env("REPOSYNC_TEST_VAR", "present")
            .run(&sh("echo $REPOSYNC_TEST_VAR"), dir.path(), Duration::from_secs(5))
            .await
            .expect("run");
        assert_eq!(out, "present");
    }
}
