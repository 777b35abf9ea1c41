//! External command execution.
//!
//! Every call to the container runtime goes through [`run`]: output is
//! captured, the exit code is the success signal, and an optional
//! wall-clock limit kills the child when exceeded.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{HarnessError, HarnessResult};

/// A command line to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Human readable command line, used in logs and errors.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`HarnessError::CommandFailed`].
    pub fn ensure_success(self) -> HarnessResult<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(HarnessError::CommandFailed {
            command: self.command,
            code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Run a command to completion, capturing stdout and stderr.
///
/// A non-zero exit is not an error here; callers decide with
/// [`CommandOutput::ensure_success`].
pub async fn run(spec: &CommandSpec) -> HarnessResult<CommandOutput> {
    let start = Instant::now();
    let cmd_display = spec.display();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    tracing::debug!(command = %cmd_display, cwd = ?spec.cwd, timeout = ?spec.timeout, "Running command");

    let mut child = cmd
        .spawn()
        .map_err(|e| HarnessError::Process(format!("Failed to spawn `{}`: {}", cmd_display, e)))?;

    // Drain both pipes concurrently so a chatty child never blocks on a full pipe
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stdout) = stdout {
            let _ = stdout.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let stderr_handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let wait_result = if let Some(limit) = spec.timeout {
        match timeout(limit, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                let _ = child.kill().await;
                stdout_handle.abort();
                stderr_handle.abort();
                tracing::warn!(command = %cmd_display, limit = ?limit, "Command timed out, killed");
                return Err(HarnessError::CommandTimeout { command: cmd_display, limit });
            }
        }
    } else {
        child.wait().await
    };

    let status = wait_result
        .map_err(|e| HarnessError::Process(format!("Failed to wait for `{}`: {}", cmd_display, e)))?;

    let exit_code = status.code().unwrap_or(-1);
    let stdout = stdout_handle.await.unwrap_or_default();
    let stderr = stderr_handle.await.unwrap_or_default();
    let duration_ms = start.elapsed().as_millis() as u64;

    tracing::debug!(command = %cmd_display, exit_code, duration_ms, "Command finished");

    Ok(CommandOutput {
        command: cmd_display,
        exit_code,
        stdout,
        stderr,
        duration_ms,
    })
}

/// Run a command and require exit code 0.
pub async fn run_checked(spec: &CommandSpec) -> HarnessResult<CommandOutput> {
    run(spec).await?.ensure_success()
}

/// Best-effort run for cleanup paths. Failures are logged and dropped.
pub async fn run_quiet(spec: &CommandSpec) -> Option<CommandOutput> {
    match run(spec).await {
        Ok(output) => {
            if !output.success() {
                tracing::debug!(
                    command = %output.command,
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Cleanup command failed"
                );
            }
            Some(output)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Cleanup command could not run");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_run_echo() {
        let output = run(&sh("echo 'hello world'")).await.unwrap();
        assert!(output.success());
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn test_run_exit_code() {
        let output = run(&sh("exit 42")).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 42);

        let err = output.ensure_success().unwrap_err();
        assert!(matches!(err, HarnessError::CommandFailed { code: 42, .. }));
    }

    #[tokio::test]
    async fn test_run_captures_stderr() {
        let output = run(&sh("echo out; echo 'error' >&2")).await.unwrap();
        assert!(output.success());
        assert!(output.stderr.contains("error"));
        assert_eq!(output.combined(), "out\nerror\n");
    }

    #[tokio::test]
    async fn test_run_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo $MY_VAR; pwd")
            .env("MY_VAR", "my_value")
            .current_dir(dir.path());

        let output = run(&spec).await.unwrap();
        assert!(output.stdout.contains("my_value"));
        let name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(output.stdout.contains(&name));
    }

    #[tokio::test]
    async fn test_run_timeout_kills_child() {
        let spec = sh("sleep 10").timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = run(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::CommandTimeout { limit, .. } if limit == Duration::from_millis(100)
        ));
        // Sub-second limits keep their precision in the message
        assert!(err.to_string().ends_with("timed out after 100ms"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-kivoll");
        let err = run(&spec).await.unwrap_err();
        assert!(matches!(err, HarnessError::Process(_)));
        assert!(run_quiet(&spec).await.is_none());
    }

    #[test]
    fn test_display() {
        let spec = CommandSpec::new("docker").args(["compose", "-f", "a.yml", "config"]);
        assert_eq!(spec.display(), "docker compose -f a.yml config");
    }
}
