//! Harness error types.

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while preparing or running deployment checks.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A prerequisite (image build, container start) could not be established.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// A checked invariant does not hold.
    #[error("{message}: expected {expected}, got {actual}")]
    Assertion {
        message: String,
        expected: String,
        actual: String,
    },

    /// A check failed without a single expected/actual pair.
    #[error("Check failed: {0}")]
    Check(String),

    /// A dependency never became ready.
    #[error("Timed out after {waited:?} ({attempts} attempts) waiting for {what}: {last_error}")]
    Timeout {
        what: String,
        waited: Duration,
        attempts: u32,
        last_error: String,
    },

    /// An external command exited with a non-zero code.
    #[error("`{command}` exited with code {code}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// An external command ran past its wall-clock limit and was killed.
    #[error("`{command}` timed out after {limit:?}")]
    CommandTimeout { command: String, limit: Duration },

    /// Process spawn or wait error.
    #[error("Process error: {0}")]
    Process(String),

    /// PostgreSQL client error.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Manifest parse or serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Build an assertion failure from expected and observed values.
    pub fn assertion(
        message: impl Into<String>,
        expected: impl Display,
        actual: impl Display,
    ) -> Self {
        HarnessError::Assertion {
            message: message.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Returns true when the error means a prerequisite was never established.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            HarnessError::Setup(_) | HarnessError::Timeout { .. } | HarnessError::CommandTimeout { .. }
        )
    }
}

impl From<envy::Error> for HarnessError {
    fn from(e: envy::Error) -> Self {
        HarnessError::Configuration(e.to_string())
    }
}

/// Result type alias using HarnessError.
pub type HarnessResult<T> = Result<T, HarnessError>;
