//! Readiness polling.
//!
//! Fixed-interval retries against a hard deadline. A probe has to speak the
//! real protocol: PostgreSQL accepts TCP connections while the entrypoint is
//! still running init scripts, so only a completed query counts as ready.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_postgres::NoTls;

use crate::config::Credential;
use crate::db::Endpoint;
use crate::error::{HarnessError, HarnessResult};

/// One readiness attempt.
#[async_trait]
pub trait Probe: Send + Sync {
    /// What is being waited on, for logs and timeout errors.
    fn target(&self) -> String;

    /// Attempt once. `Ok` means the dependency is usable.
    async fn probe(&self) -> HarnessResult<()>;
}

/// Polls a [`Probe`] until it succeeds or the deadline passes.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    timeout: Duration,
    interval: Duration,
}

impl Poller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Returns the number of attempts on success, or
    /// [`HarnessError::Timeout`] with the last probe error.
    ///
    /// At least one attempt is always made, and one final attempt is made at
    /// the deadline, so the call returns within `timeout` plus one probe.
    pub async fn wait<P>(&self, probe: &P) -> HarnessResult<u32>
    where
        P: Probe + ?Sized,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts = 0u32;
        let mut last_error = String::from("no attempt made");

        loop {
            attempts += 1;
            match probe.probe().await {
                Ok(()) => {
                    tracing::debug!(
                        target = %probe.target(),
                        attempts,
                        elapsed = ?start.elapsed(),
                        "Dependency ready"
                    );
                    return Ok(attempts);
                }
                Err(e) => {
                    tracing::debug!(target = %probe.target(), attempts, error = %e, "Not ready yet");
                    last_error = e.to_string();
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.interval.min(deadline - now)).await;
        }

        Err(HarnessError::Timeout {
            what: probe.target(),
            waited: start.elapsed(),
            attempts,
            last_error,
        })
    }
}

/// Connects and runs `SELECT 1`.
#[derive(Debug, Clone)]
pub struct PostgresProbe {
    endpoint: Endpoint,
    credential: Credential,
    database: String,
    connect_timeout: Duration,
}

impl PostgresProbe {
    pub fn new(
        endpoint: Endpoint,
        credential: Credential,
        database: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            credential,
            database: database.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Probe for PostgresProbe {
    fn target(&self) -> String {
        format!("postgres at {}/{}", self.endpoint, self.database)
    }

    async fn probe(&self) -> HarnessResult<()> {
        let (client, connection) = self
            .endpoint
            .config(&self.credential, &self.database, self.connect_timeout)
            .connect(NoTls)
            .await?;
        let handle = tokio::spawn(async move {
            let _ = connection.await;
        });

        let result = tokio::time::timeout(self.connect_timeout, client.simple_query("SELECT 1;"))
            .await
            .map_err(|_| HarnessError::Check("SELECT 1 did not answer in time".to_string()))
            .and_then(|r| r.map_err(HarnessError::from));

        drop(client);
        let _ = handle.await;
        result.map(|_| ())
    }
}
