//! PostgreSQL connections scoped to a container's lifetime.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};

use crate::config::Credential;
use crate::error::HarnessResult;

/// Where a database container is reachable from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn config(
        &self,
        credential: &Credential,
        database: &str,
        connect_timeout: Duration,
    ) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&credential.user)
            .password(&credential.password)
            .dbname(database)
            .connect_timeout(connect_timeout)
            .application_name("kivoll-verify");
        config
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Open a connection that is not tracked by any registry.
///
/// The caller owns the client; the background task ends when it is dropped.
pub async fn connect_once(
    endpoint: &Endpoint,
    credential: &Credential,
    database: &str,
    connect_timeout: Duration,
) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = endpoint
        .config(credential, database, connect_timeout)
        .connect(NoTls)
        .await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Connection closed with error");
        }
    });
    Ok(client)
}

struct Registered {
    label: String,
    client: Arc<Client>,
    task: JoinHandle<()>,
}

/// Opens connections and keeps track of them until [`ConnectionFactory::close_all`].
///
/// Teardown closes every registered connection before the container goes
/// away, whatever the checks that used them returned.
pub struct ConnectionFactory {
    endpoint: Endpoint,
    connect_timeout: Duration,
    connections: Vec<Registered>,
}

impl ConnectionFactory {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
            connections: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Connect as `credential` to `database` and register the connection.
    pub async fn connect(
        &mut self,
        credential: &Credential,
        database: &str,
    ) -> HarnessResult<Arc<Client>> {
        let (client, connection) = self
            .endpoint
            .config(credential, database, self.connect_timeout)
            .connect(NoTls)
            .await?;

        let label = format!("{}@{}", credential.user, database);
        let task_label = label.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(connection = %task_label, error = %e, "Connection closed with error");
            }
        });

        tracing::debug!(connection = %label, endpoint = %self.endpoint, "Connected");

        let client = Arc::new(client);
        self.connections.push(Registered {
            label,
            client: Arc::clone(&client),
            task,
        });
        Ok(client)
    }

    /// Close every registered connection.
    ///
    /// Clients still held elsewhere become unusable afterwards.
    pub async fn close_all(&mut self) {
        for registered in self.connections.drain(..) {
            let Registered {
                label,
                client,
                task,
            } = registered;
            drop(client);
            task.abort();
            let _ = task.await;
            tracing::debug!(connection = %label, "Connection closed");
        }
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        for registered in &self.connections {
            registered.task.abort();
        }
    }
}
