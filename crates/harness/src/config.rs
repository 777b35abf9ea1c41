//! Harness configuration.
//!
//! Two layers, both read from the process environment with `envy`:
//! - [`TestEnv`]: credentials handed to the database container and used by
//!   the checks (`POSTGRES_*` plus one password per interactive role).
//! - [`HarnessConfig`]: paths and timeouts, prefixed with `KIVOLL_`.
//!
//! [`TestEnv::load`] reads a `.env.test` file with `dotenvy` without touching
//! the process environment. Values already set in the environment win over
//! the file. A project's `.env` is never read.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};
use crate::roles::Role;

/// Port PostgreSQL listens on inside the container.
pub const POSTGRES_PORT: u16 = 5432;

/// Key/value pairs of `path`, or none if it does not exist.
fn read_env_file(path: &Path) -> HarnessResult<Vec<(String, String)>> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No env file, using process environment");
        return Ok(Vec::new());
    }
    let invalid = |e: dotenvy::Error| {
        HarnessError::Configuration(format!("Failed to load {}: {}", path.display(), e))
    };
    let pairs = dotenvy::from_path_iter(path)
        .map_err(invalid)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid)?;
    tracing::debug!(path = %path.display(), vars = pairs.len(), "Loaded env file");
    Ok(pairs)
}

/// Login credential for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// Credentials shared by the database container and the checks.
///
/// Admin settings fall back to `testadmin` / `testadminpass` / `postgres`.
/// Role passwords have no fallback: a missing password only fails the
/// checks that log in as that role.
#[derive(Debug, Clone, Deserialize)]
pub struct TestEnv {
    #[serde(default = "default_postgres_user")]
    pub postgres_user: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_postgres_db")]
    pub postgres_db: String,

    #[serde(default)]
    pub worker_app_password: Option<String>,

    #[serde(default)]
    pub worker_migrator_password: Option<String>,

    #[serde(default)]
    pub api_app_password: Option<String>,

    #[serde(default)]
    pub api_migrator_password: Option<String>,

    #[serde(default)]
    pub predict_app_password: Option<String>,

    #[serde(default)]
    pub predict_migrator_password: Option<String>,

    #[serde(default)]
    pub scheduler_db_password: Option<String>,
}

fn default_postgres_user() -> String {
    "testadmin".to_string()
}

fn default_postgres_password() -> String {
    "testadminpass".to_string()
}

fn default_postgres_db() -> String {
    "postgres".to_string()
}

impl TestEnv {
    /// Load from `env_file` overlaid with the process environment.
    pub fn load(env_file: &Path) -> HarnessResult<Self> {
        Self::load_with(env_file, std::env::vars())
    }

    fn load_with<I>(env_file: &Path, process: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars: HashMap<String, String> = read_env_file(env_file)?.into_iter().collect();
        vars.extend(process);
        Self::from_pairs(vars)
    }

    /// Load from explicit key/value pairs.
    pub fn from_pairs<I>(pairs: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::from_iter::<_, TestEnv>(pairs)?)
    }

    /// Environment passed to the database container. Unset and empty values are left out.
    pub fn container_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("POSTGRES_USER".to_string(), self.postgres_user.clone()),
            ("POSTGRES_PASSWORD".to_string(), self.postgres_password.clone()),
            ("POSTGRES_DB".to_string(), self.postgres_db.clone()),
        ];

        for role in Role::ALL {
            if let (Some(var), Some(password)) = (role.password_var(), self.password_for(role)) {
                env.push((var.to_string(), password.to_string()));
            }
        }

        env.retain(|(_, value)| !value.is_empty());
        env
    }

    /// Superuser credential created by the image entrypoint.
    pub fn admin(&self) -> Credential {
        Credential::new(&self.postgres_user, &self.postgres_password)
    }

    /// Configured password for `role`, if any.
    pub fn password_for(&self, role: Role) -> Option<&str> {
        let password = match role {
            Role::WorkerApp => &self.worker_app_password,
            Role::WorkerMigrator => &self.worker_migrator_password,
            Role::ApiApp => &self.api_app_password,
            Role::ApiMigrator => &self.api_migrator_password,
            Role::PredictApp => &self.predict_app_password,
            Role::PredictMigrator => &self.predict_migrator_password,
            Role::Scheduler => &self.scheduler_db_password,
            Role::WorkerOwner | Role::ApiOwner | Role::PredictOwner => &None,
        };
        password.as_deref().filter(|p| !p.is_empty())
    }

    /// Credential for an interactive role.
    pub fn credential(&self, role: Role) -> HarnessResult<Credential> {
        if !role.can_login() {
            return Err(HarnessError::Configuration(format!(
                "Role {} is NOLOGIN and has no credential",
                role
            )));
        }
        let password = self.password_for(role).ok_or_else(|| {
            HarnessError::Configuration(format!(
                "No password configured for {} (set {})",
                role,
                role.password_var().unwrap_or("?")
            ))
        })?;
        Ok(Credential::new(role.name(), password))
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self {
            postgres_user: default_postgres_user(),
            postgres_password: default_postgres_password(),
            postgres_db: default_postgres_db(),
            worker_app_password: None,
            worker_migrator_password: None,
            api_app_password: None,
            api_migrator_password: None,
            predict_app_password: None,
            predict_migrator_password: None,
            scheduler_db_password: None,
        }
    }
}

/// Paths and timeouts, loaded from `KIVOLL_`-prefixed variables.
#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    /// Project checkout being verified.
    #[serde(default = "default_project_root")]
    pub project_root: String,

    /// Docker build context of the database image, relative to the root.
    #[serde(default = "default_db_context")]
    pub db_context: String,

    /// Compose manifest, relative to the root.
    #[serde(default = "default_compose_file")]
    pub compose_file: String,

    /// Repository name for locally built test images.
    #[serde(default = "default_test_image")]
    pub test_image: String,

    /// Substring the compose `db` image must contain.
    #[serde(default = "default_image_marker")]
    pub image_marker: String,

    /// Address published container ports are reachable on.
    #[serde(default = "default_container_host")]
    pub container_host: String,

    /// Readiness deadline in seconds.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Delay between readiness attempts in milliseconds.
    #[serde(default = "default_ready_interval")]
    pub ready_interval_ms: u64,

    /// Connect timeout for each database connection in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// `docker compose up --wait-timeout` in seconds.
    #[serde(default = "default_compose_wait")]
    pub compose_wait_secs: u64,

    /// Keep the built image after the run.
    #[serde(default)]
    pub keep_image: bool,
}

fn default_project_root() -> String {
    ".".to_string()
}

fn default_db_context() -> String {
    "db".to_string()
}

fn default_compose_file() -> String {
    "docker-compose.yml".to_string()
}

fn default_test_image() -> String {
    "kivoll-db-test".to_string()
}

fn default_image_marker() -> String {
    "kivoll_db".to_string()
}

fn default_container_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ready_timeout() -> u64 {
    60
}

fn default_ready_interval() -> u64 {
    1000
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_compose_wait() -> u64 {
    180
}

impl HarnessConfig {
    /// Load configuration from environment variables prefixed with `KIVOLL_`.
    pub fn from_env() -> HarnessResult<Self> {
        Ok(envy::prefixed("KIVOLL_").from_env::<HarnessConfig>()?)
    }

    pub fn root(&self) -> PathBuf {
        PathBuf::from(&self.project_root)
    }

    pub fn db_context_path(&self) -> PathBuf {
        self.root().join(&self.db_context)
    }

    pub fn compose_path(&self) -> PathBuf {
        self.root().join(&self.compose_file)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn compose_wait(&self) -> Duration {
        Duration::from_secs(self.compose_wait_secs)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            db_context: default_db_context(),
            compose_file: default_compose_file(),
            test_image: default_test_image(),
            image_marker: default_image_marker(),
            container_host: default_container_host(),
            ready_timeout_secs: default_ready_timeout(),
            ready_interval_ms: default_ready_interval(),
            connect_timeout_secs: default_connect_timeout(),
            compose_wait_secs: default_compose_wait(),
            keep_image: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_fallbacks() {
        let env = TestEnv::from_pairs(Vec::new()).unwrap();
        assert_eq!(env.postgres_user, "testadmin");
        assert_eq!(env.postgres_password, "testadminpass");
        assert_eq!(env.postgres_db, "postgres");
        assert!(env.worker_app_password.is_none());
    }

    #[test]
    fn test_env_reads_role_passwords() {
        let env = TestEnv::from_pairs(pairs(&[
            ("POSTGRES_USER", "admin"),
            ("WORKER_APP_PASSWORD", "w-app"),
            ("SCHEDULER_DB_PASSWORD", "sched"),
        ]))
        .unwrap();

        assert_eq!(env.admin(), Credential::new("admin", "testadminpass"));
        assert_eq!(
            env.credential(Role::WorkerApp).unwrap(),
            Credential::new("worker_app", "w-app")
        );
        assert_eq!(env.credential(Role::Scheduler).unwrap().password, "sched");
    }

    #[test]
    fn test_missing_password_is_configuration_error() {
        let env = TestEnv::default();
        let err = env.credential(Role::ApiMigrator).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
        assert!(err.to_string().contains("API_MIGRATOR_PASSWORD"));

        let err = env.credential(Role::ApiOwner).unwrap_err();
        assert!(err.to_string().contains("NOLOGIN"));
    }

    #[test]
    fn test_container_env_skips_unset_values() {
        let env = TestEnv::from_pairs(pairs(&[
            ("API_APP_PASSWORD", "a"),
            ("PREDICT_APP_PASSWORD", ""),
        ]))
        .unwrap();

        let container_env = env.container_env();
        let keys: Vec<&str> = container_env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["POSTGRES_USER", "POSTGRES_PASSWORD", "POSTGRES_DB", "API_APP_PASSWORD"]
        );
    }

    #[test]
    fn test_harness_config_default() {
        let config = HarnessConfig::default();
        assert_eq!(config.db_context_path(), PathBuf::from("./db"));
        assert_eq!(config.compose_path(), PathBuf::from("./docker-compose.yml"));
        assert_eq!(config.ready_timeout(), Duration::from_secs(60));
        assert_eq!(config.ready_interval(), Duration::from_secs(1));
        assert_eq!(config.image_marker, "kivoll_db");
    }

    #[test]
    fn test_load_missing_env_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_env_file(&dir.path().join(".env.test")).unwrap().is_empty());

        let env = TestEnv::load_with(&dir.path().join(".env.test"), Vec::new()).unwrap();
        assert_eq!(env.postgres_password, "testadminpass");
    }

    #[test]
    fn test_env_test_file_is_not_shadowed_by_dot_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "POSTGRES_PASSWORD=prod-secret\nAPI_APP_PASSWORD=prod-api\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join(".env.test"),
            "POSTGRES_PASSWORD=testadminpass\nAPI_APP_PASSWORD=test-api\n",
        )
        .unwrap();

        let env = TestEnv::load_with(&dir.path().join(".env.test"), Vec::new()).unwrap();
        assert_eq!(env.admin().password, "testadminpass");
        assert_eq!(env.credential(Role::ApiApp).unwrap().password, "test-api");

        // An explicitly exported variable still wins over the file
        let env = TestEnv::load_with(
            &dir.path().join(".env.test"),
            pairs(&[("API_APP_PASSWORD", "from-ci")]),
        )
        .unwrap();
        assert_eq!(env.credential(Role::ApiApp).unwrap().password, "from-ci");
        assert_eq!(env.admin().password, "testadminpass");
    }
}
