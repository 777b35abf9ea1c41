//! Role model and catalog assertions.
//!
//! The init scripts create one database per service, a NOLOGIN owner role
//! per service, and interactive app/migrator roles that reach the owner's
//! privileges through membership. Checks here read `pg_database`,
//! `pg_roles` and `pg_auth_members` as the admin and compare against
//! [`Topology::kivoll`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tokio_postgres::Client;

use crate::config::TestEnv;
use crate::db::{connect_once, Endpoint};
use crate::error::{HarnessError, HarnessResult};

/// Database roles created by the init scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    WorkerOwner,
    WorkerApp,
    WorkerMigrator,
    ApiOwner,
    ApiApp,
    ApiMigrator,
    PredictOwner,
    PredictApp,
    PredictMigrator,
    Scheduler,
}

impl Role {
    pub const ALL: [Role; 10] = [
        Role::WorkerOwner,
        Role::WorkerApp,
        Role::WorkerMigrator,
        Role::ApiOwner,
        Role::ApiApp,
        Role::ApiMigrator,
        Role::PredictOwner,
        Role::PredictApp,
        Role::PredictMigrator,
        Role::Scheduler,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Role::WorkerOwner => "worker_owner",
            Role::WorkerApp => "worker_app",
            Role::WorkerMigrator => "worker_migrator",
            Role::ApiOwner => "api_owner",
            Role::ApiApp => "api_app",
            Role::ApiMigrator => "api_migrator",
            Role::PredictOwner => "predict_owner",
            Role::PredictApp => "predict_app",
            Role::PredictMigrator => "predict_migrator",
            Role::Scheduler => "scheduler",
        }
    }

    /// Owner roles only hold ownership and are never logged into.
    pub fn can_login(&self) -> bool {
        !matches!(self, Role::WorkerOwner | Role::ApiOwner | Role::PredictOwner)
    }

    /// Environment variable holding this role's password.
    pub fn password_var(&self) -> Option<&'static str> {
        match self {
            Role::WorkerApp => Some("WORKER_APP_PASSWORD"),
            Role::WorkerMigrator => Some("WORKER_MIGRATOR_PASSWORD"),
            Role::ApiApp => Some("API_APP_PASSWORD"),
            Role::ApiMigrator => Some("API_MIGRATOR_PASSWORD"),
            Role::PredictApp => Some("PREDICT_APP_PASSWORD"),
            Role::PredictMigrator => Some("PREDICT_MIGRATOR_PASSWORD"),
            Role::Scheduler => Some("SCHEDULER_DB_PASSWORD"),
            Role::WorkerOwner | Role::ApiOwner | Role::PredictOwner => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Expected databases, roles, ownership and memberships.
#[derive(Debug, Clone)]
pub struct Topology {
    pub databases: Vec<&'static str>,
    pub roles: Vec<Role>,
    pub owners: BTreeMap<&'static str, Role>,
    pub memberships: Vec<(Role, Role)>,
}

impl Topology {
    pub fn kivoll() -> Self {
        Self {
            databases: vec![
                "worker_db",
                "scheduler_db",
                "jobs_db",
                "predictions_db",
                "userdata_db",
            ],
            roles: Role::ALL.to_vec(),
            owners: BTreeMap::from([
                ("worker_db", Role::WorkerOwner),
                ("scheduler_db", Role::Scheduler),
                ("jobs_db", Role::ApiOwner),
                ("userdata_db", Role::ApiOwner),
                ("predictions_db", Role::PredictOwner),
            ]),
            memberships: vec![
                (Role::WorkerMigrator, Role::WorkerOwner),
                (Role::ApiMigrator, Role::ApiOwner),
                (Role::PredictMigrator, Role::PredictOwner),
            ],
        }
    }

    pub fn login_roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.roles.iter().copied().filter(Role::can_login)
    }

    pub fn nologin_roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.roles.iter().copied().filter(|r| !r.can_login())
    }
}

/// Items of `expected` not present in `actual`.
pub fn missing<'a, I>(expected: I, actual: &BTreeSet<String>) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    expected
        .into_iter()
        .filter(|name| !actual.contains(*name))
        .map(str::to_string)
        .collect()
}

fn format_set(set: &BTreeSet<String>) -> String {
    let items: Vec<&str> = set.iter().map(String::as_str).collect();
    format!("{{{}}}", items.join(", "))
}

fn require_subset<'a, I>(what: &str, expected: I, actual: &BTreeSet<String>) -> HarnessResult<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let missing = missing(expected, actual);
    if missing.is_empty() {
        return Ok(());
    }
    Err(HarnessError::assertion(
        format!("Missing {}", what),
        "none missing",
        format_set(&missing),
    ))
}

/// All expected databases exist among non-template databases.
pub async fn check_databases_exist(admin: &Client, topology: &Topology) -> HarnessResult<()> {
    let rows = admin
        .query("SELECT datname FROM pg_database WHERE datistemplate = false", &[])
        .await?;
    let databases: BTreeSet<String> = rows.iter().map(|row| row.get(0)).collect();
    require_subset("databases", topology.databases.iter().copied(), &databases)
}

/// All expected roles exist.
pub async fn check_roles_exist(admin: &Client, topology: &Topology) -> HarnessResult<()> {
    let rows = admin.query("SELECT rolname FROM pg_roles", &[]).await?;
    let roles: BTreeSet<String> = rows.iter().map(|row| row.get(0)).collect();
    require_subset("roles", topology.roles.iter().map(Role::name), &roles)
}

async fn can_login(admin: &Client, role: Role) -> HarnessResult<bool> {
    let row = admin
        .query_opt(
            "SELECT rolcanlogin FROM pg_roles WHERE rolname = $1",
            &[&role.name()],
        )
        .await?
        .ok_or_else(|| HarnessError::Check(format!("Role {} does not exist", role)))?;
    Ok(row.get(0))
}

/// `rolcanlogin` matches the declared interactivity of every role.
pub async fn check_login_flags(admin: &Client, topology: &Topology) -> HarnessResult<()> {
    for role in &topology.roles {
        let actual = can_login(admin, *role).await?;
        if actual != role.can_login() {
            let describe = |login: bool| if login { "LOGIN" } else { "NOLOGIN" };
            return Err(HarnessError::assertion(
                format!("Role {} login flag", role),
                describe(role.can_login()),
                describe(actual),
            ));
        }
    }
    Ok(())
}

/// Passwords tried against NOLOGIN roles; none may get in.
fn probe_passwords(role: Role, env: &TestEnv) -> Vec<String> {
    vec![
        "anypassword".to_string(),
        role.name().to_string(),
        env.postgres_password.clone(),
    ]
}

/// NOLOGIN roles are rejected at authentication whatever the password.
///
/// Only an authentication-class SQLSTATE (28xxx) counts as rejected. A
/// refused socket or timeout fails the check instead of passing it.
pub async fn check_nologin_rejected(
    endpoint: &Endpoint,
    env: &TestEnv,
    topology: &Topology,
    connect_timeout: Duration,
) -> HarnessResult<()> {
    for role in topology.nologin_roles() {
        for password in probe_passwords(role, env) {
            let credential = crate::config::Credential::new(role.name(), password);
            match connect_once(endpoint, &credential, "postgres", connect_timeout).await {
                Ok(_client) => {
                    return Err(HarnessError::assertion(
                        format!("Authentication as NOLOGIN role {}", role),
                        "rejected",
                        "accepted",
                    ));
                }
                Err(e) if is_auth_rejection(&e) => {
                    tracing::debug!(role = %role, error = %e, "Authentication rejected");
                }
                Err(e) => {
                    return Err(HarnessError::Check(format!(
                        "Authentication as {} failed for a reason other than rejection: {}",
                        role, e
                    )));
                }
            }
        }
    }
    Ok(())
}

/// SQLSTATE class 28: invalid authorization specification.
pub fn is_auth_rejection(error: &tokio_postgres::Error) -> bool {
    error
        .code()
        .is_some_and(|code| code.code().starts_with("28"))
}

/// Every LOGIN role authenticates with its configured password.
pub async fn check_login_roles_authenticate(
    endpoint: &Endpoint,
    env: &TestEnv,
    topology: &Topology,
    connect_timeout: Duration,
) -> HarnessResult<()> {
    for role in topology.login_roles() {
        let credential = env.credential(role)?;
        let client = connect_once(endpoint, &credential, "postgres", connect_timeout)
            .await
            .map_err(|e| {
                HarnessError::assertion(
                    format!("Authentication as {}", role),
                    "accepted",
                    format!("rejected ({})", e),
                )
            })?;
        client.simple_query("SELECT 1").await?;
    }
    Ok(())
}

/// Databases are owned exactly as declared.
pub async fn check_database_owners(admin: &Client, topology: &Topology) -> HarnessResult<()> {
    for (database, expected) in &topology.owners {
        let row = admin
            .query_opt(
                "SELECT pg_catalog.pg_get_userbyid(d.datdba) AS owner \
                 FROM pg_catalog.pg_database d WHERE d.datname = $1",
                &[database],
            )
            .await?
            .ok_or_else(|| HarnessError::Check(format!("Database {} does not exist", database)))?;
        let actual: String = row.get("owner");
        if actual != expected.name() {
            return Err(HarnessError::assertion(
                format!("Database {} owner", database),
                expected,
                actual,
            ));
        }
    }
    Ok(())
}

/// Each migrator is a member of its owner role.
pub async fn check_memberships(admin: &Client, topology: &Topology) -> HarnessResult<()> {
    for (member, owner) in &topology.memberships {
        let row = admin
            .query_opt(
                "SELECT 1 FROM pg_auth_members m \
                 JOIN pg_roles member ON m.member = member.oid \
                 JOIN pg_roles owner ON m.roleid = owner.oid \
                 WHERE member.rolname = $1 AND owner.rolname = $2",
                &[&member.name(), &owner.name()],
            )
            .await?;
        if row.is_none() {
            return Err(HarnessError::assertion(
                format!("Membership of {} in {}", member, owner),
                "member",
                "not a member",
            ));
        }
    }
    Ok(())
}
