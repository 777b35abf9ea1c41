//! Permission verification.
//!
//! Each scenario logs in as the roles under test, runs DDL/DML against a
//! scratch table and classifies every statement as succeeded, denied by
//! privilege (SQLSTATE 42501) or failed for some other reason. A case that
//! expects denial passes only on a privilege denial: a missing table or a
//! syntax error is a failure, never a pass.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;

use crate::config::TestEnv;
use crate::db::ConnectionFactory;
use crate::error::{HarnessError, HarnessResult};
use crate::roles::Role;

/// Statement kinds exercised against the scratch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateTable,
    Insert,
    Select,
    Update,
    Delete,
    DropTable,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::CreateTable => "CREATE TABLE",
            Operation::Insert => "INSERT",
            Operation::Select => "SELECT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::DropTable => "DROP TABLE",
        };
        f.write_str(name)
    }
}

/// Declared intent for one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Allow,
    Deny,
}

/// Observed result of one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    Denied,
    Failed(String),
}

impl Outcome {
    /// Classify a database result by SQLSTATE.
    pub fn from_result<T>(result: &Result<T, tokio_postgres::Error>) -> Self {
        match result {
            Ok(_) => Outcome::Succeeded,
            Err(e) => Self::from_error(e.code(), e),
        }
    }

    /// Classify an error: only `insufficient_privilege` is a denial.
    pub fn from_error(code: Option<&SqlState>, error: impl fmt::Display) -> Self {
        match code {
            Some(code) if *code == SqlState::INSUFFICIENT_PRIVILEGE => Outcome::Denied,
            Some(code) => Outcome::Failed(format!("[{}] {}", code.code(), error)),
            None => Outcome::Failed(error.to_string()),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => f.write_str("succeeded"),
            Outcome::Denied => f.write_str("denied by privilege"),
            Outcome::Failed(msg) => write!(f, "failed ({})", msg),
        }
    }
}

impl Expectation {
    pub fn accepts(&self, outcome: &Outcome) -> bool {
        matches!(
            (self, outcome),
            (Expectation::Allow, Outcome::Succeeded) | (Expectation::Deny, Outcome::Denied)
        )
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Allow => f.write_str("succeeded"),
            Expectation::Deny => f.write_str("denied by privilege"),
        }
    }
}

/// One (role, operation, intent) step of a scenario.
#[derive(Debug, Clone, Copy)]
pub struct PermissionCase {
    pub role: Role,
    pub operation: Operation,
    pub expectation: Expectation,
}

impl PermissionCase {
    pub const fn allow(role: Role, operation: Operation) -> Self {
        Self {
            role,
            operation,
            expectation: Expectation::Allow,
        }
    }

    pub const fn deny(role: Role, operation: Operation) -> Self {
        Self {
            role,
            operation,
            expectation: Expectation::Deny,
        }
    }
}

/// Value column type and the values written to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Text { initial: &'static str, updated: &'static str },
    Float { initial: f64, updated: f64 },
}

/// A value read back from the scratch table.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Float(f64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Float(v) => write!(f, "{}", v),
        }
    }
}

impl Sample {
    fn sql_type(&self) -> &'static str {
        match self {
            Sample::Text { .. } => "TEXT",
            Sample::Float { .. } => "FLOAT",
        }
    }

    fn initial(&self) -> Value {
        match self {
            Sample::Text { initial, .. } => Value::Text(initial.to_string()),
            Sample::Float { initial, .. } => Value::Float(*initial),
        }
    }

    fn updated(&self) -> Value {
        match self {
            Sample::Text { updated, .. } => Value::Text(updated.to_string()),
            Sample::Float { updated, .. } => Value::Float(*updated),
        }
    }

    fn literal(value: &Value) -> String {
        match value {
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Float(v) => format!("{:?}", v),
        }
    }
}

/// Who creates the scratch table.
#[derive(Debug, Clone, Copy)]
pub enum Fixture {
    /// The scenario's own steps create and drop the table.
    Inline,
    /// `owner` creates the table before the steps (and seeds one row if
    /// `seeded`), then drops it afterwards.
    Owned { owner: Role, seeded: bool },
}

/// A sequence of permission cases against one database.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub database: &'static str,
    pub table_prefix: &'static str,
    pub sample: Sample,
    pub fixture: Fixture,
    pub cases: Vec<PermissionCase>,
}

/// Result of one executed case.
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub case: PermissionCase,
    pub outcome: Outcome,
    pub passed: bool,
}

/// Result of a scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub database: &'static str,
    pub table: String,
    pub results: Vec<CaseResult>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Expected-vs-actual lines for every mismatched case.
    pub fn mismatches(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| {
                format!(
                    "{} {} on {}.{}: expected {}, got {}",
                    r.case.role,
                    r.case.operation,
                    self.database,
                    self.table,
                    r.case.expectation,
                    r.outcome
                )
            })
            .collect()
    }

    pub fn into_result(self) -> HarnessResult<Self> {
        if self.passed() {
            return Ok(self);
        }
        Err(HarnessError::Check(self.mismatches().join("; ")))
    }
}

fn statement(operation: Operation, table: &str, sample: &Sample) -> String {
    match operation {
        Operation::CreateTable => format!(
            "CREATE TABLE {} (id SERIAL PRIMARY KEY, value {})",
            table,
            sample.sql_type()
        ),
        Operation::Insert => format!(
            "INSERT INTO {} (value) VALUES ({})",
            table,
            Sample::literal(&sample.initial())
        ),
        Operation::Select => format!("SELECT value FROM {}", table),
        Operation::Update => format!(
            "UPDATE {} SET value = {}",
            table,
            Sample::literal(&sample.updated())
        ),
        Operation::Delete => format!("DELETE FROM {}", table),
        Operation::DropTable => format!("DROP TABLE {}", table),
    }
}

/// Unique scratch table name for one scenario run.
pub fn scratch_table(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &suffix[..8])
}

async fn table_exists(client: &Client, table: &str) -> HarnessResult<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT FROM pg_tables WHERE schemaname = 'public' AND tablename = $1)",
            &[&table],
        )
        .await?;
    Ok(row.get(0))
}

/// Read the first column of at most one row as `sample`'s type.
///
/// A column whose type does not match the sample is an error, not a panic.
pub async fn read_value(
    client: &Client,
    sql: &str,
    sample: &Sample,
) -> Result<Option<Value>, tokio_postgres::Error> {
    let Some(row) = client.query_opt(sql, &[]).await? else {
        return Ok(None);
    };
    let value = match sample {
        Sample::Text { .. } => Value::Text(row.try_get(0)?),
        Sample::Float { .. } => Value::Float(row.try_get(0)?),
    };
    Ok(Some(value))
}

/// Classify a SELECT: a successful read of the wrong value is a failure.
pub fn classify_read(
    read: &Result<Option<Value>, tokio_postgres::Error>,
    expected: Option<&Value>,
) -> Outcome {
    match (read, expected) {
        (Ok(actual), Some(want)) if actual.as_ref() != Some(want) => Outcome::Failed(format!(
            "read {} but expected {}",
            actual.as_ref().map_or("no row".to_string(), Value::to_string),
            want
        )),
        _ => Outcome::from_result(read),
    }
}

/// Runs [`Scenario`]s through a [`ConnectionFactory`].
pub struct PermissionVerifier<'a> {
    env: &'a TestEnv,
    factory: &'a mut ConnectionFactory,
}

impl<'a> PermissionVerifier<'a> {
    pub fn new(env: &'a TestEnv, factory: &'a mut ConnectionFactory) -> Self {
        Self { env, factory }
    }

    async fn client_for(
        &mut self,
        clients: &mut HashMap<Role, Arc<Client>>,
        role: Role,
        database: &str,
    ) -> HarnessResult<Arc<Client>> {
        if let Some(client) = clients.get(&role) {
            return Ok(Arc::clone(client));
        }
        let credential = self.env.credential(role)?;
        let client = self.factory.connect(&credential, database).await?;
        clients.insert(role, Arc::clone(&client));
        Ok(client)
    }

    /// Run `scenario`. The fixture table is dropped whatever the steps returned.
    pub async fn run(&mut self, scenario: &Scenario) -> HarnessResult<ScenarioReport> {
        let table = scratch_table(scenario.table_prefix);
        let mut clients = HashMap::new();

        tracing::debug!(scenario = scenario.name, database = scenario.database, table = %table, "Running permission scenario");

        let outcome = self.run_steps(scenario, &table, &mut clients).await;
        self.cleanup(scenario, &table, &clients).await;

        let results = outcome?;
        Ok(ScenarioReport {
            name: scenario.name,
            database: scenario.database,
            table,
            results,
        })
    }

    async fn run_steps(
        &mut self,
        scenario: &Scenario,
        table: &str,
        clients: &mut HashMap<Role, Arc<Client>>,
    ) -> HarnessResult<Vec<CaseResult>> {
        let sample = &scenario.sample;
        // Value the next successful SELECT must read back
        let mut expected: Option<Value> = None;

        if let Fixture::Owned { owner, seeded } = scenario.fixture {
            let setup = self.client_for(clients, owner, scenario.database).await?;
            setup
                .batch_execute(&statement(Operation::CreateTable, table, sample))
                .await
                .map_err(|e| HarnessError::Setup(format!("{} could not create {}: {}", owner, table, e)))?;
            if seeded {
                setup
                    .batch_execute(&statement(Operation::Insert, table, sample))
                    .await
                    .map_err(|e| HarnessError::Setup(format!("{} could not seed {}: {}", owner, table, e)))?;
                expected = Some(sample.initial());
            }
        }

        let mut results = Vec::with_capacity(scenario.cases.len());
        for case in &scenario.cases {
            let client = self.client_for(clients, case.role, scenario.database).await?;
            let sql = statement(case.operation, table, sample);

            let mut outcome = if case.operation == Operation::Select {
                let read = read_value(&client, &sql, sample).await;
                classify_read(&read, expected.as_ref())
            } else {
                Outcome::from_result(&client.batch_execute(&sql).await)
            };

            if outcome == Outcome::Succeeded {
                match case.operation {
                    Operation::Insert => expected = Some(sample.initial()),
                    Operation::Update => {
                        if expected.is_some() {
                            expected = Some(sample.updated());
                        }
                    }
                    Operation::Delete | Operation::DropTable => expected = None,
                    Operation::CreateTable => {
                        if !table_exists(&client, table).await? {
                            outcome = Outcome::Failed(format!("{} not visible in pg_tables", table));
                        }
                    }
                    Operation::Select => {}
                }
            }

            let passed = case.expectation.accepts(&outcome);
            tracing::debug!(
                role = %case.role,
                operation = %case.operation,
                outcome = %outcome,
                passed,
                "Permission case"
            );
            results.push(CaseResult {
                case: *case,
                outcome,
                passed,
            });
        }

        Ok(results)
    }

    async fn cleanup(&self, scenario: &Scenario, table: &str, clients: &HashMap<Role, Arc<Client>>) {
        let dropper = match scenario.fixture {
            Fixture::Owned { owner, .. } => Some(owner),
            Fixture::Inline => scenario
                .cases
                .iter()
                .find(|c| c.operation == Operation::CreateTable)
                .map(|c| c.role),
        };

        let Some(role) = dropper else { return };
        let Some(client) = clients.get(&role) else { return };

        if let Err(e) = client
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", table))
            .await
        {
            tracing::warn!(table, role = %role, error = %e, "Failed to drop scratch table");
        }
    }
}

/// The permission matrix checked on every run.
pub fn scenarios() -> Vec<Scenario> {
    use Operation::*;
    use Role::*;

    let text = Sample::Text {
        initial: "test",
        updated: "updated",
    };
    let float = Sample::Float {
        initial: 0.95,
        updated: 0.99,
    };
    let ddl = |role| vec![PermissionCase::allow(role, CreateTable), PermissionCase::allow(role, DropTable)];
    let dml = |role| {
        vec![
            PermissionCase::allow(role, Insert),
            PermissionCase::allow(role, Select),
            PermissionCase::allow(role, Update),
            PermissionCase::allow(role, Delete),
        ]
    };
    let select_update_only = |role| {
        vec![
            PermissionCase::allow(role, Select),
            PermissionCase::allow(role, Update),
            PermissionCase::deny(role, Insert),
            PermissionCase::deny(role, Delete),
        ]
    };
    let full = |role| {
        let mut cases = vec![PermissionCase::allow(role, CreateTable)];
        cases.extend(dml(role));
        cases.push(PermissionCase::allow(role, DropTable));
        cases
    };

    vec![
        Scenario {
            name: "worker_migrator_ddl_on_worker_db",
            database: "worker_db",
            table_prefix: "test_migrator_table",
            sample: text,
            fixture: Fixture::Inline,
            cases: ddl(WorkerMigrator),
        },
        Scenario {
            name: "worker_migrator_dml_on_worker_db",
            database: "worker_db",
            table_prefix: "test_dml",
            sample: text,
            fixture: Fixture::Inline,
            cases: full(WorkerMigrator),
        },
        Scenario {
            name: "worker_app_dml_on_worker_db",
            database: "worker_db",
            table_prefix: "test_worker_app",
            sample: text,
            fixture: Fixture::Owned {
                owner: WorkerMigrator,
                seeded: false,
            },
            cases: dml(WorkerApp),
        },
        Scenario {
            name: "worker_app_no_ddl_on_worker_db",
            database: "worker_db",
            table_prefix: "test_forbidden",
            sample: text,
            fixture: Fixture::Inline,
            cases: vec![PermissionCase::deny(WorkerApp, CreateTable)],
        },
        Scenario {
            name: "api_app_readonly_on_worker_db",
            database: "worker_db",
            table_prefix: "test_readonly",
            sample: text,
            fixture: Fixture::Owned {
                owner: WorkerMigrator,
                seeded: true,
            },
            cases: vec![
                PermissionCase::allow(ApiApp, Select),
                PermissionCase::deny(ApiApp, Insert),
                PermissionCase::deny(ApiApp, Update),
                PermissionCase::deny(ApiApp, Delete),
            ],
        },
        Scenario {
            name: "api_migrator_ddl_on_jobs_db",
            database: "jobs_db",
            table_prefix: "test_jobs_table",
            sample: text,
            fixture: Fixture::Inline,
            cases: ddl(ApiMigrator),
        },
        Scenario {
            name: "api_app_dml_on_jobs_db",
            database: "jobs_db",
            table_prefix: "test_jobs",
            sample: text,
            fixture: Fixture::Owned {
                owner: ApiMigrator,
                seeded: false,
            },
            cases: dml(ApiApp),
        },
        Scenario {
            name: "worker_app_select_update_on_jobs_db",
            database: "jobs_db",
            table_prefix: "test_worker_jobs",
            sample: text,
            fixture: Fixture::Owned {
                owner: ApiMigrator,
                seeded: true,
            },
            cases: select_update_only(WorkerApp),
        },
        Scenario {
            name: "predict_app_select_update_on_jobs_db",
            database: "jobs_db",
            table_prefix: "test_predict_jobs",
            sample: text,
            fixture: Fixture::Owned {
                owner: ApiMigrator,
                seeded: true,
            },
            cases: select_update_only(PredictApp),
        },
        Scenario {
            name: "scheduler_full_access_on_scheduler_db",
            database: "scheduler_db",
            table_prefix: "test_scheduler",
            sample: text,
            fixture: Fixture::Inline,
            cases: full(Scheduler),
        },
        Scenario {
            name: "predict_migrator_ddl_on_predictions_db",
            database: "predictions_db",
            table_prefix: "test_predictions",
            sample: float,
            fixture: Fixture::Inline,
            cases: ddl(PredictMigrator),
        },
        Scenario {
            name: "predict_app_dml_on_predictions_db",
            database: "predictions_db",
            table_prefix: "test_pred",
            sample: float,
            fixture: Fixture::Owned {
                owner: PredictMigrator,
                seeded: false,
            },
            cases: dml(PredictApp),
        },
        Scenario {
            name: "api_app_readonly_on_predictions_db",
            database: "predictions_db",
            table_prefix: "test_pred_ro",
            sample: float,
            fixture: Fixture::Owned {
                owner: PredictMigrator,
                seeded: true,
            },
            cases: vec![
                PermissionCase::allow(ApiApp, Select),
                PermissionCase::deny(ApiApp, Insert),
            ],
        },
        Scenario {
            name: "api_migrator_ddl_on_userdata_db",
            database: "userdata_db",
            table_prefix: "test_userdata",
            sample: text,
            fixture: Fixture::Inline,
            cases: ddl(ApiMigrator),
        },
        Scenario {
            name: "api_app_dml_on_userdata_db",
            database: "userdata_db",
            table_prefix: "test_users",
            sample: Sample::Text {
                initial: "alice",
                updated: "bob",
            },
            fixture: Fixture::Owned {
                owner: ApiMigrator,
                seeded: false,
            },
            cases: dml(ApiApp),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Topology;

    #[test]
    fn test_classification_by_sqlstate() {
        assert_eq!(
            Outcome::from_error(Some(&SqlState::INSUFFICIENT_PRIVILEGE), "permission denied for table t"),
            Outcome::Denied
        );
        assert_eq!(
            Outcome::from_error(Some(&SqlState::from_code("42501")), "permission denied"),
            Outcome::Denied
        );

        // A missing table must not pass as a denial
        let outcome = Outcome::from_error(Some(&SqlState::UNDEFINED_TABLE), "relation \"t\" does not exist");
        assert_eq!(
            outcome,
            Outcome::Failed("[42P01] relation \"t\" does not exist".to_string())
        );

        let outcome = Outcome::from_error(None, "connection closed");
        assert!(matches!(outcome, Outcome::Failed(_)));
    }

    #[test]
    fn test_read_back_mismatch_fails() {
        let seeded = Value::Text("test".to_string());

        let outcome = classify_read(&Ok(Some(Value::Text("other".to_string()))), Some(&seeded));
        assert_eq!(
            outcome,
            Outcome::Failed("read \"other\" but expected \"test\"".to_string())
        );
        assert!(!Expectation::Allow.accepts(&outcome));

        let outcome = classify_read(&Ok(None), Some(&seeded));
        assert_eq!(
            outcome,
            Outcome::Failed("read no row but expected \"test\"".to_string())
        );

        assert_eq!(classify_read(&Ok(Some(seeded.clone())), Some(&seeded)), Outcome::Succeeded);
        // Nothing written yet, any read is fine
        assert_eq!(classify_read(&Ok(None), None), Outcome::Succeeded);
    }

    #[test]
    fn test_expectation_accepts() {
        assert!(Expectation::Allow.accepts(&Outcome::Succeeded));
        assert!(!Expectation::Allow.accepts(&Outcome::Denied));
        assert!(Expectation::Deny.accepts(&Outcome::Denied));
        assert!(!Expectation::Deny.accepts(&Outcome::Succeeded));
        assert!(!Expectation::Deny.accepts(&Outcome::Failed("syntax error".to_string())));
    }

    #[test]
    fn test_statements() {
        let text = Sample::Text {
            initial: "it's",
            updated: "updated",
        };
        assert_eq!(
            statement(Operation::CreateTable, "t_1", &text),
            "CREATE TABLE t_1 (id SERIAL PRIMARY KEY, value TEXT)"
        );
        assert_eq!(
            statement(Operation::Insert, "t_1", &text),
            "INSERT INTO t_1 (value) VALUES ('it''s')"
        );

        let float = Sample::Float {
            initial: 0.95,
            updated: 0.99,
        };
        assert_eq!(
            statement(Operation::Update, "t_2", &float),
            "UPDATE t_2 SET value = 0.99"
        );
        assert_eq!(statement(Operation::DropTable, "t_2", &float), "DROP TABLE t_2");
    }

    #[test]
    fn test_scratch_table_names_are_unique_identifiers() {
        let a = scratch_table("test_dml");
        let b = scratch_table("test_dml");
        assert_ne!(a, b);
        assert!(a.starts_with("test_dml_"));
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_matrix_covers_every_database() {
        let scenarios = scenarios();
        let topology = Topology::kivoll();
        for database in &topology.databases {
            assert!(
                scenarios.iter().any(|s| s.database == *database),
                "no scenario for {}",
                database
            );
        }

        let mut names: Vec<&str> = scenarios.iter().map(|s| s.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), scenarios.len());
    }

    #[test]
    fn test_matrix_only_uses_login_roles() {
        for scenario in scenarios() {
            for case in &scenario.cases {
                assert!(case.role.can_login(), "{} uses {}", scenario.name, case.role);
            }
            if let Fixture::Owned { owner, .. } = scenario.fixture {
                assert!(owner.can_login());
            }
        }
    }

    #[test]
    fn test_readonly_scenarios_expect_privilege_denial() {
        let scenario = scenarios()
            .into_iter()
            .find(|s| s.name == "api_app_readonly_on_worker_db")
            .unwrap();
        let denied: Vec<Operation> = scenario
            .cases
            .iter()
            .filter(|c| c.expectation == Expectation::Deny)
            .map(|c| c.operation)
            .collect();
        assert_eq!(denied, vec![Operation::Insert, Operation::Update, Operation::Delete]);
        assert!(matches!(scenario.fixture, Fixture::Owned { seeded: true, .. }));
    }

    #[test]
    fn test_report_mismatches() {
        let report = ScenarioReport {
            name: "api_app_readonly_on_worker_db",
            database: "worker_db",
            table: "test_readonly_1".to_string(),
            results: vec![
                CaseResult {
                    case: PermissionCase::allow(Role::ApiApp, Operation::Select),
                    outcome: Outcome::Succeeded,
                    passed: true,
                },
                CaseResult {
                    case: PermissionCase::deny(Role::ApiApp, Operation::Insert),
                    outcome: Outcome::Succeeded,
                    passed: false,
                },
            ],
        };
        assert!(!report.passed());
        assert_eq!(
            report.mismatches(),
            vec!["api_app INSERT on worker_db.test_readonly_1: expected denied by privilege, got succeeded"]
        );
        assert!(report.into_result().is_err());
    }
}
