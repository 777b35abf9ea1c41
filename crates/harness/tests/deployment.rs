//! End-to-end checks against a local Docker daemon.
//!
//! Run with `cargo test -- --ignored` from a checkout where
//! `KIVOLL_PROJECT_ROOT` points at the project under verification.

use std::time::Duration;

use kivoll_harness::config::POSTGRES_PORT;
use kivoll_harness::permissions::{read_value, Fixture, Sample, Scenario, ScenarioReport};
use kivoll_harness::suite::{GROUP_COMPOSE, GROUP_INIT, GROUP_PERMISSIONS, GROUP_ROLES};
use kivoll_harness::{
    ConnectionFactory, Container, ContainerSpec, Credential, Docker, Endpoint, HarnessConfig,
    HarnessError, Operation, Outcome, PermissionCase, PermissionVerifier, Poller, PostgresProbe,
    Role, Suite, TestEnv,
};

const STOCK_IMAGE: &str = "postgres:16-alpine";

fn harness() -> (HarnessConfig, TestEnv) {
    let config = HarnessConfig::from_env().unwrap();
    let env = TestEnv::load(&config.root().join(".env.test")).unwrap();
    (config, env)
}

async fn stock_postgres(docker: &Docker) -> (Container, Endpoint) {
    let spec = ContainerSpec::new(STOCK_IMAGE)
        .with_env("POSTGRES_USER", "testadmin")
        .with_env("POSTGRES_PASSWORD", "testadminpass")
        .with_exposed_port(POSTGRES_PORT);
    let container = Container::start(docker, &spec).await.unwrap();
    let port = container.host_port(POSTGRES_PORT).await.unwrap();
    (container, Endpoint::new("127.0.0.1", port))
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_readiness_then_connections_close_before_container() {
    let docker = Docker::new();
    let (container, endpoint) = stock_postgres(&docker).await;
    let admin = Credential::new("testadmin", "testadminpass");

    let probe = PostgresProbe::new(
        endpoint.clone(),
        admin.clone(),
        "postgres",
        Duration::from_secs(3),
    );
    let attempts = Poller::new(Duration::from_secs(60), Duration::from_millis(500))
        .wait(&probe)
        .await
        .unwrap();
    assert!(attempts >= 1);

    let mut factory = ConnectionFactory::new(endpoint, Duration::from_secs(5));
    let client = factory.connect(&admin, "postgres").await.unwrap();
    let row = client.query_one("SELECT 1::INT4", &[]).await.unwrap();
    assert_eq!(row.get::<_, i32>(0), 1);
    assert_eq!(factory.open_connections(), 1);

    factory.close_all().await;
    assert_eq!(factory.open_connections(), 0);
    assert!(client.is_closed());

    container.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_wrong_password_times_out_with_last_error() {
    let docker = Docker::new();
    let (container, endpoint) = stock_postgres(&docker).await;

    let probe = PostgresProbe::new(
        endpoint.clone(),
        Credential::new("testadmin", "wrong"),
        "postgres",
        Duration::from_secs(2),
    );
    let err = Poller::new(Duration::from_secs(15), Duration::from_secs(1))
        .wait(&probe)
        .await
        .unwrap_err();

    container.stop().await.unwrap();

    match err {
        HarnessError::Timeout { last_error, .. } => assert!(!last_error.is_empty()),
        other => panic!("expected timeout, got {:?}", other),
    }
}

async fn wait_ready(endpoint: &Endpoint, admin: &Credential) {
    let ready = PostgresProbe::new(endpoint.clone(), admin.clone(), "postgres", Duration::from_secs(3));
    Poller::new(Duration::from_secs(60), Duration::from_millis(500))
        .wait(&ready)
        .await
        .unwrap();
}

/// `worker_db` with a migrator that can create tables and an API role that
/// may only read what the migrator creates.
async fn readonly_fixture(factory: &mut ConnectionFactory, admin: &Credential) -> TestEnv {
    let client = factory.connect(admin, "postgres").await.unwrap();
    client
        .batch_execute(
            "CREATE DATABASE worker_db;
             CREATE ROLE worker_migrator LOGIN PASSWORD 'migrator-pass';
             CREATE ROLE api_app LOGIN PASSWORD 'api-pass';",
        )
        .await
        .unwrap();

    let worker_db = factory.connect(admin, "worker_db").await.unwrap();
    worker_db
        .batch_execute(
            "GRANT CREATE, USAGE ON SCHEMA public TO worker_migrator;
             GRANT USAGE ON SCHEMA public TO api_app;
             ALTER DEFAULT PRIVILEGES FOR ROLE worker_migrator IN SCHEMA public
                 GRANT SELECT ON TABLES TO api_app;",
        )
        .await
        .unwrap();

    TestEnv::from_pairs(vec![
        ("WORKER_MIGRATOR_PASSWORD".to_string(), "migrator-pass".to_string()),
        ("API_APP_PASSWORD".to_string(), "api-pass".to_string()),
    ])
    .unwrap()
}

async fn table_exists(factory: &mut ConnectionFactory, admin: &Credential, table: &str) -> bool {
    let client = factory.connect(admin, "worker_db").await.unwrap();
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT FROM pg_tables WHERE schemaname = 'public' AND tablename = $1)",
            &[&table],
        )
        .await
        .unwrap();
    row.get(0)
}

fn outcome_of(report: &ScenarioReport, operation: Operation) -> &Outcome {
    &report
        .results
        .iter()
        .find(|r| r.case.operation == operation)
        .unwrap()
        .outcome
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_verifier_classifies_denial_and_missing_table() {
    let docker = Docker::new();
    let (container, endpoint) = stock_postgres(&docker).await;
    let admin = Credential::new("testadmin", "testadminpass");
    wait_ready(&endpoint, &admin).await;

    let mut factory = ConnectionFactory::new(endpoint, Duration::from_secs(5));
    let env = readonly_fixture(&mut factory, &admin).await;
    let sample = Sample::Text {
        initial: "test",
        updated: "updated",
    };

    // SELECT-only role: reading the seeded row passes, writing is a privilege denial
    let readonly = Scenario {
        name: "api_app_readonly",
        database: "worker_db",
        table_prefix: "test_readonly",
        sample,
        fixture: Fixture::Owned {
            owner: Role::WorkerMigrator,
            seeded: true,
        },
        cases: vec![
            PermissionCase::allow(Role::ApiApp, Operation::Select),
            PermissionCase::deny(Role::ApiApp, Operation::Insert),
        ],
    };
    let report = PermissionVerifier::new(&env, &mut factory)
        .run(&readonly)
        .await
        .unwrap();
    assert!(report.passed(), "{:?}", report.mismatches());
    assert_eq!(outcome_of(&report, Operation::Select), &Outcome::Succeeded);
    assert_eq!(outcome_of(&report, Operation::Insert), &Outcome::Denied);
    assert!(!table_exists(&mut factory, &admin, &report.table).await);

    // Nobody creates the table: the insert fails with 42P01, which is not a denial
    let missing = Scenario {
        name: "api_app_missing_table",
        database: "worker_db",
        table_prefix: "test_missing",
        sample,
        fixture: Fixture::Inline,
        cases: vec![PermissionCase::deny(Role::ApiApp, Operation::Insert)],
    };
    let report = PermissionVerifier::new(&env, &mut factory)
        .run(&missing)
        .await
        .unwrap();
    assert!(!report.passed());
    match outcome_of(&report, Operation::Insert) {
        Outcome::Failed(message) => assert!(message.starts_with("[42P01]"), "{}", message),
        other => panic!("expected failure, got {}", other),
    }
    assert!(report.into_result().is_err());

    factory.close_all().await;
    container.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_read_value_type_mismatch_is_an_error() {
    let docker = Docker::new();
    let (container, endpoint) = stock_postgres(&docker).await;
    let admin = Credential::new("testadmin", "testadminpass");
    wait_ready(&endpoint, &admin).await;

    let mut factory = ConnectionFactory::new(endpoint, Duration::from_secs(5));
    let client = factory.connect(&admin, "postgres").await.unwrap();
    client
        .batch_execute("CREATE TABLE mismatch (value TEXT); INSERT INTO mismatch VALUES ('0.95');")
        .await
        .unwrap();

    let float = Sample::Float {
        initial: 0.95,
        updated: 0.99,
    };
    let read = read_value(&client, "SELECT value FROM mismatch", &float).await;
    assert!(read.is_err());
    assert!(matches!(Outcome::from_result(&read), Outcome::Failed(_)));

    drop(client);
    factory.close_all().await;
    container.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_database_suite_passes() {
    let (config, env) = harness();
    let mut suite = Suite::new(config, env);
    suite.run_database_suite().await;
    let report = suite.finish().await;

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.group(GROUP_INIT).count(), 1);
    assert!(report.group(GROUP_ROLES).all(|c| c.outcome.is_passed()));
    assert!(report.group(GROUP_PERMISSIONS).all(|c| c.outcome.is_passed()));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_compose_config_validates() {
    let (config, env) = harness();
    let mut suite = Suite::new(config, env);
    suite.run_compose_suite(false).await;
    let report = suite.finish().await;

    assert!(report.group(GROUP_COMPOSE).all(|c| c.outcome.is_passed()), "{}", report.summary());
}
