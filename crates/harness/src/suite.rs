//! Check orchestration.
//!
//! A [`Suite`] runs the check groups in dependency order and records every
//! result in a [`Report`]. A failed setup step (invalid build context,
//! failed build, database that never becomes ready) marks the checks that
//! depend on it as skipped. Teardown runs on every path: connections, then
//! the container, then temporary files, then the image in [`Suite::finish`].
//! A suite dropped before `finish` (an interrupted run) still removes its
//! image synchronously.

use std::sync::Arc;
use std::time::Instant;
use tokio_postgres::Client;

use crate::compose::{self, ComposeDocument, ComposeProject, PatchedCompose};
use crate::config::{HarnessConfig, TestEnv, POSTGRES_PORT};
use crate::db::{ConnectionFactory, Endpoint};
use crate::docker::{Container, ContainerSpec, Docker};
use crate::error::{HarnessError, HarnessResult};
use crate::image::{image_tag, BuiltImage, DbContext, CONTEXT_CHECKS};
use crate::permissions::{self, PermissionVerifier};
use crate::readiness::{Poller, PostgresProbe};
use crate::report::{CheckOutcome, CheckResult, Report};
use crate::roles::{self, Topology};

pub const GROUP_IMAGE: &str = "image";
pub const GROUP_INIT: &str = "init";
pub const GROUP_ROLES: &str = "roles";
pub const GROUP_PERMISSIONS: &str = "permissions";
pub const GROUP_COMPOSE: &str = "compose";
pub const GROUP_COMPOSE_FULL: &str = "compose-full";

const IMAGE_BUILD: &str = "image_builds";
const IMAGE_VERIFY: &str = "image_is_tagged";
const INIT_READY: &str = "database_initialises";

const ROLE_CHECKS: [&str; 7] = [
    "databases_exist",
    "roles_exist",
    "login_flags",
    "nologin_roles_rejected",
    "login_roles_authenticate",
    "database_owners",
    "migrator_memberships",
];

const COMPOSE_PARSE: &str = "manifest_parses";
const COMPOSE_CHECKS: [&str; 9] = [
    "db_service_defined",
    "db_uses_custom_image",
    "services_have_image_or_build",
    "db_has_healthcheck",
    "healthchecks_have_test",
    "db_persists_data",
    "depends_on_valid",
    "db_dependents_wait_healthy",
    "volumes_valid",
];
/// Structural checks the patched-manifest steps depend on.
const COMPOSE_GATES: [&str; 2] = ["db_service_defined", "db_uses_custom_image"];
const COMPOSE_CONFIG: &str = "config_validates";
const COMPOSE_UP: &str = "stack_becomes_healthy";

/// Runs check groups against one project checkout.
pub struct Suite {
    config: HarnessConfig,
    env: TestEnv,
    docker: Docker,
    report: Report,
    image: Option<BuiltImage>,
    /// Why no image is available, once building was attempted and failed.
    image_failure: Option<String>,
}

impl Suite {
    pub fn new(config: HarnessConfig, env: TestEnv) -> Self {
        Self::with_docker(config, env, Docker::new())
    }

    pub fn with_docker(config: HarnessConfig, env: TestEnv, docker: Docker) -> Self {
        Self {
            config,
            env,
            docker,
            report: Report::new(),
            image: None,
            image_failure: None,
        }
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    fn record(&mut self, group: &str, name: &str, result: HarnessResult<()>, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = match result {
            Ok(()) => CheckOutcome::Passed,
            Err(e) => {
                if e.is_setup() {
                    self.report.setup_failed(name);
                }
                CheckOutcome::failed(e.to_string())
            }
        };
        self.report
            .push(CheckResult::new(group, name, outcome, duration_ms));
    }

    fn skip_all<'a, I>(&mut self, group: &str, names: I, reason: &str)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            self.report.push(CheckResult::skipped(group, name, reason));
        }
    }

    fn skip_database_groups(&mut self, reason: &str) {
        self.skip_all(GROUP_ROLES, ROLE_CHECKS, reason);
        let scenarios = permissions::scenarios();
        self.skip_all(GROUP_PERMISSIONS, scenarios.iter().map(|s| s.name), reason);
    }

    /// Static checks of the build context, then build and verify the image.
    pub async fn run_image_suite(&mut self) {
        if self.image.is_some() || self.image_failure.is_some() {
            return;
        }

        let context = DbContext::new(self.config.db_context_path());
        tracing::info!(context = %context.root().display(), "Checking database image");

        let mut context_ok = true;
        for (name, check) in CONTEXT_CHECKS {
            let started = Instant::now();
            let result = check(&context);
            context_ok &= result.is_ok();
            self.record(GROUP_IMAGE, name, result, started);
        }

        if !context_ok {
            self.fail_image("build context is invalid".to_string());
            return;
        }

        let started = Instant::now();
        let built = match context.read_version() {
            Ok(version) => {
                let tag = image_tag(&self.config.test_image, &version);
                BuiltImage::build(&self.docker, &context, &tag).await
            }
            Err(e) => Err(e),
        };
        let built = match built {
            Ok(built) => {
                self.record(GROUP_IMAGE, IMAGE_BUILD, Ok(()), started);
                built
            }
            Err(e) => {
                self.record(GROUP_IMAGE, IMAGE_BUILD, Err(e), started);
                self.report.setup_failed(IMAGE_BUILD);
                self.image_failure = Some("image build failed".to_string());
                self.report
                    .push(CheckResult::skipped(GROUP_IMAGE, IMAGE_VERIFY, "image build failed"));
                return;
            }
        };

        let started = Instant::now();
        let verified = built.verify(&self.docker).await;
        self.record(GROUP_IMAGE, IMAGE_VERIFY, verified, started);
        self.image = Some(built);
    }

    fn fail_image(&mut self, reason: String) {
        self.report.setup_failed("image context");
        self.report
            .push(CheckResult::skipped(GROUP_IMAGE, IMAGE_BUILD, &reason));
        self.report
            .push(CheckResult::skipped(GROUP_IMAGE, IMAGE_VERIFY, &reason));
        self.image_failure = Some(reason);
    }

    fn image_tag(&self) -> Option<String> {
        self.image.as_ref().map(|image| image.tag.clone())
    }

    /// Start the image, wait for initialisation, then check roles and permissions.
    pub async fn run_database_suite(&mut self) {
        self.run_image_suite().await;
        let Some(tag) = self.image_tag() else {
            let reason = self
                .image_failure
                .clone()
                .unwrap_or_else(|| "no image".to_string());
            self.report
                .push(CheckResult::skipped(GROUP_INIT, INIT_READY, &reason));
            self.skip_database_groups(&reason);
            return;
        };

        let spec = ContainerSpec::new(&tag)
            .with_envs(self.env.container_env())
            .with_exposed_port(POSTGRES_PORT)
            .with_bind_host(&self.config.container_host);

        let started = Instant::now();
        let container = match Container::start(&self.docker, &spec).await {
            Ok(container) => container,
            Err(e) => {
                self.init_failed(Err(e), started);
                return;
            }
        };

        let endpoint = match container.host_port(POSTGRES_PORT).await {
            Ok(port) => Endpoint::new(&self.config.container_host, port),
            Err(e) => {
                self.init_failed(Err(e), started);
                stop_container(container).await;
                return;
            }
        };

        let probe = PostgresProbe::new(
            endpoint.clone(),
            self.env.admin(),
            &self.env.postgres_db,
            self.config.connect_timeout(),
        );
        let poller = Poller::new(self.config.ready_timeout(), self.config.ready_interval());
        if let Err(e) = poller.wait(&probe).await {
            let logs = container
                .logs()
                .await
                .unwrap_or_else(|log_err| format!("<failed to read logs: {}>", log_err));
            let error = HarnessError::Setup(format!(
                "Database did not initialise: {}\n--- container logs ---\n{}",
                e, logs
            ));
            self.init_failed(Err(error), started);
            stop_container(container).await;
            return;
        }
        self.record(GROUP_INIT, INIT_READY, Ok(()), started);

        let mut factory = ConnectionFactory::new(endpoint, self.config.connect_timeout());
        match factory.connect(&self.env.admin(), &self.env.postgres_db).await {
            Ok(admin) => {
                self.run_role_checks(&admin, factory.endpoint().clone()).await;
                drop(admin);
                self.run_permission_checks(&mut factory).await;
            }
            Err(e) => {
                let reason = format!("admin connection failed: {}", e);
                self.report.setup_failed("admin connection");
                self.skip_database_groups(&reason);
            }
        }

        factory.close_all().await;
        stop_container(container).await;
    }

    fn init_failed(&mut self, result: HarnessResult<()>, started: Instant) {
        self.record(GROUP_INIT, INIT_READY, result, started);
        self.report.setup_failed(INIT_READY);
        self.skip_database_groups("database did not initialise");
    }

    async fn run_role_checks(&mut self, admin: &Arc<Client>, endpoint: Endpoint) {
        let topology = Topology::kivoll();
        let timeout = self.config.connect_timeout();

        for name in ROLE_CHECKS {
            let started = Instant::now();
            let result = match name {
                "databases_exist" => roles::check_databases_exist(admin, &topology).await,
                "roles_exist" => roles::check_roles_exist(admin, &topology).await,
                "login_flags" => roles::check_login_flags(admin, &topology).await,
                "nologin_roles_rejected" => {
                    roles::check_nologin_rejected(&endpoint, &self.env, &topology, timeout).await
                }
                "login_roles_authenticate" => {
                    roles::check_login_roles_authenticate(&endpoint, &self.env, &topology, timeout)
                        .await
                }
                "database_owners" => roles::check_database_owners(admin, &topology).await,
                "migrator_memberships" => roles::check_memberships(admin, &topology).await,
                other => Err(HarnessError::Check(format!("Unknown role check {}", other))),
            };
            self.record(GROUP_ROLES, name, result, started);
        }
    }

    async fn run_permission_checks(&mut self, factory: &mut ConnectionFactory) {
        for scenario in permissions::scenarios() {
            let started = Instant::now();
            let result = {
                let mut verifier = PermissionVerifier::new(&self.env, factory);
                verifier.run(&scenario).await
            };
            let result = result.and_then(|report| report.into_result()).map(|_| ());
            self.record(GROUP_PERMISSIONS, scenario.name, result, started);
        }
    }

    /// Structural checks, then `compose config` on a patched copy.
    ///
    /// With `full`, the patched stack is also brought up and torn down.
    pub async fn run_compose_suite(&mut self, full: bool) {
        let path = self.config.compose_path();
        tracing::info!(file = %path.display(), full, "Checking compose manifest");

        let started = Instant::now();
        let document = match ComposeDocument::load(&path) {
            Ok(document) => {
                self.record(GROUP_COMPOSE, COMPOSE_PARSE, Ok(()), started);
                document
            }
            Err(e) => {
                self.record(GROUP_COMPOSE, COMPOSE_PARSE, Err(e), started);
                self.report.setup_failed(COMPOSE_PARSE);
                let reason = "compose manifest could not be loaded";
                self.skip_all(GROUP_COMPOSE, COMPOSE_CHECKS, reason);
                self.skip_all(GROUP_COMPOSE, [COMPOSE_CONFIG], reason);
                if full {
                    self.skip_all(GROUP_COMPOSE_FULL, [COMPOSE_UP], reason);
                }
                return;
            }
        };

        let mut gates_failed = Vec::new();
        for name in COMPOSE_CHECKS {
            let started = Instant::now();
            let result = match name {
                "db_service_defined" => document.check_db_service(),
                "db_uses_custom_image" => document.check_db_image(&self.config.image_marker),
                "services_have_image_or_build" => document.check_image_or_build(),
                "db_has_healthcheck" => document.check_db_healthcheck(),
                "healthchecks_have_test" => document.check_healthchecks(),
                "db_persists_data" => document.check_db_data_volume(),
                "depends_on_valid" => document.check_depends_on(),
                "db_dependents_wait_healthy" => document.check_db_dependents_healthy(),
                "volumes_valid" => document.check_volumes(),
                other => Err(HarnessError::Check(format!("Unknown compose check {}", other))),
            };
            if result.is_err() && COMPOSE_GATES.contains(&name) {
                gates_failed.push(name);
            }
            self.record(GROUP_COMPOSE, name, result, started);
        }

        if !gates_failed.is_empty() {
            // Without a db service running our image there is nothing to patch in
            let reason = format!("{} failed", gates_failed.join(", "));
            for name in &gates_failed {
                self.report.setup_failed(*name);
            }
            self.skip_all(GROUP_COMPOSE, [COMPOSE_CONFIG], &reason);
            if full {
                self.skip_all(GROUP_COMPOSE_FULL, [COMPOSE_UP], &reason);
            }
            return;
        }

        if full {
            self.run_image_suite().await;
        }
        let tag = match self.patch_tag() {
            Ok(tag) => tag,
            Err(e) => {
                let reason = format!("no image tag to patch in: {}", e);
                self.skip_all(GROUP_COMPOSE, [COMPOSE_CONFIG], &reason);
                if full {
                    self.skip_all(GROUP_COMPOSE_FULL, [COMPOSE_UP], &reason);
                }
                return;
            }
        };

        let started = Instant::now();
        let patched = match PatchedCompose::write(&document, &tag) {
            Ok(patched) => patched,
            Err(e) => {
                self.record(GROUP_COMPOSE, COMPOSE_CONFIG, Err(e), started);
                if full {
                    self.skip_all(GROUP_COMPOSE_FULL, [COMPOSE_UP], "patched manifest not written");
                }
                return;
            }
        };
        let config = compose::compose_config(&self.docker, patched.path())
            .await
            .map(|_| ());
        let config_ok = config.is_ok();
        self.record(GROUP_COMPOSE, COMPOSE_CONFIG, config, started);

        if full {
            if self.image.is_none() {
                let reason = self
                    .image_failure
                    .clone()
                    .unwrap_or_else(|| "no image".to_string());
                self.skip_all(GROUP_COMPOSE_FULL, [COMPOSE_UP], &reason);
            } else if !config_ok {
                self.skip_all(GROUP_COMPOSE_FULL, [COMPOSE_UP], "compose config failed");
            } else {
                let started = Instant::now();
                let mut project = ComposeProject::new(&self.docker, patched.path());
                let result = project.up_and_down(self.config.compose_wait()).await;
                self.record(GROUP_COMPOSE_FULL, COMPOSE_UP, result, started);
            }
        }

        patched.close();
    }

    /// Tag written into the patched manifest: the built image if there is
    /// one, otherwise a fresh tag for the context's version.
    fn patch_tag(&self) -> HarnessResult<String> {
        if let Some(tag) = self.image_tag() {
            return Ok(tag);
        }
        let context = DbContext::new(self.config.db_context_path());
        let version = context.read_version()?;
        Ok(image_tag(&self.config.test_image, &version))
    }

    /// Remove the built image (unless kept) and close the report.
    pub async fn finish(mut self) -> Report {
        if let Some(image) = self.image.take() {
            if self.config.keep_image {
                tracing::info!(tag = %image.tag, "Keeping built image");
            } else {
                image.remove(&self.docker).await;
            }
        }
        self.report.finish();
        std::mem::take(&mut self.report)
    }
}

impl Drop for Suite {
    fn drop(&mut self) {
        let Some(image) = self.image.take() else {
            return;
        };
        if self.config.keep_image {
            return;
        }
        tracing::warn!(tag = %image.tag, "Suite dropped before finish, removing image");
        self.docker.run_blocking(["rmi", "-f", image.tag.as_str()]);
    }
}

async fn stop_container(container: Container) {
    let id = container.id().to_string();
    if let Err(e) = container.stop().await {
        tracing::warn!(container = %id, error = %e, "Failed to remove container");
    }
}
