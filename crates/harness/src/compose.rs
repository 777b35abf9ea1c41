//! Compose manifest validation.
//!
//! The manifest is parsed into an order-preserving YAML value and checked
//! structurally. Anything that needs the real orchestrator runs against a
//! patched copy in a temporary directory; the source file is never written.

use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use crate::docker::Docker;
use crate::error::{HarnessError, HarnessResult};
use crate::process::{self, CommandOutput};

/// Service that runs the database image.
pub const DB_SERVICE: &str = "db";

/// Data directory of the postgres image; `db` must persist it.
pub const DB_DATA_DIR: &str = "/var/lib/postgresql";

const DEPENDENCY_CONDITIONS: [&str; 3] = [
    "service_started",
    "service_healthy",
    "service_completed_successfully",
];

/// A parsed compose manifest.
#[derive(Debug, Clone)]
pub struct ComposeDocument {
    root: Value,
}

impl ComposeDocument {
    /// Read and parse `path`.
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if !path.is_file() {
            return Err(HarnessError::Check(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse manifest text. It must be a mapping with a `services` key.
    pub fn parse(content: &str) -> HarnessResult<Self> {
        let root: Value = serde_yaml::from_str(content)?;
        match &root {
            Value::Null => {
                return Err(HarnessError::Check("Compose file is empty".to_string()));
            }
            Value::Mapping(_) => {}
            other => {
                return Err(HarnessError::assertion(
                    "Compose file root",
                    "a mapping",
                    yaml_kind(other),
                ));
            }
        }

        let document = Self { root };
        if document.root.get("services").is_none() {
            return Err(HarnessError::Check(
                "Compose file missing 'services' key".to_string(),
            ));
        }
        document.services()?;
        Ok(document)
    }

    pub fn services(&self) -> HarnessResult<&Mapping> {
        self.root
            .get("services")
            .and_then(Value::as_mapping)
            .ok_or_else(|| HarnessError::Check("'services' must be a mapping".to_string()))
    }

    pub fn service_names(&self) -> HarnessResult<BTreeSet<String>> {
        Ok(self
            .services()?
            .keys()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    pub fn service(&self, name: &str) -> Option<&Value> {
        self.root.get("services").and_then(|s| s.get(name))
    }

    /// Declared top-level named volumes.
    pub fn named_volumes(&self) -> BTreeSet<String> {
        self.root
            .get("volumes")
            .and_then(Value::as_mapping)
            .map(|m| m.keys().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// `services.db` exists.
    pub fn check_db_service(&self) -> HarnessResult<()> {
        if self.service(DB_SERVICE).is_none() {
            return Err(HarnessError::Check(format!(
                "Missing '{}' service in compose",
                DB_SERVICE
            )));
        }
        Ok(())
    }

    /// `services.db.image` is set and references the custom image.
    pub fn check_db_image(&self, marker: &str) -> HarnessResult<()> {
        self.check_db_service()?;
        let image = self
            .service(DB_SERVICE)
            .and_then(|s| s.get("image"))
            .ok_or_else(|| HarnessError::Check("db service missing image".to_string()))?;
        let image = image
            .as_str()
            .ok_or_else(|| HarnessError::assertion("db image", "a string", yaml_kind(image)))?;
        if !image.contains(marker) {
            return Err(HarnessError::assertion(
                "db should use the custom image",
                format!("an image containing {:?}", marker),
                image,
            ));
        }
        Ok(())
    }

    /// Every service has an `image` or a `build`.
    pub fn check_image_or_build(&self) -> HarnessResult<()> {
        for (name, service) in self.services()? {
            let name = name.as_str().unwrap_or("?");
            if service.get("image").is_none() && service.get("build").is_none() {
                return Err(HarnessError::Check(format!(
                    "Service '{}' has neither image nor build",
                    name
                )));
            }
        }
        Ok(())
    }

    /// `db` defines a healthcheck that is not disabled.
    pub fn check_db_healthcheck(&self) -> HarnessResult<()> {
        self.check_db_service()?;
        let healthcheck = self
            .service(DB_SERVICE)
            .and_then(|s| s.get("healthcheck"))
            .ok_or_else(|| HarnessError::Check("db service missing healthcheck".to_string()))?;
        if is_disabled(healthcheck) {
            return Err(HarnessError::assertion(
                "db healthcheck",
                "enabled",
                "disabled",
            ));
        }
        Ok(())
    }

    /// `db` mounts a volume over its data directory.
    pub fn check_db_data_volume(&self) -> HarnessResult<()> {
        self.check_db_service()?;
        let targets: Vec<String> = self
            .service(DB_SERVICE)
            .and_then(|s| s.get("volumes"))
            .and_then(Value::as_sequence)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(volume_parts)
                    .map(|(_, target)| target)
                    .collect()
            })
            .unwrap_or_default();
        if !targets.iter().any(|t| t.starts_with(DB_DATA_DIR)) {
            return Err(HarnessError::assertion(
                "db data volume",
                format!("a mount under {}", DB_DATA_DIR),
                if targets.is_empty() {
                    "no volumes".to_string()
                } else {
                    targets.join(", ")
                },
            ));
        }
        Ok(())
    }

    /// Healthchecks define a `test` (or are explicitly disabled).
    pub fn check_healthchecks(&self) -> HarnessResult<()> {
        for (name, service) in self.services()? {
            let name = name.as_str().unwrap_or("?");
            let Some(healthcheck) = service.get("healthcheck") else {
                continue;
            };
            if is_disabled(healthcheck) {
                continue;
            }
            match healthcheck.get("test") {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(Value::Sequence(seq)) if !seq.is_empty() => {}
                _ => {
                    return Err(HarnessError::Check(format!(
                        "Service '{}' healthcheck has no test",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Dependencies exist, use a known condition, and never wait on a
    /// disabled healthcheck.
    pub fn check_depends_on(&self) -> HarnessResult<()> {
        let names = self.service_names()?;
        for (name, service) in self.services()? {
            let name = name.as_str().unwrap_or("?");
            for (dependency, condition) in dependencies(service)? {
                if dependency == name {
                    return Err(HarnessError::Check(format!(
                        "Service '{}' depends on itself",
                        name
                    )));
                }
                if !names.contains(&dependency) {
                    return Err(HarnessError::Check(format!(
                        "Service '{}' depends on unknown service '{}'",
                        name, dependency
                    )));
                }
                if !DEPENDENCY_CONDITIONS.contains(&condition.as_str()) {
                    return Err(HarnessError::assertion(
                        format!("Condition of {} -> {}", name, dependency),
                        DEPENDENCY_CONDITIONS.join(" | "),
                        condition,
                    ));
                }
                if condition == "service_healthy" {
                    let disabled = self
                        .service(&dependency)
                        .and_then(|s| s.get("healthcheck"))
                        .is_some_and(is_disabled);
                    if disabled {
                        return Err(HarnessError::Check(format!(
                            "Service '{}' waits for '{}' to be healthy but its healthcheck is disabled",
                            name, dependency
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Services that depend on `db` wait for it to be healthy.
    pub fn check_db_dependents_healthy(&self) -> HarnessResult<()> {
        for (name, service) in self.services()? {
            let name = name.as_str().unwrap_or("?");
            for (dependency, condition) in dependencies(service)? {
                if dependency == DB_SERVICE && condition != "service_healthy" {
                    return Err(HarnessError::assertion(
                        format!("Service '{}' dependency on db", name),
                        "service_healthy",
                        condition,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Volume entries have a target, and named volumes are declared.
    pub fn check_volumes(&self) -> HarnessResult<()> {
        let declared = self.named_volumes();
        for (name, service) in self.services()? {
            let name = name.as_str().unwrap_or("?");
            let Some(volumes) = service.get("volumes") else {
                continue;
            };
            let entries = volumes.as_sequence().ok_or_else(|| {
                HarnessError::Check(format!("Service '{}' volumes must be a list", name))
            })?;
            for entry in entries {
                let (source, target) = volume_parts(entry).ok_or_else(|| {
                    HarnessError::Check(format!(
                        "Service '{}' has a volume without a target: {:?}",
                        name, entry
                    ))
                })?;
                if let Some(source) = source {
                    if is_named_volume(&source) && !declared.contains(&source) {
                        return Err(HarnessError::Check(format!(
                            "Service '{}' mounts undeclared volume '{}' at {}",
                            name, source, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy with `services.db.image` replaced.
    pub fn with_db_image(&self, tag: &str) -> HarnessResult<Self> {
        let mut patched = self.clone();
        let db = patched
            .root
            .get_mut("services")
            .and_then(|s| s.get_mut(DB_SERVICE))
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| HarnessError::Check("Missing 'db' service in compose".to_string()))?;
        db.insert(Value::String("image".to_string()), Value::String(tag.to_string()));
        Ok(patched)
    }

    pub fn to_yaml(&self) -> HarnessResult<String> {
        Ok(serde_yaml::to_string(&self.root)?)
    }
}

fn yaml_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

fn is_disabled(healthcheck: &Value) -> bool {
    healthcheck
        .get("disable")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// `(dependency, condition)` pairs in either short or long form.
fn dependencies(service: &Value) -> HarnessResult<Vec<(String, String)>> {
    match service.get("depends_on") {
        None => Ok(Vec::new()),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| (s.to_string(), "service_started".to_string()))
                    .ok_or_else(|| HarnessError::Check("depends_on entries must be names".to_string()))
            })
            .collect(),
        Some(Value::Mapping(map)) => map
            .iter()
            .map(|(dependency, spec)| -> HarnessResult<(String, String)> {
                let dependency = dependency
                    .as_str()
                    .ok_or_else(|| HarnessError::Check("depends_on keys must be names".to_string()))?;
                let condition = spec
                    .get("condition")
                    .and_then(Value::as_str)
                    .unwrap_or("service_started");
                Ok((dependency.to_string(), condition.to_string()))
            })
            .collect(),
        Some(other) => Err(HarnessError::assertion(
            "depends_on",
            "a list or mapping",
            yaml_kind(other),
        )),
    }
}

/// `(source, target)` of a short (`src:dst[:mode]`) or long form volume.
fn volume_parts(entry: &Value) -> Option<(Option<String>, String)> {
    match entry {
        Value::String(spec) => {
            let mut parts = spec.splitn(3, ':');
            let first = parts.next().filter(|s| !s.is_empty())?;
            match parts.next() {
                Some(target) if !target.is_empty() => Some((Some(first.to_string()), target.to_string())),
                Some(_) => None,
                // Anonymous volume: only a container path
                None => Some((None, first.to_string())),
            }
        }
        Value::Mapping(_) => {
            let target = entry.get("target").and_then(Value::as_str)?;
            let source = match entry.get("type").and_then(Value::as_str) {
                Some("volume") | None => entry.get("source").and_then(Value::as_str).map(str::to_string),
                Some(_) => None,
            };
            Some((source, target.to_string()))
        }
        _ => None,
    }
}

/// Bind mounts start with a path; anything else names a volume.
fn is_named_volume(source: &str) -> bool {
    !(source.starts_with('.')
        || source.starts_with('/')
        || source.starts_with('~')
        || source.starts_with('$'))
}

/// A patched manifest written into its own temporary directory.
#[derive(Debug)]
pub struct PatchedCompose {
    dir: TempDir,
    path: PathBuf,
}

impl PatchedCompose {
    /// Write `document` with the db image replaced by `tag`.
    pub fn write(document: &ComposeDocument, tag: &str) -> HarnessResult<Self> {
        let patched = document.with_db_image(tag)?;
        let dir = tempfile::Builder::new().prefix("compose").tempdir()?;
        let path = dir.path().join(format!("docker-compose-{}.yml", short_suffix()));
        std::fs::write(&path, patched.to_yaml()?)?;
        tracing::debug!(path = %path.display(), tag, "Wrote patched compose file");
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the temporary directory, logging instead of failing.
    pub fn close(self) {
        let dir = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove temp dir");
        }
    }
}

fn short_suffix() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    suffix[..8].to_string()
}

/// `docker compose -f <file> config` must exit 0.
pub async fn compose_config(docker: &Docker, file: &Path) -> HarnessResult<CommandOutput> {
    let spec = docker.compose(file, None).arg("config");
    let output = process::run(&spec).await?;
    if !output.success() {
        return Err(HarnessError::Check(format!(
            "docker compose config failed:\nstdout: {}\nstderr: {}",
            output.stdout, output.stderr
        )));
    }
    Ok(output)
}

/// A uniquely named compose project. Dropping it while up runs a
/// synchronous `down -v`.
#[derive(Debug)]
pub struct ComposeProject {
    pub file: PathBuf,
    pub name: String,
    docker: Docker,
    /// `up` was issued and no `down` has run since.
    started: bool,
}

impl ComposeProject {
    pub fn new(docker: &Docker, file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            name: format!("kivoll_test_{}", short_suffix()),
            docker: docker.clone(),
            started: false,
        }
    }

    /// `up --wait` followed by `down -v` on every path.
    pub async fn up_and_down(&mut self, wait_timeout: Duration) -> HarnessResult<()> {
        let result = self.up_wait(wait_timeout).await;
        self.down().await;
        result
    }

    /// `docker compose up --wait --no-build`, bounded by `wait_timeout` plus a minute.
    pub async fn up_wait(&mut self, wait_timeout: Duration) -> HarnessResult<()> {
        let spec = self
            .docker
            .compose(&self.file, Some(&self.name))
            .args(["up", "--wait", "--wait-timeout"])
            .arg(wait_timeout.as_secs().to_string())
            .arg("--no-build")
            .timeout(wait_timeout + Duration::from_secs(60));

        tracing::info!(project = %self.name, "Starting compose project");
        // Containers may exist even if up never returns
        self.started = true;
        let output = process::run(&spec).await?;
        if !output.success() {
            return Err(HarnessError::Check(format!(
                "docker compose up --wait failed:\nstdout: {}\nstderr: {}",
                output.stdout, output.stderr
            )));
        }
        Ok(())
    }

    /// `docker compose down -v`, best effort.
    pub async fn down(&mut self) {
        let spec = self
            .docker
            .compose(&self.file, Some(&self.name))
            .args(["down", "-v"])
            .timeout(Duration::from_secs(60));
        tracing::info!(project = %self.name, "Stopping compose project");
        process::run_quiet(&spec).await;
        self.started = false;
    }
}

impl Drop for ComposeProject {
    fn drop(&mut self) {
        if !self.started {
            return;
        }
        tracing::warn!(project = %self.name, "Compose project dropped while up, tearing down");
        let file = self.file.display().to_string();
        self.docker
            .run_blocking(["compose", "-f", file.as_str(), "-p", self.name.as_str(), "down", "-v"]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::recording::RecordingDocker;

    const MANIFEST: &str = r#"
services:
  db:
    image: ghcr.io/kivoll/kivoll_db:1.4.2
    env_file: .env
    volumes:
      - db_data:/var/lib/postgresql/data
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U $$POSTGRES_USER"]
      interval: 5s
  worker:
    image: ghcr.io/kivoll/worker:latest
    depends_on:
      db:
        condition: service_healthy
    volumes:
      - ./config:/app/config:ro
  api:
    build: ./api
    depends_on:
      db:
        condition: service_healthy
volumes:
  db_data:
"#;

    fn doc() -> ComposeDocument {
        ComposeDocument::parse(MANIFEST).unwrap()
    }

    #[test]
    fn test_valid_manifest_passes_structure_checks() {
        let doc = doc();
        doc.check_db_service().unwrap();
        doc.check_db_image("kivoll_db").unwrap();
        doc.check_image_or_build().unwrap();
        doc.check_db_healthcheck().unwrap();
        doc.check_db_data_volume().unwrap();
        doc.check_healthchecks().unwrap();
        doc.check_depends_on().unwrap();
        doc.check_db_dependents_healthy().unwrap();
        doc.check_volumes().unwrap();
        assert_eq!(
            doc.service_names().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["api", "db", "worker"]
        );
    }

    #[test]
    fn test_empty_and_serviceless_manifests() {
        let err = ComposeDocument::parse("").unwrap_err();
        assert!(err.to_string().contains("empty"));

        let err = ComposeDocument::parse("version: '3.9'\n").unwrap_err();
        assert!(err.to_string().contains("'services'"));

        let err = ComposeDocument::parse("- a\n- b\n").unwrap_err();
        assert!(matches!(err, HarnessError::Assertion { .. }));

        assert!(matches!(
            ComposeDocument::parse("services: [unclosed").unwrap_err(),
            HarnessError::Yaml(_)
        ));
    }

    #[test]
    fn test_db_image_marker() {
        let doc = ComposeDocument::parse("services:\n  db:\n    image: postgres:18\n").unwrap();
        let err = doc.check_db_image("kivoll_db").unwrap_err();
        assert!(err.to_string().contains("postgres:18"));

        let doc = ComposeDocument::parse("services:\n  db:\n    build: ./db\n").unwrap();
        assert!(doc.check_db_image("kivoll_db").is_err());

        let doc = ComposeDocument::parse("services:\n  web:\n    image: nginx\n").unwrap();
        assert!(doc.check_db_service().is_err());
    }

    #[test]
    fn test_db_dependents_must_wait_for_health() {
        let doc = ComposeDocument::parse(
            "services:\n  db:\n    image: db\n  api:\n    image: api\n    depends_on: [db]\n",
        )
        .unwrap();
        doc.check_depends_on().unwrap();
        let err = doc.check_db_dependents_healthy().unwrap_err();
        assert!(err.to_string().contains("expected service_healthy, got service_started"));
    }

    #[test]
    fn test_db_without_healthcheck_or_data_volume() {
        let doc = ComposeDocument::parse(
            "services:\n  db:\n    image: kivoll_db\n    volumes:\n      - ./backup:/backup\n",
        )
        .unwrap();
        assert!(doc.check_db_healthcheck().is_err());
        let err = doc.check_db_data_volume().unwrap_err();
        assert!(err.to_string().contains("got /backup"));

        let doc = ComposeDocument::parse(
            "services:\n  db:\n    image: kivoll_db\n    healthcheck:\n      disable: true\n",
        )
        .unwrap();
        assert!(matches!(
            doc.check_db_healthcheck().unwrap_err(),
            HarnessError::Assertion { .. }
        ));
        assert!(doc
            .check_db_data_volume()
            .unwrap_err()
            .to_string()
            .contains("no volumes"));
    }

    #[test]
    fn test_depends_on_unknown_service() {
        let doc = ComposeDocument::parse(
            "services:\n  api:\n    image: api\n    depends_on: [cache]\n",
        )
        .unwrap();
        let err = doc.check_depends_on().unwrap_err();
        assert!(err.to_string().contains("unknown service 'cache'"));
    }

    #[test]
    fn test_depends_on_bad_condition() {
        let doc = ComposeDocument::parse(
            "services:\n  db:\n    image: db\n  api:\n    image: api\n    depends_on:\n      db:\n        condition: service_ready\n",
        )
        .unwrap();
        assert!(matches!(
            doc.check_depends_on().unwrap_err(),
            HarnessError::Assertion { .. }
        ));
    }

    #[test]
    fn test_healthy_dependency_on_disabled_healthcheck() {
        let doc = ComposeDocument::parse(
            "services:\n  db:\n    image: db\n    healthcheck:\n      disable: true\n  api:\n    image: api\n    depends_on:\n      db:\n        condition: service_healthy\n",
        )
        .unwrap();
        doc.check_healthchecks().unwrap();
        assert!(doc.check_depends_on().is_err());
    }

    #[test]
    fn test_healthcheck_without_test() {
        let doc = ComposeDocument::parse(
            "services:\n  db:\n    image: db\n    healthcheck:\n      interval: 5s\n",
        )
        .unwrap();
        assert!(doc.check_healthchecks().is_err());
    }

    #[test]
    fn test_undeclared_named_volume() {
        let doc = ComposeDocument::parse(
            "services:\n  db:\n    image: db\n    volumes:\n      - pgdata:/var/lib/postgresql/data\n",
        )
        .unwrap();
        let err = doc.check_volumes().unwrap_err();
        assert!(err.to_string().contains("undeclared volume 'pgdata'"));
    }

    #[test]
    fn test_volume_parts() {
        let parse = |s: &str| volume_parts(&Value::String(s.to_string()));
        assert_eq!(
            parse("./initdb:/docker-entrypoint-initdb.d:ro"),
            Some((Some("./initdb".to_string()), "/docker-entrypoint-initdb.d".to_string()))
        );
        assert_eq!(parse("/var/lib/data"), Some((None, "/var/lib/data".to_string())));
        assert_eq!(parse("data:"), None);

        let long: Value = serde_yaml::from_str("type: bind\nsource: ./x\ntarget: /x\n").unwrap();
        assert_eq!(volume_parts(&long), Some((None, "/x".to_string())));
        assert!(!is_named_volume("./x"));
        assert!(is_named_volume("db_data"));
    }

    #[test]
    fn test_patch_leaves_source_untouched() {
        let doc = doc();
        let patched = doc.with_db_image("kivoll-db-test:1.4.2-deadbeef").unwrap();

        let image = |d: &ComposeDocument| {
            d.service("db")
                .and_then(|s| s.get("image"))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        assert_eq!(image(&doc).as_deref(), Some("ghcr.io/kivoll/kivoll_db:1.4.2"));
        assert_eq!(image(&patched).as_deref(), Some("kivoll-db-test:1.4.2-deadbeef"));
    }

    #[test]
    fn test_patched_copy_round_trips() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("docker-compose.yml");
        std::fs::write(&source, MANIFEST).unwrap();

        let doc = ComposeDocument::load(&source).unwrap();
        let patched = PatchedCompose::write(&doc, "kivoll-db-test:1.4.2-deadbeef").unwrap();

        assert_ne!(patched.path(), source.as_path());
        assert!(patched.path().starts_with(patched.dir()));
        let name = patched.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("docker-compose-") && name.ends_with(".yml"));

        // Re-parsed copy still passes, keeps service order, and the source is unchanged
        let reparsed = ComposeDocument::load(patched.path()).unwrap();
        reparsed.check_depends_on().unwrap();
        reparsed.check_volumes().unwrap();
        let keys: Vec<&str> = reparsed
            .services()
            .unwrap()
            .keys()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(keys, vec!["db", "worker", "api"]);
        assert_eq!(std::fs::read_to_string(&source).unwrap(), MANIFEST);

        let dir = patched.dir().to_path_buf();
        patched.close();
        assert!(!dir.exists());
    }

    #[test]
    fn test_project_names_are_unique() {
        let docker = Docker::new();
        let a = ComposeProject::new(&docker, "/tmp/a.yml");
        let b = ComposeProject::new(&docker, "/tmp/a.yml");
        assert!(a.name.starts_with("kivoll_test_"));
        assert_ne!(a.name, b.name);
    }

    #[tokio::test]
    async fn test_dropped_project_is_torn_down() {
        let dir = tempfile::tempdir().unwrap();
        let fake = RecordingDocker::new(dir.path());
        let file = dir.path().join("docker-compose.yml");

        let mut project = ComposeProject::new(&fake.docker, &file);
        let name = project.name.clone();
        project.up_wait(Duration::from_secs(5)).await.unwrap();
        drop(project);

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains(" up --wait "));
        assert_eq!(
            calls[1],
            format!("compose -f {} -p {} down -v", file.display(), name)
        );
    }

    #[tokio::test]
    async fn test_project_is_torn_down_once() {
        let dir = tempfile::tempdir().unwrap();
        let fake = RecordingDocker::new(dir.path());

        let mut project = ComposeProject::new(&fake.docker, dir.path().join("docker-compose.yml"));
        project.up_and_down(Duration::from_secs(5)).await.unwrap();
        drop(project);

        let downs = fake.calls().iter().filter(|c| c.ends_with("down -v")).count();
        assert_eq!(downs, 1);

        // Never started, nothing to tear down
        drop(ComposeProject::new(&fake.docker, dir.path().join("other.yml")));
        assert_eq!(fake.calls().len(), 2);
    }
}
