//! Database image build context: static checks, version tag and build.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::docker::Docker;
use crate::error::{HarnessError, HarnessResult};

/// Init scripts the image must ship.
pub const REQUIRED_INIT_SCRIPTS: [&str; 2] = ["01_create_databases.sh", "02_users.sh"];

/// Instruction that installs the init scripts into the entrypoint directory.
pub const INITDB_COPY: &str = "COPY initdb /docker-entrypoint-initdb.d/";

/// A named static check over the build context.
pub type ContextCheck = (&'static str, fn(&DbContext) -> HarnessResult<()>);

/// All static checks, in the order they are reported.
pub const CONTEXT_CHECKS: [ContextCheck; 5] = [
    ("dockerfile_exists", DbContext::check_dockerfile_exists),
    ("dockerfile_has_healthcheck", DbContext::check_healthcheck),
    ("dockerfile_copies_initdb_scripts", DbContext::check_copies_initdb),
    ("initdb_scripts_exist", DbContext::check_initdb_scripts),
    ("version_file_exists", DbContext::check_version_file),
];

/// The `db/` directory holding the Dockerfile, init scripts and VERSION.
#[derive(Debug, Clone)]
pub struct DbContext {
    root: PathBuf,
}

impl DbContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dockerfile(&self) -> PathBuf {
        self.root.join("Dockerfile")
    }

    pub fn initdb_dir(&self) -> PathBuf {
        self.root.join("initdb")
    }

    pub fn version_file(&self) -> PathBuf {
        self.root.join("VERSION")
    }

    fn read_dockerfile(&self) -> HarnessResult<String> {
        self.check_dockerfile_exists()?;
        Ok(std::fs::read_to_string(self.dockerfile())?)
    }

    pub fn check_dockerfile_exists(&self) -> HarnessResult<()> {
        if !self.dockerfile().is_file() {
            return Err(HarnessError::Check(format!(
                "{} does not exist",
                self.dockerfile().display()
            )));
        }
        Ok(())
    }

    pub fn check_healthcheck(&self) -> HarnessResult<()> {
        let content = self.read_dockerfile()?;
        if !content.contains("HEALTHCHECK") {
            return Err(HarnessError::Check(
                "Dockerfile missing HEALTHCHECK instruction".to_string(),
            ));
        }
        if !content.contains("pg_isready") {
            return Err(HarnessError::Check(
                "HEALTHCHECK should use pg_isready command".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_copies_initdb(&self) -> HarnessResult<()> {
        let content = self.read_dockerfile()?;
        if !content.contains(INITDB_COPY) {
            return Err(HarnessError::Check(format!(
                "Dockerfile should contain `{}`",
                INITDB_COPY
            )));
        }
        Ok(())
    }

    pub fn check_initdb_scripts(&self) -> HarnessResult<()> {
        let dir = self.initdb_dir();
        if !dir.is_dir() {
            return Err(HarnessError::Check(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let mut scripts = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "sh") {
                if let Some(name) = path.file_name() {
                    scripts.push(name.to_string_lossy().into_owned());
                }
            }
        }

        if scripts.is_empty() {
            return Err(HarnessError::Check(format!(
                "No init scripts found in {}",
                dir.display()
            )));
        }

        let missing: Vec<&str> = REQUIRED_INIT_SCRIPTS
            .iter()
            .copied()
            .filter(|required| !scripts.iter().any(|s| s == required))
            .collect();
        if !missing.is_empty() {
            scripts.sort();
            return Err(HarnessError::assertion(
                "Missing init scripts",
                REQUIRED_INIT_SCRIPTS.join(", "),
                scripts.join(", "),
            ));
        }
        Ok(())
    }

    pub fn check_version_file(&self) -> HarnessResult<()> {
        let version = self.read_version_string()?;
        if !version.contains('.') {
            return Err(HarnessError::assertion(
                "VERSION should follow semantic versioning",
                "x.y.z",
                version,
            ));
        }
        Ok(())
    }

    fn read_version_string(&self) -> HarnessResult<String> {
        let path = self.version_file();
        if !path.is_file() {
            return Err(HarnessError::Check(format!("{} does not exist", path.display())));
        }
        let version = std::fs::read_to_string(&path)?.trim().to_string();
        if version.is_empty() {
            return Err(HarnessError::Check(format!("{} is empty", path.display())));
        }
        Ok(version)
    }

    /// Strict `x.y.z` version used for the image tag.
    pub fn read_version(&self) -> HarnessResult<ImageVersion> {
        self.read_version_string()?.parse()
    }
}

/// Semantic version read from `db/VERSION`.
///
/// Displays as the file text, so tags match `VERSION` verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    raw: String,
}

impl ImageVersion {
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ImageVersion {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HarnessError::assertion("VERSION must be digits only", "x.y.z", s);

        let raw = s.trim();
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }

        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            raw: raw.to_string(),
        })
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// `{name}:{version}-{8 hex}` so parallel runs never share a tag.
pub fn image_tag(name: &str, version: &ImageVersion) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}:{}-{}", name, version, &suffix[..8])
}

/// An image built for this run.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub tag: String,
    pub stdout: String,
    pub stderr: String,
}

impl BuiltImage {
    /// Build `context` as `tag`. A failed build is a setup error carrying the build output.
    pub async fn build(docker: &Docker, context: &DbContext, tag: &str) -> HarnessResult<Self> {
        let output = docker.build(tag, context.root()).await?;
        if !output.success() {
            return Err(HarnessError::Setup(format!(
                "Image build failed\nSTDOUT:{}\nSTDERR:{}",
                output.stdout, output.stderr
            )));
        }

        tracing::info!(tag, duration_ms = output.duration_ms, "Image built");

        Ok(Self {
            tag: tag.to_string(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// The tag is set, the runtime knows the image, and the build printed something.
    pub async fn verify(&self, docker: &Docker) -> HarnessResult<()> {
        if self.tag.is_empty() {
            return Err(HarnessError::Check("Built image tag should not be empty".to_string()));
        }

        let inspect = docker.inspect_image(&self.tag).await?;
        if !inspect.success() {
            return Err(HarnessError::Check(format!(
                "Built image {} not found.\nstdout:\n{}\nstderr:\n{}",
                self.tag, inspect.stdout, inspect.stderr
            )));
        }

        if self.stdout.is_empty() && self.stderr.is_empty() {
            return Err(HarnessError::Check("docker build output missing".to_string()));
        }
        Ok(())
    }

    pub async fn remove(self, docker: &Docker) {
        docker.remove_image(&self.tag).await;
    }
}
