//! Thin wrapper over the `docker` CLI.

use std::path::Path;
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};
use crate::process::{self, CommandOutput, CommandSpec};

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Handle on the container runtime binary.
#[derive(Debug, Clone)]
pub struct Docker {
    binary: String,
}

impl Docker {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.binary)
    }

    /// `docker build -t <tag> <context>`. The output is returned whatever the exit code.
    pub async fn build(&self, tag: &str, context: &Path) -> HarnessResult<CommandOutput> {
        let spec = self
            .command()
            .args(["build", "-t", tag])
            .arg(context.display().to_string());
        tracing::info!(tag, context = %context.display(), "Building image");
        process::run(&spec).await
    }

    /// `docker image inspect <tag>`.
    pub async fn inspect_image(&self, tag: &str) -> HarnessResult<CommandOutput> {
        process::run(&self.command().args(["image", "inspect", tag])).await
    }

    /// `docker rmi -f <tag>`, best effort.
    pub async fn remove_image(&self, tag: &str) {
        tracing::debug!(tag, "Removing image");
        let spec = self
            .command()
            .args(["rmi", "-f", tag])
            .timeout(CLEANUP_TIMEOUT);
        process::run_quiet(&spec).await;
    }

    /// Run `docker <args..>` to completion on the current thread, output discarded.
    ///
    /// Only for `Drop` fallbacks, where no runtime can be awaited.
    pub fn run_blocking<I, S>(&self, args: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        std::process::Command::new(&self.binary)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// `docker compose -f <file> [-p <project>] <args..>` run from the file's directory.
    pub fn compose(&self, file: &Path, project: Option<&str>) -> CommandSpec {
        let mut spec = self
            .command()
            .args(["compose", "-f"])
            .arg(file.display().to_string());
        if let Some(project) = project {
            spec = spec.args(["-p", project]);
        }
        if let Some(dir) = file.parent() {
            spec = spec.current_dir(dir);
        }
        spec
    }
}

impl Default for Docker {
    fn default() -> Self {
        Self::new()
    }
}

/// Container launch description.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    image: String,
    env: Vec<(String, String)>,
    ports: Vec<u16>,
    labels: Vec<(String, String)>,
    bind_host: String,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: Vec::new(),
            ports: Vec::new(),
            labels: vec![("org.kivoll.verify".to_string(), "true".to_string())],
            bind_host: "127.0.0.1".to_string(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    /// Publish a container port on a random host port.
    pub fn with_exposed_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// Host interface published ports are bound to.
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Arguments for `docker run`.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];

        for (k, v) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", k, v));
        }

        for (k, v) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }

        for port in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{}::{}/tcp", self.bind_host, port));
        }

        args.push(self.image.clone());
        args
    }
}

/// A running container. Call [`Container::stop`] in teardown; dropping an
/// unstopped container force-removes it synchronously as a last resort.
#[derive(Debug)]
pub struct Container {
    id: String,
    image: String,
    docker: Docker,
    stopped: bool,
}

impl Container {
    /// `docker run -d` and return the handle.
    pub async fn start(docker: &Docker, spec: &ContainerSpec) -> HarnessResult<Self> {
        let run = docker.command().args(spec.run_args());
        let output = process::run(&run).await?;
        if !output.success() {
            return Err(HarnessError::Setup(format!(
                "Failed to start container from {}: {}",
                spec.image(),
                output.stderr.trim()
            )));
        }

        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(HarnessError::Setup(format!(
                "docker run for {} printed no container id",
                spec.image()
            )));
        }

        tracing::info!(container = %short_id(&id), image = %spec.image(), "Container started");

        Ok(Self {
            id,
            image: spec.image().to_string(),
            docker: docker.clone(),
            stopped: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Host port bound to `container_port`.
    pub async fn host_port(&self, container_port: u16) -> HarnessResult<u16> {
        let spec = self
            .docker
            .command()
            .args(["port", self.id.as_str()])
            .arg(format!("{}/tcp", container_port));
        let output = process::run_checked(&spec).await?;
        parse_port_mapping(&output.stdout).ok_or_else(|| {
            HarnessError::Setup(format!(
                "No host port published for {}/tcp: {:?}",
                container_port,
                output.stdout.trim()
            ))
        })
    }

    /// Combined stdout and stderr of the container.
    pub async fn logs(&self) -> HarnessResult<String> {
        let spec = self.docker.command().args(["logs", self.id.as_str()]);
        Ok(process::run(&spec).await?.combined())
    }

    /// Force-remove the container and its anonymous volumes.
    pub async fn stop(mut self) -> HarnessResult<()> {
        self.stopped = true;
        let spec = self
            .docker
            .command()
            .args(["rm", "-f", "-v", self.id.as_str()])
            .timeout(CLEANUP_TIMEOUT);
        process::run_checked(&spec).await?;
        tracing::info!(container = %short_id(&self.id), "Container removed");
        Ok(())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        tracing::warn!(container = %short_id(&self.id), "Container dropped without stop, force removing");
        self.docker.run_blocking(["rm", "-f", "-v", self.id.as_str()]);
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Parse the first `host:port` line printed by `docker port`.
pub fn parse_port_mapping(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}
