//! Kivoll deployment verification CLI.
//!
//! Runs the harness check groups against a project checkout and prints a
//! report. Exits non-zero when any check or setup step failed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kivoll_harness::{HarnessConfig, Report, Suite, TestEnv};

#[derive(Parser)]
#[command(name = "kivollctl")]
#[command(version, about = "Kivoll deployment verification", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root holding db/ and docker-compose.yml
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Env file with admin and role passwords (default: <root>/.env.test)
    #[arg(long, global = true, value_name = "FILE")]
    env_file: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging for the harness
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the database build context, then build and verify the image
    Image,

    /// Start the image and check initialisation, roles and permissions
    Db,

    /// Validate the compose manifest
    Compose {
        /// Also bring the patched stack up and wait for it to be healthy
        #[arg(long)]
        full: bool,
    },

    /// Run every check group
    All {
        /// Include the full compose stack run
        #[arg(long)]
        full: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "info,kivoll_harness=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(command: &Commands, mut suite: Suite) -> Report {
    match command {
        Commands::Image => suite.run_image_suite().await,
        Commands::Db => suite.run_database_suite().await,
        Commands::Compose { full } => suite.run_compose_suite(*full).await,
        Commands::All { full } => {
            suite.run_image_suite().await;
            suite.run_database_suite().await;
            suite.run_compose_suite(*full).await;
        }
    }
    suite.finish().await
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // KIVOLL_* comes from the process environment only; it locates the env file
    let mut config = HarnessConfig::from_env().context("Invalid KIVOLL_* configuration")?;
    if let Some(root) = &cli.root {
        config.project_root = root.display().to_string();
    }

    let env_file = cli
        .env_file
        .clone()
        .unwrap_or_else(|| config.root().join(".env.test"));
    if !env_file.exists() {
        tracing::warn!(file = %env_file.display(), "Env file not found, using defaults");
    }
    let env = TestEnv::load(&env_file).context("Invalid test environment")?;

    tracing::info!(
        root = %config.root().display(),
        image = %config.test_image,
        "Starting verification"
    );

    let suite = Suite::new(config, env);
    let mut work = Box::pin(run(&cli.command, suite));
    let report = tokio::select! {
        report = &mut work => report,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, removing the containers, compose project and image of this run");
            // Dropping the run fires the synchronous teardown of everything it started
            drop(work);
            return Ok(ExitCode::from(130));
        }
    };

    if cli.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.summary());
    }

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
