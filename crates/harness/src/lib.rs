//! Kivoll deployment verification
//!
//! Checks the deployment topology of the Kivoll stack against a project
//! checkout.
//!
//! This crate provides:
//! - Database image context checks, build and tagging
//! - A readiness poller for the database container
//! - Role, ownership and membership assertions over the catalog
//! - A permission verifier that classifies statements by SQLSTATE
//! - Compose manifest validation with a patched temporary copy

pub mod compose;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod image;
pub mod permissions;
pub mod process;
pub mod readiness;
pub mod report;
pub mod roles;
pub mod suite;

pub use compose::{ComposeDocument, ComposeProject, PatchedCompose};
pub use config::{Credential, HarnessConfig, TestEnv};
pub use db::{ConnectionFactory, Endpoint};
pub use docker::{Container, ContainerSpec, Docker};
pub use error::{HarnessError, HarnessResult};
pub use image::{BuiltImage, DbContext, ImageVersion};
pub use permissions::{Expectation, Operation, Outcome, PermissionCase, PermissionVerifier};
pub use readiness::{Poller, PostgresProbe, Probe};
pub use report::{CheckOutcome, CheckResult, Report};
pub use roles::{Role, Topology};
pub use suite::Suite;
