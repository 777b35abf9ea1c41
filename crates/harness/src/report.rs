//! Check results and the run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CheckOutcome {
    Passed,
    Failed { message: String },
    Skipped { reason: String },
}

impl CheckOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        CheckOutcome::Failed {
            message: message.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        CheckOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, CheckOutcome::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CheckOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, CheckOutcome::Skipped { .. })
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOutcome::Passed => write!(f, "passed"),
            CheckOutcome::Failed { .. } => write!(f, "failed"),
            CheckOutcome::Skipped { .. } => write!(f, "skipped"),
        }
    }
}

/// Result of one named check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Group the check belongs to (`image`, `init`, `roles`, ...).
    pub group: String,

    pub name: String,

    #[serde(flatten)]
    pub outcome: CheckOutcome,

    /// Execution duration in milliseconds. Zero for skipped checks.
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        outcome: CheckOutcome,
        duration_ms: u64,
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            outcome,
            duration_ms,
        }
    }

    pub fn skipped(group: impl Into<String>, name: impl Into<String>, reason: &str) -> Self {
        Self::new(group, name, CheckOutcome::skipped(reason), 0)
    }
}

/// Per-outcome totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Counts {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }
}

/// All check results of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    pub checks: Vec<CheckResult>,

    /// Setup steps whose failure skipped dependent checks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_failures: Vec<String>,
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl Report {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            checks: Vec::new(),
            setup_failures: Vec::new(),
        }
    }

    pub fn push(&mut self, result: CheckResult) {
        match &result.outcome {
            CheckOutcome::Passed => {
                tracing::info!(group = %result.group, check = %result.name, duration_ms = result.duration_ms, "PASS");
            }
            CheckOutcome::Failed { message } => {
                tracing::error!(group = %result.group, check = %result.name, %message, "FAIL");
            }
            CheckOutcome::Skipped { reason } => {
                tracing::warn!(group = %result.group, check = %result.name, %reason, "SKIP");
            }
        }
        self.checks.push(result);
    }

    /// Record a failed setup step.
    pub fn setup_failed(&mut self, step: impl Into<String>) {
        let step = step.into();
        if !self.setup_failures.contains(&step) {
            self.setup_failures.push(step);
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn counts(&self) -> Counts {
        self.checks
            .iter()
            .fold(Counts::default(), |mut counts, check| {
                match check.outcome {
                    CheckOutcome::Passed => counts.passed += 1,
                    CheckOutcome::Failed { .. } => counts.failed += 1,
                    CheckOutcome::Skipped { .. } => counts.skipped += 1,
                }
                counts
            })
    }

    pub fn group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a CheckResult> + 'a {
        self.checks.iter().filter(move |c| c.group == group)
    }

    pub fn get(&self, group: &str, name: &str) -> Option<&CheckResult> {
        self.checks
            .iter()
            .find(|c| c.group == group && c.name == name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.outcome.is_failed())
    }

    /// No check failed and no setup step failed.
    ///
    /// Skips alone do not fail a run.
    pub fn is_success(&self) -> bool {
        self.setup_failures.is_empty() && self.failures().next().is_none()
    }

    /// One line per check followed by the totals.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            let detail = match &check.outcome {
                CheckOutcome::Passed => String::new(),
                CheckOutcome::Failed { message } => format!(": {}", message),
                CheckOutcome::Skipped { reason } => format!(" ({})", reason),
            };
            out.push_str(&format!(
                "{:<8} {}/{}{}\n",
                check.outcome.to_string().to_uppercase(),
                check.group,
                check.name,
                detail
            ));
        }
        let counts = self.counts();
        out.push_str(&format!(
            "\n{} passed, {} failed, {} skipped ({} total)\n",
            counts.passed,
            counts.failed,
            counts.skipped,
            counts.total()
        ));
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&serde_json::json!({
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "success": self.is_success(),
            "counts": self.counts(),
            "setup_failures": self.setup_failures,
            "checks": self.checks,
        }))
    }
}
