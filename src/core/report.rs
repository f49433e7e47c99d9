//! Run report: per-resource outcomes of one convergence run.

use super::error::{ApplyError, InspectionError};
use super::types::ResourceKind;
use std::fmt;
use std::time::Duration;

/// Lifecycle of a convergence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    /// Every resource was attempted or skipped because a dependency failed.
    Completed,
    /// Fail-fast or cancellation left resources unattempted.
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not-started"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Why a resource failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// A predecessor failed; no provider call was made.
    DependencyFailed { dependency: String },
    /// Deferred outputs or attributes could not be resolved.
    Resolve(String),
    Inspection(InspectionError),
    Apply(ApplyError),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { .. } => write!(f, "dependency failed"),
            Self::Resolve(msg) => write!(f, "resolve: {}", msg),
            Self::Inspection(e) => write!(f, "inspect: {}", e),
            Self::Apply(e) => write!(f, "apply: {}", e),
        }
    }
}

/// Final status of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Unchanged,
    Updated,
    Failed(FailureReason),
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::Updated => write!(f, "updated"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Outcome of one attempted resource.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Canonical reference
    pub resource: String,
    pub kind: ResourceKind,
    pub status: OutcomeStatus,
    /// Descriptions of applied changes (empty unless updated)
    pub changes: Vec<String>,
    pub duration: Duration,
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, OutcomeStatus::Failed(_))
    }

    pub fn is_updated(&self) -> bool {
        self.status == OutcomeStatus::Updated
    }

    pub fn is_unchanged(&self) -> bool {
        self.status == OutcomeStatus::Unchanged
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self.status {
            OutcomeStatus::Failed(ref reason) => Some(reason),
            _ => None,
        }
    }
}

/// Everything a run did, in convergence order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    /// Set when a cancellation request stopped the run
    pub cancelled: bool,
    pub outcomes: Vec<Outcome>,
    /// Resources never attempted (fail-fast halt or cancellation)
    pub skipped: Vec<String>,
    pub duration: Duration,
}

impl RunReport {
    /// True iff no attempted resource failed.
    pub fn success(&self) -> bool {
        !self.outcomes.iter().any(Outcome::is_failed)
    }

    pub fn outcome(&self, reference: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.resource == reference)
    }

    pub fn statuses(&self) -> Vec<OutcomeStatus> {
        self.outcomes.iter().map(|o| o.status.clone()).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn updated_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_updated()).count()
    }

    pub fn unchanged_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_unchanged()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for o in &self.outcomes {
            let marker = match o.status {
                OutcomeStatus::Unchanged => "=",
                OutcomeStatus::Updated => "+",
                OutcomeStatus::Failed(_) => "!",
            };
            writeln!(f, "  {} {} {} ({:.2}s)", marker, o.resource, o.status, o.duration.as_secs_f64())?;
            for change in &o.changes {
                writeln!(f, "      {}", change)?;
            }
            if let Some(FailureReason::DependencyFailed { dependency }) = o.failure() {
                writeln!(f, "      upstream: {}", dependency)?;
            }
        }
        for s in &self.skipped {
            writeln!(f, "  - {} skipped", s)?;
        }
        write!(
            f,
            "Run {} {}: {} updated, {} unchanged, {} failed, {} skipped ({:.2}s)",
            self.run_id,
            self.state,
            self.updated_count(),
            self.unchanged_count(),
            self.failed_count(),
            self.skipped.len(),
            self.duration.as_secs_f64()
        )?;
        if self.cancelled {
            write!(f, " [cancelled]")?;
        }
        Ok(())
    }
}
