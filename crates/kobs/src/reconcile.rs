//! Decides what to do with a job after a status change.
//!
//! Two observations are compared by their [`JobSnapshot`] rather than the whole
//! object, so resource version bumps and other metadata churn do not count as
//! a change.

use std::fmt;

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;

use crate::job::DEFAULT_NAMESPACE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Running,
    Suspended,
    Complete,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobPhase::Pending => "Pending",
            JobPhase::Running => "Running",
            JobPhase::Suspended => "Suspended",
            JobPhase::Complete => "Complete",
            JobPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// The status fields that matter for cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSnapshot {
    pub phase: JobPhase,
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
}

impl JobSnapshot {
    pub fn of(job: &Job) -> Self {
        let status = job.status.as_ref();
        let active = status.and_then(|s| s.active).unwrap_or(0);
        let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
        let failed = status.and_then(|s| s.failed).unwrap_or(0);

        let condition = |kind: &str| {
            status
                .and_then(|s| s.conditions.as_ref())
                .map(|conds| conds.iter().any(|c| c.type_ == kind && c.status == "True"))
                .unwrap_or(false)
        };

        let phase = if condition("Complete") {
            JobPhase::Complete
        } else if condition("Failed") {
            JobPhase::Failed
        } else if condition("Suspended") {
            JobPhase::Suspended
        } else if active > 0 {
            JobPhase::Running
        } else {
            JobPhase::Pending
        };

        Self {
            phase,
            active,
            succeeded,
            failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Redelivery or metadata-only update.
    Unchanged,
    /// Pods are still running.
    StillActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Ignore(SkipReason),
    Delete { name: String, namespace: String },
}

pub fn reconcile(previous: &Job, current: &Job) -> Action {
    let before = JobSnapshot::of(previous);
    let after = JobSnapshot::of(current);

    if before == after {
        return Action::Ignore(SkipReason::Unchanged);
    }
    if after.active > 0 {
        return Action::Ignore(SkipReason::StillActive);
    }

    Action::Delete {
        name: current.name_any(),
        namespace: current
            .namespace()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
    }
}
