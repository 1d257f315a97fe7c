use std::{fmt, str::FromStr};

use thiserror::Error;
use uuid::Uuid;

use crate::guard::{self, Denied};
use crate::types::{Application, ApplicationStatus, Job, UnknownVariant};

/// Which applications the approval of one application rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectScope {
    /// Only the other applications of the approved application's job.
    #[default]
    SameJob,
    /// Every other non-withdrawn application in the system.
    ///
    /// This includes the `Approved` application of any job closed earlier, which
    /// leaves that job closed with no approved application.
    AllApplications,
}

impl RejectScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SameJob => "job",
            Self::AllApplications => "global",
        }
    }
}

impl fmt::Display for RejectScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectScope {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "job" => Ok(Self::SameJob),
            "global" => Ok(Self::AllApplications),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Business rule violated by a lifecycle request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("job closed")]
    JobClosed,
    #[error("already applied")]
    AlreadyApplied,
    #[error("application is no longer pending")]
    NotPending,
    #[error("application is {from} and cannot become {to}")]
    InvalidTransition {
        from: ApplicationStatus,
        to: ApplicationStatus,
    },
    #[error("{0}")]
    Forbidden(#[from] Denied),
}

impl LifecycleError {
    /// Conflicts describe state that already moved on; the rest are authorization failures.
    pub fn is_conflict(&self) -> bool {
        !matches!(self, Self::Forbidden(_))
    }
}

/// Checks whether `applicant_id` may apply to `job`, given its live application if any.
///
/// Checks run in a fixed order and the first failure wins: closed job, own job,
/// duplicate application.
pub fn ensure_can_apply(
    job: &Job,
    applicant_id: Uuid,
    live_application: Option<&Application>,
) -> Result<(), LifecycleError> {
    if job.closed {
        return Err(LifecycleError::JobClosed);
    }
    guard::require_distinct(applicant_id, job.client_id, Denied::OwnJob)?;
    if live_application.is_some() {
        return Err(LifecycleError::AlreadyApplied);
    }
    Ok(())
}

pub fn ensure_can_withdraw(application: &Application, caller: Uuid) -> Result<(), LifecycleError> {
    guard::require_owner(caller, application.applicant_id)?;
    ensure_transition(application.status, ApplicationStatus::Withdrawn)
}

/// Checks whether `caller` may approve `application` of `job`.
///
/// A closed job is reported before anything else so a repeated approval
/// surfaces as a conflict rather than a second bulk update.
pub fn ensure_can_approve(
    application: &Application,
    job: &Job,
    caller: Uuid,
) -> Result<(), LifecycleError> {
    if job.closed {
        return Err(LifecycleError::JobClosed);
    }
    guard::require_owner(caller, job.client_id)?;
    guard::require_distinct(caller, application.applicant_id, Denied::SelfApproval)?;
    ensure_transition(application.status, ApplicationStatus::Approved)
}

fn ensure_transition(
    from: ApplicationStatus,
    to: ApplicationStatus,
) -> Result<(), LifecycleError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition { from, to })
    }
}
