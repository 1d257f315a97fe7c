use axum::http::StatusCode;
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use workfinder_core::guard::{self, Denied};
use workfinder_core::lifecycle::{self, LifecycleError, RejectScope};
use workfinder_core::types::{Application, Identity, Role};
use workfinder_storage::{ApplicationError, Database, JobError, NewApplication};

use crate::response::ApiError;

/// Drives applications through `Pending -> Approved | Rejected | Withdrawn`.
///
/// Every operation takes the caller's [`Identity`] explicitly; role checks run
/// first, then the preconditions of the operation in their documented order.
#[derive(Clone)]
pub struct ApplicationLifecycle {
    database: Database,
    reject_scope: RejectScope,
}

impl ApplicationLifecycle {
    pub fn new(database: Database, reject_scope: RejectScope) -> Self {
        Self {
            database,
            reject_scope,
        }
    }

    /// Creates a `Pending` application of `caller` for `job_id`.
    pub async fn apply(
        &self,
        caller: &Identity,
        job_id: Uuid,
        message: &str,
    ) -> Result<Application, LifecycleServiceError> {
        let result = self.apply_inner(caller, job_id, message).await;
        record("apply", &result);
        if let Ok(application) = &result {
            info!(
                stage = "lifecycle",
                application_id = %application.id,
                %job_id,
                applicant_id = %caller.id,
                "application submitted"
            );
        }
        result
    }

    async fn apply_inner(
        &self,
        caller: &Identity,
        job_id: Uuid,
        message: &str,
    ) -> Result<Application, LifecycleServiceError> {
        guard::require_role(caller, &[Role::Applicant])?;

        let jobs = self.database.jobs();
        let job = jobs.find_by_id_uncached(job_id).await?;
        let applications = self.database.applications();
        let live = applications.find_live(job_id, caller.id).await?;
        lifecycle::ensure_can_apply(&job, caller.id, live.as_ref())?;

        // The insert re-checks both the live pair and the open job.
        let application = applications
            .insert(&NewApplication {
                job_id,
                applicant_id: caller.id,
                message,
            })
            .await?;

        jobs.invalidate_detail(job_id).await;
        Ok(application)
    }

    /// Withdraws the caller's own `Pending` application.
    pub async fn withdraw(
        &self,
        caller: &Identity,
        application_id: Uuid,
    ) -> Result<bool, LifecycleServiceError> {
        let result = self.withdraw_inner(caller, application_id).await;
        record("withdraw", &result);
        if result.is_ok() {
            info!(stage = "lifecycle", %application_id, applicant_id = %caller.id, "application withdrawn");
        }
        result
    }

    async fn withdraw_inner(
        &self,
        caller: &Identity,
        application_id: Uuid,
    ) -> Result<bool, LifecycleServiceError> {
        guard::require_role(caller, &[Role::Applicant])?;

        let applications = self.database.applications();
        let application = applications
            .find_by_id(application_id)
            .await?
            .ok_or(LifecycleServiceError::NotFound("application"))?;
        lifecycle::ensure_can_withdraw(&application, caller.id)?;

        applications.withdraw(application_id).await?;
        self.database
            .jobs()
            .invalidate_detail(application.job_id)
            .await;
        Ok(true)
    }

    /// Approves an application, closing its job and rejecting the applications
    /// selected by the configured [`RejectScope`] in one transaction.
    pub async fn approve(
        &self,
        caller: &Identity,
        application_id: Uuid,
    ) -> Result<Application, LifecycleServiceError> {
        let result = self.approve_inner(caller, application_id).await;
        record("approve", &result);
        if let Ok(application) = &result {
            info!(
                stage = "lifecycle",
                %application_id,
                job_id = %application.job_id,
                client_id = %caller.id,
                scope = %self.reject_scope,
                "application approved"
            );
        }
        result
    }

    async fn approve_inner(
        &self,
        caller: &Identity,
        application_id: Uuid,
    ) -> Result<Application, LifecycleServiceError> {
        guard::require_role(caller, &[Role::Client])?;

        let applications = self.database.applications();
        let application = applications
            .find_by_id(application_id)
            .await?
            .ok_or(LifecycleServiceError::NotFound("application"))?;
        let jobs = self.database.jobs();
        let job = jobs.find_by_id_uncached(application.job_id).await?;
        lifecycle::ensure_can_approve(&application, &job, caller.id)?;

        let outcome = applications
            .approve(application_id, job.id, self.reject_scope)
            .await
            .map_err(|err| {
                if matches!(err, ApplicationError::JobAlreadyClosed) {
                    warn!(stage = "lifecycle", %application_id, job_id = %job.id, "lost approval race");
                }
                LifecycleServiceError::from(err)
            })?;

        jobs.invalidate(job.id, job.client_id).await;
        for affected in outcome.affected_jobs.iter().filter(|id| **id != job.id) {
            jobs.invalidate_detail(*affected).await;
        }
        Ok(outcome.application)
    }

    /// Loads an application with its applicant's public profile.
    pub async fn find_by_id(
        &self,
        application_id: Uuid,
    ) -> Result<Application, LifecycleServiceError> {
        self.database
            .applications()
            .find_by_id(application_id)
            .await?
            .ok_or(LifecycleServiceError::NotFound("application"))
    }
}

fn record<T>(op: &'static str, result: &Result<T, LifecycleServiceError>) {
    let label = match result {
        Ok(_) => "ok",
        Err(err) => err.result_label(),
    };
    counter!("lifecycle_operations_total", "op" => op, "result" => label).increment(1);
}

#[derive(Debug, Error)]
pub enum LifecycleServiceError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Rejected(#[from] LifecycleError),
    #[error("job storage failed: {0}")]
    Jobs(#[source] JobError),
    #[error("application storage failed: {0}")]
    Applications(#[source] ApplicationError),
}

impl LifecycleServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Rejected(err) if err.is_conflict() => StatusCode::CONFLICT,
            Self::Rejected(_) => StatusCode::FORBIDDEN,
            Self::Jobs(_) | Self::Applications(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn result_label(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Rejected(err) if err.is_conflict() => "conflict",
            Self::Rejected(_) => "forbidden",
            Self::Jobs(_) | Self::Applications(_) => "error",
        }
    }
}

impl From<Denied> for LifecycleServiceError {
    fn from(value: Denied) -> Self {
        Self::Rejected(LifecycleError::Forbidden(value))
    }
}

impl From<JobError> for LifecycleServiceError {
    fn from(value: JobError) -> Self {
        match value {
            JobError::NotFound => Self::NotFound("job"),
            other => Self::Jobs(other),
        }
    }
}

impl From<ApplicationError> for LifecycleServiceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::NotFound => Self::NotFound("application"),
            ApplicationError::MissingReference => Self::NotFound("job or applicant"),
            ApplicationError::Duplicate => Self::Rejected(LifecycleError::AlreadyApplied),
            ApplicationError::JobAlreadyClosed => Self::Rejected(LifecycleError::JobClosed),
            ApplicationError::NotPending => Self::Rejected(LifecycleError::NotPending),
            other => Self::Applications(other),
        }
    }
}

impl From<LifecycleServiceError> for ApiError {
    fn from(value: LifecycleServiceError) -> Self {
        let status = value.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            ApiError::internal(&value)
        } else {
            ApiError::new(status, value.to_string())
        }
    }
}
