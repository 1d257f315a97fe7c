use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use workfinder_core::lifecycle::RejectScope;
use workfinder_core::types::{Application, ApplicationStatus, UserSummary};

use crate::{is_foreign_key_violation, is_unique_violation, parse_column, parse_id, to_rfc3339};

const SELECT_WITH_APPLICANT: &str =
    "SELECT a.id, a.job_id, a.applicant_id, a.status, a.message, a.created_at, \
            u.name AS applicant_name, u.email AS applicant_email \
       FROM job_applicants AS a \
       JOIN users AS u ON u.id = a.applicant_id \
      WHERE a.id = ?";

/// Repository for application rows. Reads here never consult the cache.
#[derive(Clone)]
pub struct ApplicationRepository {
    pool: SqlitePool,
}

impl ApplicationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persists a new `Pending` application.
    ///
    /// A live application for the same (job, applicant) pair makes the insert fail
    /// with [`ApplicationError::Duplicate`], even when the caller's pre-check raced.
    /// The row is only written while the job is open, so an apply that lost a race
    /// against an approval gets [`ApplicationError::JobAlreadyClosed`].
    pub async fn insert(&self, record: &NewApplication<'_>) -> Result<Application, ApplicationError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let stamp = to_rfc3339(created_at);
        let result = sqlx::query(
            "INSERT INTO job_applicants \
             (id, job_id, applicant_id, status, message, created_at, updated_at) \
             SELECT ?, ?, ?, ?, ?, ?, ? \
              WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ? AND closed = 0)",
        )
        .bind(id.to_string())
        .bind(record.job_id.to_string())
        .bind(record.applicant_id.to_string())
        .bind(ApplicationStatus::Pending.as_str())
        .bind(record.message)
        .bind(&stamp)
        .bind(&stamp)
        .bind(record.job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                ApplicationError::Duplicate
            } else if is_foreign_key_violation(&err) {
                ApplicationError::MissingReference
            } else {
                ApplicationError::Database(err)
            }
        })?;

        if result.rows_affected() == 0 {
            let job = sqlx::query("SELECT 1 FROM jobs WHERE id = ?")
                .bind(record.job_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            return Err(match job {
                Some(_) => ApplicationError::JobAlreadyClosed,
                None => ApplicationError::MissingReference,
            });
        }

        Ok(Application {
            id,
            job_id: record.job_id,
            applicant_id: record.applicant_id,
            status: ApplicationStatus::Pending,
            message: record.message.to_string(),
            applicant: None,
            created_at,
        })
    }

    /// Loads an application with its applicant's public profile (id, name, email).
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Application>, ApplicationError> {
        let row = sqlx::query_as::<_, ApplicationRow>(SELECT_WITH_APPLICANT)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(ApplicationRow::into_domain)
            .transpose()
            .map_err(ApplicationError::from)
    }

    /// Returns the non-withdrawn application of `applicant_id` for `job_id`, if any.
    pub async fn find_live(
        &self,
        job_id: Uuid,
        applicant_id: Uuid,
    ) -> Result<Option<Application>, ApplicationError> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            "SELECT a.id, a.job_id, a.applicant_id, a.status, a.message, a.created_at, \
                    NULL AS applicant_name, NULL AS applicant_email \
               FROM job_applicants AS a \
              WHERE a.job_id = ? AND a.applicant_id = ? AND a.status <> 'Withdrawn'",
        )
        .bind(job_id.to_string())
        .bind(applicant_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ApplicationRow::into_domain)
            .transpose()
            .map_err(ApplicationError::from)
    }

    /// Moves a `Pending` application to `Withdrawn`.
    pub async fn withdraw(&self, id: Uuid) -> Result<(), ApplicationError> {
        let result = sqlx::query(
            "UPDATE job_applicants SET status = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(ApplicationStatus::Withdrawn.as_str())
        .bind(to_rfc3339(Utc::now()))
        .bind(id.to_string())
        .bind(ApplicationStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ApplicationError::NotPending);
        }
        Ok(())
    }

    /// Approves `application_id` of `job_id` as one atomic unit: the job is closed,
    /// the application approved, and the applications selected by `scope` rejected.
    ///
    /// The job is closed with a conditional write first, so of two racing approvals
    /// only one can commit; the other gets [`ApplicationError::JobAlreadyClosed`].
    pub async fn approve(
        &self,
        application_id: Uuid,
        job_id: Uuid,
        scope: RejectScope,
    ) -> Result<ApprovalOutcome, ApplicationError> {
        let mut tx = self.pool.begin().await?;
        let stamp = to_rfc3339(Utc::now());

        let closed = sqlx::query(
            "UPDATE jobs SET closed = 1, updated_at = ? WHERE id = ? AND closed = 0",
        )
        .bind(&stamp)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;
        if closed.rows_affected() == 0 {
            return Err(ApplicationError::JobAlreadyClosed);
        }

        let approved = sqlx::query(
            "UPDATE job_applicants SET status = ?, updated_at = ? \
             WHERE id = ? AND job_id = ? AND status = ?",
        )
        .bind(ApplicationStatus::Approved.as_str())
        .bind(&stamp)
        .bind(application_id.to_string())
        .bind(job_id.to_string())
        .bind(ApplicationStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;
        if approved.rows_affected() == 0 {
            return Err(ApplicationError::NotPending);
        }

        let rejected_jobs = reject_others(&mut tx, application_id, job_id, scope, &stamp).await?;

        // Read inside the unit; nothing fallible runs after commit.
        let application = sqlx::query_as::<_, ApplicationRow>(SELECT_WITH_APPLICANT)
            .bind(application_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ApplicationError::NotFound)?
            .into_domain()?;

        tx.commit().await?;

        let mut affected_jobs: BTreeSet<Uuid> = rejected_jobs;
        affected_jobs.insert(job_id);
        Ok(ApprovalOutcome {
            application,
            affected_jobs: affected_jobs.into_iter().collect(),
        })
    }
}

async fn reject_others(
    tx: &mut Transaction<'_, Sqlite>,
    application_id: Uuid,
    job_id: Uuid,
    scope: RejectScope,
    stamp: &str,
) -> Result<BTreeSet<Uuid>, ApplicationError> {
    let rows = match scope {
        RejectScope::SameJob => {
            sqlx::query(
                "UPDATE job_applicants SET status = ?, updated_at = ? \
                 WHERE job_id = ? AND id <> ? AND status = ? \
                 RETURNING job_id",
            )
            .bind(ApplicationStatus::Rejected.as_str())
            .bind(stamp)
            .bind(job_id.to_string())
            .bind(application_id.to_string())
            .bind(ApplicationStatus::Pending.as_str())
            .fetch_all(&mut **tx)
            .await?
        }
        RejectScope::AllApplications => {
            sqlx::query(
                "UPDATE job_applicants SET status = ?, updated_at = ? \
                 WHERE id <> ? AND status <> ? \
                 RETURNING job_id",
            )
            .bind(ApplicationStatus::Rejected.as_str())
            .bind(stamp)
            .bind(application_id.to_string())
            .bind(ApplicationStatus::Withdrawn.as_str())
            .fetch_all(&mut **tx)
            .await?
        }
    };

    rows.iter()
        .map(|row| parse_id(&row.get::<String, _>("job_id")).map_err(ApplicationError::from))
        .collect()
}

/// Payload required to create an application.
pub struct NewApplication<'a> {
    pub job_id: Uuid,
    pub applicant_id: Uuid,
    pub message: &'a str,
}

/// Result of a committed approval.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub application: Application,
    /// Jobs whose applications changed status, including the approved one's job.
    pub affected_jobs: Vec<Uuid>,
}

/// Errors that can occur while mutating applications.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("application not found")]
    NotFound,
    #[error("a live application for this job and applicant already exists")]
    Duplicate,
    #[error("application references a missing job or applicant")]
    MissingReference,
    #[error("application is no longer pending")]
    NotPending,
    #[error("job is already closed")]
    JobAlreadyClosed,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Application row joined with optional applicant profile columns.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ApplicationRow {
    id: String,
    job_id: String,
    applicant_id: String,
    status: String,
    message: String,
    created_at: DateTime<Utc>,
    applicant_name: Option<String>,
    applicant_email: Option<String>,
}

impl ApplicationRow {
    pub(crate) fn into_domain(self) -> Result<Application, sqlx::Error> {
        let applicant_id = parse_id(&self.applicant_id)?;
        let applicant = self.applicant_name.map(|name| UserSummary {
            id: applicant_id,
            name,
            email: self.applicant_email,
        });
        Ok(Application {
            id: parse_id(&self.id)?,
            job_id: parse_id(&self.job_id)?,
            applicant_id,
            status: parse_column(&self.status)?,
            message: self.message,
            applicant,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_job, insert_user, setup_db};
    use crate::Database;
    use workfinder_core::types::Role;

    async fn apply(db: &Database, job_id: Uuid, applicant_id: Uuid) -> Application {
        db.applications()
            .insert(&NewApplication {
                job_id,
                applicant_id,
                message: "pick me",
            })
            .await
            .expect("apply")
    }

    async fn status_of(db: &Database, id: Uuid) -> ApplicationStatus {
        db.applications()
            .find_by_id(id)
            .await
            .expect("find")
            .expect("exists")
            .status
    }

    async fn job_closed(db: &Database, job_id: Uuid) -> bool {
        let row: (i64,) = sqlx::query_as("SELECT closed FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_one(db.pool())
            .await
            .expect("closed flag");
        row.0 != 0
    }

    #[tokio::test]
    async fn insert_and_find_populates_applicant_profile() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let pete = insert_user(&db, "Pete", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;

        let created = apply(&db, job, pete).await;
        assert_eq!(created.status, ApplicationStatus::Pending);

        let loaded = db
            .applications()
            .find_by_id(created.id)
            .await
            .expect("find")
            .expect("exists");
        let applicant = loaded.applicant.expect("applicant summary");
        assert_eq!(applicant.id, pete);
        assert_eq!(applicant.name, "Pete");
        assert_eq!(applicant.email.as_deref(), Some("pete@example.com"));
        assert_eq!(loaded.message, "pick me");
    }

    #[tokio::test]
    async fn duplicate_live_application_is_rejected_by_storage() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let pete = insert_user(&db, "Pete", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;
        apply(&db, job, pete).await;

        let err = db
            .applications()
            .insert(&NewApplication {
                job_id: job,
                applicant_id: pete,
                message: "again",
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Duplicate));
    }

    #[tokio::test]
    async fn withdrawn_application_frees_the_pair() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let pete = insert_user(&db, "Pete", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;
        let first = apply(&db, job, pete).await;

        db.applications().withdraw(first.id).await.expect("withdraw");
        assert_eq!(status_of(&db, first.id).await, ApplicationStatus::Withdrawn);
        assert!(db
            .applications()
            .find_live(job, pete)
            .await
            .expect("find live")
            .is_none());

        let second = apply(&db, job, pete).await;
        assert_ne!(second.id, first.id);
        assert!(matches!(
            db.applications().withdraw(first.id).await,
            Err(ApplicationError::NotPending)
        ));
    }

    #[tokio::test]
    async fn approve_closes_job_and_rejects_same_job_applications() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let p1 = insert_user(&db, "Pete", Role::Applicant).await;
        let p2 = insert_user(&db, "Paula", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;
        let other_job = insert_job(&db, client, "Other").await;
        let a1 = apply(&db, job, p1).await;
        let a2 = apply(&db, job, p2).await;
        let elsewhere = apply(&db, other_job, p2).await;

        let outcome = db
            .applications()
            .approve(a1.id, job, RejectScope::SameJob)
            .await
            .expect("approve");
        assert_eq!(outcome.application.status, ApplicationStatus::Approved);
        assert_eq!(outcome.affected_jobs, vec![job]);

        assert_eq!(status_of(&db, a2.id).await, ApplicationStatus::Rejected);
        assert_eq!(status_of(&db, elsewhere.id).await, ApplicationStatus::Pending);
        assert!(job_closed(&db, job).await);
        assert!(!job_closed(&db, other_job).await);
    }

    #[tokio::test]
    async fn approve_with_global_scope_rejects_every_other_application() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let p1 = insert_user(&db, "Pete", Role::Applicant).await;
        let p2 = insert_user(&db, "Paula", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;
        let other_job = insert_job(&db, client, "Other").await;
        let a1 = apply(&db, job, p1).await;
        let a2 = apply(&db, job, p2).await;
        let elsewhere = apply(&db, other_job, p1).await;

        let outcome = db
            .applications()
            .approve(a1.id, job, RejectScope::AllApplications)
            .await
            .expect("approve");

        assert_eq!(status_of(&db, a1.id).await, ApplicationStatus::Approved);
        assert_eq!(status_of(&db, a2.id).await, ApplicationStatus::Rejected);
        assert_eq!(status_of(&db, elsewhere.id).await, ApplicationStatus::Rejected);
        assert!(outcome.affected_jobs.contains(&other_job));
        assert!(outcome.affected_jobs.contains(&job));
        // Only the approved application's job closes.
        assert!(!job_closed(&db, other_job).await);
    }

    #[tokio::test]
    async fn global_scope_also_rejects_earlier_approvals() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let p1 = insert_user(&db, "Pete", Role::Applicant).await;
        let p2 = insert_user(&db, "Paula", Role::Applicant).await;
        let earlier_job = insert_job(&db, client, "Earlier").await;
        let job = insert_job(&db, client, "Job").await;
        let earlier = apply(&db, earlier_job, p1).await;
        db.applications()
            .approve(earlier.id, earlier_job, RejectScope::AllApplications)
            .await
            .expect("first approval");

        let current = apply(&db, job, p2).await;
        db.applications()
            .approve(current.id, job, RejectScope::AllApplications)
            .await
            .expect("second approval");

        assert_eq!(status_of(&db, current.id).await, ApplicationStatus::Approved);
        assert_eq!(status_of(&db, earlier.id).await, ApplicationStatus::Rejected);
        assert!(job_closed(&db, earlier_job).await);
    }

    #[tokio::test]
    async fn second_approval_conflicts_without_touching_rows() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let p1 = insert_user(&db, "Pete", Role::Applicant).await;
        let p2 = insert_user(&db, "Paula", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;
        let a1 = apply(&db, job, p1).await;
        let a2 = apply(&db, job, p2).await;

        db.applications()
            .approve(a1.id, job, RejectScope::SameJob)
            .await
            .expect("first approval");
        let err = db
            .applications()
            .approve(a2.id, job, RejectScope::SameJob)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::JobAlreadyClosed));
        assert_eq!(status_of(&db, a1.id).await, ApplicationStatus::Approved);
        assert_eq!(status_of(&db, a2.id).await, ApplicationStatus::Rejected);
    }

    #[tokio::test]
    async fn insert_after_approval_is_refused_on_closed_job() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let p1 = insert_user(&db, "Pete", Role::Applicant).await;
        let p2 = insert_user(&db, "Paula", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;
        let a1 = apply(&db, job, p1).await;

        db.applications()
            .approve(a1.id, job, RejectScope::SameJob)
            .await
            .expect("approve");

        let err = db
            .applications()
            .insert(&NewApplication {
                job_id: job,
                applicant_id: p2,
                message: "too late",
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::JobAlreadyClosed));
        assert!(db
            .applications()
            .find_live(job, p2)
            .await
            .expect("find live")
            .is_none());
    }

    #[tokio::test]
    async fn insert_for_unknown_job_is_a_missing_reference() {
        let db = setup_db().await;
        let pete = insert_user(&db, "Pete", Role::Applicant).await;

        let err = db
            .applications()
            .insert(&NewApplication {
                job_id: Uuid::new_v4(),
                applicant_id: pete,
                message: "",
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::MissingReference));
    }

    #[tokio::test]
    async fn approval_returns_the_approved_application_with_profile() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let pete = insert_user(&db, "Pete", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;
        let created = apply(&db, job, pete).await;

        let outcome = db
            .applications()
            .approve(created.id, job, RejectScope::SameJob)
            .await
            .expect("approve");
        assert_eq!(outcome.application.id, created.id);
        assert_eq!(outcome.application.status, ApplicationStatus::Approved);
        assert_eq!(outcome.application.message, "pick me");
        let applicant = outcome.application.applicant.expect("applicant summary");
        assert_eq!(applicant.name, "Pete");
    }

    #[tokio::test]
    async fn failed_approval_rolls_back_job_close() {
        let db = setup_db().await;
        let client = insert_user(&db, "Carol", Role::Client).await;
        let p1 = insert_user(&db, "Pete", Role::Applicant).await;
        let p2 = insert_user(&db, "Paula", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;
        let a1 = apply(&db, job, p1).await;
        let a2 = apply(&db, job, p2).await;
        db.applications().withdraw(a1.id).await.expect("withdraw");

        // The job close succeeds inside the unit, the approval step does not.
        let err = db
            .applications()
            .approve(a1.id, job, RejectScope::SameJob)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::NotPending));
        assert!(!job_closed(&db, job).await);
        assert_eq!(status_of(&db, a2.id).await, ApplicationStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_approvals_commit_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("race.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");

        let client = insert_user(&db, "Carol", Role::Client).await;
        let p1 = insert_user(&db, "Pete", Role::Applicant).await;
        let p2 = insert_user(&db, "Paula", Role::Applicant).await;
        let job = insert_job(&db, client, "Job").await;
        let a1 = apply(&db, job, p1).await;
        let a2 = apply(&db, job, p2).await;

        let first = db.applications();
        let second = db.applications();
        let (left, right) = tokio::join!(
            tokio::spawn(async move { first.approve(a1.id, job, RejectScope::SameJob).await }),
            tokio::spawn(async move { second.approve(a1.id, job, RejectScope::SameJob).await }),
        );
        let results = [left.expect("join"), right.expect("join")];
        let committed = results.iter().filter(|result| result.is_ok()).count();
        let conflicted = results
            .iter()
            .filter(|result| matches!(result, Err(ApplicationError::JobAlreadyClosed)))
            .count();
        assert_eq!(committed, 1);
        assert_eq!(conflicted, 1);

        assert!(job_closed(&db, job).await);
        assert_eq!(status_of(&db, a1.id).await, ApplicationStatus::Approved);
        assert_eq!(status_of(&db, a2.id).await, ApplicationStatus::Rejected);
    }
}
