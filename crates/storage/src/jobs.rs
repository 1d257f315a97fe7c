use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use workfinder_core::types::{Application, CategorySummary, Job, UserSummary};

use crate::applications::ApplicationRow;
use crate::cache::{job_key, shared_jobs_key, ReadThrough, ALL_JOBS_KEY};
use crate::{is_foreign_key_violation, parse_id, to_rfc3339};

const JOB_COLUMNS: &str = "j.id, j.title, j.description, j.company, j.logo, j.status, j.salary, \
     j.location, j.closed, j.client_id, j.created_at, \
     c.id AS category_id, c.title AS category_title, c.icon AS category_icon";

/// Repository for job postings. Listing and detail reads go through the cache.
#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
    cache: ReadThrough,
}

impl JobRepository {
    pub(crate) fn new(pool: SqlitePool, cache: ReadThrough) -> Self {
        Self { pool, cache }
    }

    /// Lists every job with its category.
    pub async fn find_all(&self) -> Result<Vec<Job>, JobError> {
        self.cache
            .get_or_load(ALL_JOBS_KEY, || self.load_all())
            .await
    }

    /// Loads the job aggregate: category, client summary and its applications.
    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Job, JobError> {
        self.cache
            .get_or_load(&job_key(job_id), || self.load_by_id(job_id))
            .await
    }

    /// Loads the job aggregate straight from storage, for decisions that must not
    /// act on a cached `closed` flag.
    pub async fn find_by_id_uncached(&self, job_id: Uuid) -> Result<Job, JobError> {
        self.load_by_id(job_id).await
    }

    /// Lists the jobs posted by `client_id`.
    pub async fn find_shared(&self, client_id: Uuid) -> Result<Vec<Job>, JobError> {
        self.cache
            .get_or_load(&shared_jobs_key(client_id), || self.load_shared(client_id))
            .await
    }

    /// Lists the jobs `applicant_id` holds a live application for. Not cached.
    pub async fn find_applied(&self, applicant_id: Uuid) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} \
               FROM jobs AS j \
               LEFT JOIN categories AS c ON c.id = j.category_id \
              WHERE j.id IN (SELECT job_id FROM job_applicants \
                              WHERE applicant_id = ? AND status <> 'Withdrawn') \
              ORDER BY j.created_at DESC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(applicant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(JobError::from))
            .collect()
    }

    /// Inserts a new open job and invalidates the listings it appears in.
    pub async fn create(&self, job: &NewJob) -> Result<Job, JobError> {
        let id = Uuid::new_v4();
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "INSERT INTO jobs \
             (id, title, description, company, logo, status, salary, location, closed, category_id, client_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.company)
        .bind(&job.logo)
        .bind(&job.status)
        .bind(job.salary)
        .bind(&job.location)
        .bind(job.category_id.map(|value| value.to_string()))
        .bind(job.client_id.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                JobError::MissingReference
            } else {
                JobError::Database(err)
            }
        })?;

        self.invalidate(id, job.client_id).await;
        self.load_by_id(id).await
    }

    /// Applies the non-empty fields of `changes`. The `closed` flag is not writable here.
    pub async fn update(&self, job_id: Uuid, changes: &JobChanges) -> Result<Job, JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET \
                 title = COALESCE(?, title), \
                 description = COALESCE(?, description), \
                 company = COALESCE(?, company), \
                 logo = COALESCE(?, logo), \
                 status = COALESCE(?, status), \
                 salary = COALESCE(?, salary), \
                 location = COALESCE(?, location), \
                 updated_at = ? \
             WHERE id = ?",
        )
        .bind(&changes.title)
        .bind(&changes.description)
        .bind(&changes.company)
        .bind(&changes.logo)
        .bind(&changes.status)
        .bind(changes.salary)
        .bind(&changes.location)
        .bind(to_rfc3339(Utc::now()))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound);
        }

        let job = self.load_by_id(job_id).await?;
        self.invalidate(job.id, job.client_id).await;
        Ok(job)
    }

    /// Evicts every cached view that embeds `job_id`.
    pub async fn invalidate(&self, job_id: Uuid, client_id: Uuid) {
        self.cache
            .invalidate([
                job_key(job_id),
                ALL_JOBS_KEY.to_string(),
                shared_jobs_key(client_id),
            ])
            .await;
    }

    /// Evicts only the detail view of `job_id`.
    pub async fn invalidate_detail(&self, job_id: Uuid) {
        self.cache.invalidate([job_key(job_id)]).await;
    }

    async fn load_all(&self) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} \
               FROM jobs AS j \
               LEFT JOIN categories AS c ON c.id = j.category_id \
              ORDER BY j.created_at DESC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(JobError::from))
            .collect()
    }

    async fn load_shared(&self, client_id: Uuid) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} \
               FROM jobs AS j \
               LEFT JOIN categories AS c ON c.id = j.category_id \
              WHERE j.client_id = ? \
              ORDER BY j.created_at DESC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(client_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(JobError::from))
            .collect()
    }

    async fn load_by_id(&self, job_id: Uuid) -> Result<Job, JobError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS}, u.name AS client_name, u.email AS client_email \
               FROM jobs AS j \
               LEFT JOIN categories AS c ON c.id = j.category_id \
               JOIN users AS u ON u.id = j.client_id \
              WHERE j.id = ?"
        );
        let row = sqlx::query_as::<_, JobDetailRow>(&sql)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobError::NotFound)?;

        let applications = sqlx::query_as::<_, ApplicationRow>(
            "SELECT a.id, a.job_id, a.applicant_id, a.status, a.message, a.created_at, \
                    u.name AS applicant_name, NULL AS applicant_email \
               FROM job_applicants AS a \
               JOIN users AS u ON u.id = a.applicant_id \
              WHERE a.job_id = ? \
              ORDER BY a.created_at ASC, a.rowid ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ApplicationRow::into_domain)
        .collect::<Result<Vec<Application>, sqlx::Error>>()?;

        let mut job = row.job.into_domain()?;
        job.client = Some(UserSummary {
            id: job.client_id,
            name: row.client_name,
            email: Some(row.client_email),
        });
        job.applications = applications;
        Ok(job)
    }
}

/// Data required to post a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub description: Option<String>,
    pub company: Option<String>,
    pub logo: Option<String>,
    pub status: Option<String>,
    pub salary: f64,
    pub location: Option<String>,
    pub category_id: Option<Uuid>,
    pub client_id: Uuid,
}

/// Partial update of a job's content fields; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub company: Option<String>,
    pub logo: Option<String>,
    pub status: Option<String>,
    pub salary: Option<f64>,
    pub location: Option<String>,
}

/// Errors that can occur while reading or writing jobs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found")]
    NotFound,
    #[error("job references a missing client or category")]
    MissingReference,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    title: String,
    description: Option<String>,
    company: Option<String>,
    logo: Option<String>,
    status: Option<String>,
    salary: f64,
    location: Option<String>,
    closed: i64,
    client_id: String,
    created_at: DateTime<Utc>,
    category_id: Option<String>,
    category_title: Option<String>,
    category_icon: Option<String>,
}

impl JobRow {
    fn into_domain(self) -> Result<Job, sqlx::Error> {
        let category = match (self.category_id, self.category_title) {
            (Some(id), Some(title)) => Some(CategorySummary {
                id: parse_id(&id)?,
                title,
                icon: self.category_icon,
            }),
            _ => None,
        };
        Ok(Job {
            id: parse_id(&self.id)?,
            title: self.title,
            description: self.description,
            company: self.company,
            logo: self.logo,
            status: self.status,
            salary: self.salary,
            location: self.location,
            closed: self.closed != 0,
            client_id: parse_id(&self.client_id)?,
            category,
            client: None,
            applications: Vec::new(),
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobDetailRow {
    #[sqlx(flatten)]
    job: JobRow,
    client_name: String,
    client_email: String,
}
