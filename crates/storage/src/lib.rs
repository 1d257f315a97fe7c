use std::{str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

pub mod applications;
pub mod cache;
pub mod jobs;
pub mod users;

pub use applications::{ApplicationError, ApplicationRepository, ApprovalOutcome, NewApplication};
pub use cache::{CacheError, CacheStore, MemoryCache, NoopCache, ReadThrough};
pub use jobs::{JobChanges, JobError, JobRepository, NewJob};
pub use users::{NewUser, UserError, UserRepository};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Top-level database handle that owns the SQLite connection pool and the
/// cache used by read repositories.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    cache: ReadThrough,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Reads go straight to SQLite until a cache is attached with [`Database::with_cache`].
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self {
            pool,
            cache: ReadThrough::new(Arc::new(NoopCache), cache::DEFAULT_TTL),
        })
    }

    /// Routes repository reads through `cache`, keeping entries for `ttl`.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        self.cache = ReadThrough::new(cache, ttl);
        self
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for cached job reads and job writes.
    pub fn jobs(&self) -> JobRepository {
        JobRepository::new(self.pool.clone(), self.cache.clone())
    }

    /// Returns a handle for user reads.
    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone(), self.cache.clone())
    }

    /// Returns a handle for application rows. Application reads bypass the cache.
    pub fn applications(&self) -> ApplicationRepository {
        ApplicationRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a TEXT id column, reporting malformed values as row decode failures.
pub(crate) fn parse_id(value: &str) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(value).map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

pub(crate) fn parse_column<T>(value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("2067"),
        _ => false,
    }
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("787"),
        _ => false,
    }
}
