use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use workfinder_core::types::{Role, User};

use crate::cache::{ReadThrough, ALL_USERS_KEY};
use crate::{is_unique_violation, parse_column, parse_id, to_rfc3339};

const USER_COLUMNS: &str =
    "id, name, email, role, address, phone_number, gender, created_at";

/// Repository for user profiles. Credential hashes never leave this module.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
    cache: ReadThrough,
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool, cache: ReadThrough) -> Self {
        Self { pool, cache }
    }

    /// Lists every user, served from the cache when possible.
    pub async fn find_all(&self) -> Result<Vec<User>, UserError> {
        self.cache
            .get_or_load(ALL_USERS_KEY, || self.load_all())
            .await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<User, UserError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)?;
        Ok(row.into_domain()?)
    }

    async fn load_all(&self) -> Result<Vec<User>, UserError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC");
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(UserError::from))
            .collect()
    }

    /// Inserts a user whose credential has already been hashed upstream.
    pub async fn insert(&self, user: &NewUser) -> Result<User, UserError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let stamp = to_rfc3339(created_at);
        sqlx::query(
            "INSERT INTO users \
             (id, name, email, password_hash, role, address, phone_number, gender, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(&user.address)
        .bind(&user.phone_number)
        .bind(&user.gender)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                UserError::EmailTaken
            } else {
                UserError::Database(err)
            }
        })?;

        self.cache.invalidate([ALL_USERS_KEY]).await;

        Ok(User {
            id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
            address: user.address.clone(),
            phone_number: user.phone_number.clone(),
            gender: user.gender.clone(),
            created_at,
        })
    }
}

/// Data required to register a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub address: Option<String>,
    pub phone_number: Option<String>,
    pub gender: Option<String>,
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("email is already registered")]
    EmailTaken,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    name: String,
    email: String,
    role: String,
    address: Option<String>,
    phone_number: Option<String>,
    gender: Option<String>,
    created_at: DateTime<Utc>,
}

impl UserRow {
    fn into_domain(self) -> Result<User, sqlx::Error> {
        Ok(User {
            id: parse_id(&self.id)?,
            name: self.name,
            email: self.email,
            role: parse_column(&self.role)?,
            address: self.address,
            phone_number: self.phone_number,
            gender: self.gender,
            created_at: self.created_at,
        })
    }
}
