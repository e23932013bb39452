use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;

use super::{MovieStore, PermissionStore, StoreError, StoreResult, TokenStore, UserStore};
use crate::config::DbConfig;
use crate::models::{Filters, Metadata, Movie, Password, Permissions, Runtime, User};
use crate::tokens::{Scope, Token};

const USERS_EMAIL_KEY: &str = "users_email_key";

/// Postgres backend. Every statement runs under `query_timeout`; an
/// expired deadline drops the in-flight query and reports
/// [`StoreError::Timeout`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    query_timeout: Duration,
}

#[derive(sqlx::FromRow)]
struct MovieRow {
    id: i64,
    created_at: DateTime<Utc>,
    title: String,
    year: i32,
    runtime: i32,
    genres: Vec<String>,
    version: i32,
}

impl From<MovieRow> for Movie {
    fn from(row: MovieRow) -> Self {
        Movie {
            id: row.id,
            created_at: row.created_at,
            title: row.title,
            year: row.year,
            runtime: Runtime(row.runtime),
            genres: row.genres,
            version: row.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    created_at: DateTime<Utc>,
    name: String,
    email: String,
    password_hash: Vec<u8>,
    activated: bool,
    version: i32,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let hash = String::from_utf8(row.password_hash)
            .map_err(|e| StoreError::CorruptHash(e.to_string()))?;
        Ok(User {
            id: row.id,
            created_at: row.created_at,
            name: row.name,
            email: row.email,
            password: Password::from_hash(hash),
            activated: row.activated,
            version: row.version,
        })
    }
}

fn map_email_conflict(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.constraint() == Some(USERS_EMAIL_KEY) => {
            StoreError::DuplicateEmail
        }
        _ => StoreError::from(err),
    }
}

impl PostgresStore {
    /// Open a pool and make sure the database answers before returning.
    pub async fn connect(dsn: &str, config: &DbConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .idle_timeout(config.max_idle_time)
            .acquire_timeout(Duration::from_secs(5))
            .connect(dsn)
            .await
            .map_err(StoreError::Database)?;

        let store = Self::new(pool, config.query_timeout);
        store
            .bounded(sqlx::query("SELECT 1").execute(&store.pool))
            .await?;
        Ok(store)
    }

    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self { pool, query_timeout }
    }

    async fn bounded<T, F>(&self, query: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        tokio::time::timeout(self.query_timeout, query)
            .await
            .map_err(|_| StoreError::Timeout(self.query_timeout))?
            .map_err(StoreError::from)
    }

    async fn bounded_raw<T, F>(&self, query: F) -> StoreResult<Result<T, sqlx::Error>>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        tokio::time::timeout(self.query_timeout, query)
            .await
            .map_err(|_| StoreError::Timeout(self.query_timeout))
    }
}

#[async_trait]
impl MovieStore for PostgresStore {
    async fn insert(&self, movie: &mut Movie) -> StoreResult<()> {
        let (id, created_at, version): (i64, DateTime<Utc>, i32) = self
            .bounded(
                sqlx::query_as(
                    "INSERT INTO movies (title, year, runtime, genres)
                     VALUES ($1, $2, $3, $4)
                     RETURNING id, created_at, version",
                )
                .bind(&movie.title)
                .bind(movie.year)
                .bind(movie.runtime.minutes())
                .bind(&movie.genres)
                .fetch_one(&self.pool),
            )
            .await?;

        movie.id = id;
        movie.created_at = created_at;
        movie.version = version;
        Ok(())
    }

    async fn get(&self, id: i64) -> StoreResult<Movie> {
        if id < 1 {
            return Err(StoreError::RecordNotFound);
        }
        let row: MovieRow = self
            .bounded(
                sqlx::query_as(
                    "SELECT id, created_at, title, year, runtime, genres, version
                     FROM movies
                     WHERE id = $1",
                )
                .bind(id)
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(row.into())
    }

    async fn update(&self, movie: &mut Movie) -> StoreResult<()> {
        let version: Option<(i32,)> = self
            .bounded(
                sqlx::query_as(
                    "UPDATE movies
                     SET title = $1, year = $2, runtime = $3, genres = $4, version = version + 1
                     WHERE id = $5 AND version = $6
                     RETURNING version",
                )
                .bind(&movie.title)
                .bind(movie.year)
                .bind(movie.runtime.minutes())
                .bind(&movie.genres)
                .bind(movie.id)
                .bind(movie.version)
                .fetch_optional(&self.pool),
            )
            .await?;

        let (version,) = version.ok_or(StoreError::EditConflict)?;
        movie.version = version;
        Ok(())
    }

    async fn delete(&self, id: i64) -> StoreResult<()> {
        if id < 1 {
            return Err(StoreError::RecordNotFound);
        }
        let result = self
            .bounded(
                sqlx::query("DELETE FROM movies WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RecordNotFound);
        }
        Ok(())
    }

    async fn get_all(
        &self,
        title: &str,
        genres: &[String],
        filters: &Filters,
    ) -> StoreResult<(Vec<Movie>, Metadata)> {
        let column = filters.sort_column().unwrap_or("id");
        let direction = filters.sort_direction().as_sql();
        let sql = format!(
            "SELECT count(*) OVER(), id, created_at, title, year, runtime, genres, version
             FROM movies
             WHERE (to_tsvector('simple', title) @@ plainto_tsquery('simple', $1) OR $1 = '')
             AND (genres @> $2 OR $2 = '{{}}')
             ORDER BY {column} {direction}, id ASC
             LIMIT $3 OFFSET $4"
        );

        let rows: Vec<(i64, i64, DateTime<Utc>, String, i32, i32, Vec<String>, i32)> = self
            .bounded(
                sqlx::query_as(&sql)
                    .bind(title)
                    .bind(genres)
                    .bind(filters.limit())
                    .bind(filters.offset())
                    .fetch_all(&self.pool),
            )
            .await?;

        let total = rows.first().map(|row| row.0).unwrap_or(0);
        let movies = rows
            .into_iter()
            .map(|(_, id, created_at, title, year, runtime, genres, version)| Movie {
                id,
                created_at,
                title,
                year,
                runtime: Runtime(runtime),
                genres,
                version,
            })
            .collect();

        Ok((movies, Metadata::calculate(total, filters.page, filters.page_size)))
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn insert(&self, user: &mut User) -> StoreResult<()> {
        let hash = user.password.hash_str().map_err(|_| StoreError::MissingPasswordHash)?;
        let row: Result<(i64, DateTime<Utc>, i32), sqlx::Error> = self
            .bounded_raw(
                sqlx::query_as(
                    "INSERT INTO users (name, email, password_hash, activated)
                     VALUES ($1, $2, $3, $4)
                     RETURNING id, created_at, version",
                )
                .bind(&user.name)
                .bind(&user.email)
                .bind(hash.as_bytes())
                .bind(user.activated)
                .fetch_one(&self.pool),
            )
            .await?;

        let (id, created_at, version) = row.map_err(map_email_conflict)?;
        user.id = id;
        user.created_at = created_at;
        user.version = version;
        Ok(())
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<User> {
        let row: UserRow = self
            .bounded(
                sqlx::query_as(
                    "SELECT id, created_at, name, email, password_hash, activated, version
                     FROM users
                     WHERE email = $1",
                )
                .bind(email)
                .fetch_one(&self.pool),
            )
            .await?;
        row.try_into()
    }

    async fn update(&self, user: &mut User) -> StoreResult<()> {
        let hash = user.password.hash_str().map_err(|_| StoreError::MissingPasswordHash)?;
        let row: Result<Option<(i32,)>, sqlx::Error> = self
            .bounded_raw(
                sqlx::query_as(
                    "UPDATE users
                     SET name = $1, email = $2, password_hash = $3, activated = $4, version = version + 1
                     WHERE id = $5 AND version = $6
                     RETURNING version",
                )
                .bind(&user.name)
                .bind(&user.email)
                .bind(hash.as_bytes())
                .bind(user.activated)
                .bind(user.id)
                .bind(user.version)
                .fetch_optional(&self.pool),
            )
            .await?;

        let (version,) = row.map_err(map_email_conflict)?.ok_or(StoreError::EditConflict)?;
        user.version = version;
        Ok(())
    }

    async fn get_for_token(
        &self,
        scope: Scope,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<User> {
        let row: UserRow = self
            .bounded(
                sqlx::query_as(
                    "SELECT users.id, users.created_at, users.name, users.email,
                            users.password_hash, users.activated, users.version
                     FROM users
                     INNER JOIN tokens ON users.id = tokens.user_id
                     WHERE tokens.hash = $1
                     AND tokens.scope = $2
                     AND tokens.expiry > $3",
                )
                .bind(token_hash)
                .bind(scope.as_str())
                .bind(now)
                .fetch_one(&self.pool),
            )
            .await?;
        row.try_into()
    }
}

#[async_trait]
impl TokenStore for PostgresStore {
    async fn insert(&self, token: &Token) -> StoreResult<()> {
        self.bounded(
            sqlx::query(
                "INSERT INTO tokens (hash, user_id, expiry, scope)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&token.hash)
            .bind(token.user_id)
            .bind(token.expiry)
            .bind(token.scope.as_str())
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn delete_all_for_user(&self, scope: Scope, user_id: i64) -> StoreResult<()> {
        self.bounded(
            sqlx::query("DELETE FROM tokens WHERE scope = $1 AND user_id = $2")
                .bind(scope.as_str())
                .bind(user_id)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for PostgresStore {
    async fn get_all_for_user(&self, user_id: i64) -> StoreResult<Permissions> {
        let codes: Vec<(String,)> = self
            .bounded(
                sqlx::query_as(
                    "SELECT permissions.code
                     FROM permissions
                     INNER JOIN users_permissions ON users_permissions.permission_id = permissions.id
                     INNER JOIN users ON users_permissions.user_id = users.id
                     WHERE users.id = $1",
                )
                .bind(user_id)
                .fetch_all(&self.pool),
            )
            .await?;
        Ok(codes.into_iter().map(|(code,)| code).collect())
    }

    async fn add_for_user(&self, user_id: i64, codes: &[&str]) -> StoreResult<()> {
        let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
        self.bounded(
            sqlx::query(
                "INSERT INTO users_permissions
                 SELECT $1, permissions.id FROM permissions WHERE permissions.code = ANY($2)",
            )
            .bind(user_id)
            .bind(&codes)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}
