//! Data access for movies, users, tokens and permissions.
//!
//! Two backends implement the same traits: [`postgres::PostgresStore`] for
//! deployments and [`memory::MemoryStore`] when no database is configured.
//! Driver failures never leave this module raw; they are translated into
//! [`StoreError`] at the boundary.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Filters, Metadata, Movie, Permissions, User};
use crate::tokens::{Scope, Token};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    RecordNotFound,

    #[error("edit conflict")]
    EditConflict,

    #[error("duplicate email")]
    DuplicateEmail,

    #[error("query exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error(transparent)]
    Database(sqlx::Error),

    #[error("stored password hash is unreadable: {0}")]
    CorruptHash(String),

    #[error("user record has no password hash")]
    MissingPasswordHash,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::RecordNotFound,
            other => StoreError::Database(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait MovieStore: Send + Sync {
    /// Persist a new movie, filling in its id, creation time and version.
    async fn insert(&self, movie: &mut Movie) -> StoreResult<()>;

    async fn get(&self, id: i64) -> StoreResult<Movie>;

    /// Write `movie` back if its version still matches the stored one, then
    /// bump the version. A mismatch is an [`StoreError::EditConflict`].
    async fn update(&self, movie: &mut Movie) -> StoreResult<()>;

    /// Zero matching rows is [`StoreError::RecordNotFound`]; a failing
    /// statement is reported as such and never treated as "nothing deleted".
    async fn delete(&self, id: i64) -> StoreResult<()>;

    async fn get_all(
        &self,
        title: &str,
        genres: &[String],
        filters: &Filters,
    ) -> StoreResult<(Vec<Movie>, Metadata)>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, user: &mut User) -> StoreResult<()>;

    async fn get_by_email(&self, email: &str) -> StoreResult<User>;

    async fn update(&self, user: &mut User) -> StoreResult<()>;

    /// The owner of an unexpired token with the given hash and scope.
    async fn get_for_token(
        &self,
        scope: Scope,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<User>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, token: &Token) -> StoreResult<()>;

    async fn delete_all_for_user(&self, scope: Scope, user_id: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn get_all_for_user(&self, user_id: i64) -> StoreResult<Permissions>;

    async fn add_for_user(&self, user_id: i64, codes: &[&str]) -> StoreResult<()>;
}

/// One handle per record type, shared by every request.
#[derive(Clone)]
pub struct Models {
    pub movies: Arc<dyn MovieStore>,
    pub users: Arc<dyn UserStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub permissions: Arc<dyn PermissionStore>,
}

impl Models {
    fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: MovieStore + UserStore + TokenStore + PermissionStore + 'static,
    {
        Self {
            movies: backend.clone(),
            users: backend.clone(),
            tokens: backend.clone(),
            permissions: backend,
        }
    }

    pub fn memory() -> Self {
        Self::from_backend(Arc::new(memory::MemoryStore::new()))
    }

    pub fn postgres(store: postgres::PostgresStore) -> Self {
        Self::from_backend(Arc::new(store))
    }
}
