use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::validation::{matches, Validator, EMAIL_RX};

pub const DEFAULT_BCRYPT_COST: u32 = 12;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("user has no password hash")]
    MissingHash,
    #[error(transparent)]
    Bcrypt(#[from] bcrypt::BcryptError),
}

/// A password as held by a user record: its bcrypt hash, absent only on a
/// value that was never set.
#[derive(Clone, Default)]
pub struct Password {
    hash: Option<String>,
}

impl Password {
    /// Hash `plaintext`. This is CPU bound and should run off the async
    /// workers.
    pub fn hash(plaintext: &str, cost: u32) -> Result<Self, PasswordError> {
        let hash = bcrypt::hash(plaintext, cost)?;
        Ok(Self { hash: Some(hash) })
    }

    pub fn from_hash(hash: String) -> Self {
        Self { hash: Some(hash) }
    }

    pub fn hash_str(&self) -> Result<&str, PasswordError> {
        self.hash.as_deref().ok_or(PasswordError::MissingHash)
    }

    /// `Ok(false)` on a mismatch; errors are reserved for hashes that cannot
    /// be checked at all.
    pub fn matches(&self, plaintext: &str) -> Result<bool, PasswordError> {
        Ok(bcrypt::verify(plaintext, self.hash_str()?)?)
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Password")
            .field("hash_set", &self.hash.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub email: String,
    #[serde(skip)]
    pub password: Password,
    pub activated: bool,
    #[serde(skip)]
    pub version: i32,
}

impl User {
    pub fn draft(name: String, email: String, password: Password) -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            name,
            email,
            password,
            activated: false,
            version: 1,
        }
    }
}

pub fn validate_email(v: &mut Validator, email: &str) {
    v.check(!email.is_empty(), "email", "must be provided");
    v.check(matches(email, &EMAIL_RX), "email", "must be a valid email address");
}

pub fn validate_password_plaintext(v: &mut Validator, password: &str) {
    v.check(!password.is_empty(), "password", "must be provided");
    v.check(password.len() >= 8, "password", "must be at least 8 bytes long");
    v.check(password.len() <= 72, "password", "must not be more than 72 bytes long");
}

pub fn validate_name(v: &mut Validator, name: &str) {
    v.check(!name.is_empty(), "name", "must be provided");
    v.check(name.len() <= 500, "name", "must not be more than 500 bytes long");
}
