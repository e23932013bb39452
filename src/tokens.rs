use chrono::{DateTime, TimeDelta, Utc};
use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use crate::models::User;
use crate::store::{Models, StoreError, StoreResult, TokenStore, UserStore};
use crate::validation::Validator;

/// Length of a token's plaintext: 16 random bytes in unpadded base-32.
pub const TOKEN_PLAINTEXT_LEN: usize = 26;

/// What a token may be used for. A token only ever resolves within the
/// scope it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Activation,
    Authentication,
    PasswordReset,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Activation => "activation",
            Scope::Authentication => "authentication",
            Scope::PasswordReset => "password-reset",
        }
    }

    /// How long a freshly issued token of this scope stays valid.
    pub fn default_ttl(self) -> TimeDelta {
        match self {
            Scope::Activation => TimeDelta::days(3),
            Scope::Authentication => TimeDelta::hours(24),
            Scope::PasswordReset => TimeDelta::minutes(45),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An issued token. Only `hash` is ever persisted; `plaintext` is handed to
/// the client once, at issue time.
#[derive(Debug, Clone, Serialize)]
pub struct Token {
    #[serde(rename = "token")]
    pub plaintext: String,
    #[serde(skip)]
    pub hash: Vec<u8>,
    #[serde(skip)]
    pub user_id: i64,
    pub expiry: DateTime<Utc>,
    #[serde(skip)]
    pub scope: Scope,
}

pub fn hash_plaintext(plaintext: &str) -> Vec<u8> {
    Sha256::digest(plaintext.as_bytes()).to_vec()
}

pub fn generate_token(user_id: i64, ttl: TimeDelta, scope: Scope) -> Token {
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    let plaintext = BASE32_NOPAD.encode(&random);

    Token {
        hash: hash_plaintext(&plaintext),
        plaintext,
        user_id,
        expiry: Utc::now() + ttl,
        scope,
    }
}

pub fn validate_token_plaintext(v: &mut Validator, plaintext: &str) {
    v.check(!plaintext.is_empty(), "token", "must be provided");
    v.check(
        plaintext.len() == TOKEN_PLAINTEXT_LEN,
        "token",
        "must be 26 bytes long",
    );
}

fn is_well_formed(plaintext: &str) -> bool {
    let mut v = Validator::new();
    validate_token_plaintext(&mut v, plaintext);
    v.valid()
}

/// Issues, resolves and revokes bearer tokens.
#[derive(Clone)]
pub struct TokenService {
    tokens: Arc<dyn TokenStore>,
    users: Arc<dyn UserStore>,
}

impl TokenService {
    pub fn new(models: &Models) -> Self {
        Self {
            tokens: models.tokens.clone(),
            users: models.users.clone(),
        }
    }

    pub async fn issue(&self, user_id: i64, ttl: TimeDelta, scope: Scope) -> StoreResult<Token> {
        let token = generate_token(user_id, ttl, scope);
        self.tokens.insert(&token).await?;
        Ok(token)
    }

    /// The user owning `plaintext` in `scope`.
    ///
    /// Malformed, unknown, expired and wrong-scope tokens all come back as
    /// [`StoreError::RecordNotFound`]; malformed ones never reach the store.
    pub async fn resolve(&self, scope: Scope, plaintext: &str) -> StoreResult<User> {
        if !is_well_formed(plaintext) {
            return Err(StoreError::RecordNotFound);
        }
        let hash = hash_plaintext(plaintext);
        self.users.get_for_token(scope, &hash, Utc::now()).await
    }

    pub async fn revoke_all(&self, scope: Scope, user_id: i64) -> StoreResult<()> {
        self.tokens.delete_all_for_user(scope, user_id).await
    }
}
