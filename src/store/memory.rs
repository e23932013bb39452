use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::{MovieStore, PermissionStore, StoreError, StoreResult, TokenStore, UserStore};
use crate::models::{Filters, Metadata, Movie, Permissions, SortDirection, User};
use crate::tokens::{Scope, Token};

#[derive(Debug, Clone)]
struct TokenRecord {
    hash: Vec<u8>,
    user_id: i64,
    expiry: DateTime<Utc>,
    scope: Scope,
}

#[derive(Default)]
struct Tables {
    next_movie_id: i64,
    next_user_id: i64,
    movies: BTreeMap<i64, Movie>,
    users: BTreeMap<i64, User>,
    tokens: Vec<TokenRecord>,
    grants: HashMap<i64, HashSet<String>>,
}

/// In-process storage with the same contracts as the Postgres backend.
///
/// All tables sit behind one lock, which keeps joins such as
/// token → user consistent.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Word-level, case-insensitive match standing in for Postgres full-text
/// search with the `simple` configuration.
fn title_matches(title: &str, query: &str) -> bool {
    let words: HashSet<String> = title.split_whitespace().map(str::to_lowercase).collect();
    query
        .split_whitespace()
        .all(|term| words.contains(&term.to_lowercase()))
}

fn compare_by(column: &str, a: &Movie, b: &Movie) -> Ordering {
    match column {
        "title" => a.title.cmp(&b.title),
        "year" => a.year.cmp(&b.year),
        "runtime" => a.runtime.cmp(&b.runtime),
        _ => a.id.cmp(&b.id),
    }
}

#[async_trait]
impl MovieStore for MemoryStore {
    async fn insert(&self, movie: &mut Movie) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        tables.next_movie_id += 1;
        movie.id = tables.next_movie_id;
        movie.created_at = Utc::now();
        movie.version = 1;
        tables.movies.insert(movie.id, movie.clone());
        Ok(())
    }

    async fn get(&self, id: i64) -> StoreResult<Movie> {
        if id < 1 {
            return Err(StoreError::RecordNotFound);
        }
        self.tables
            .lock()
            .movies
            .get(&id)
            .cloned()
            .ok_or(StoreError::RecordNotFound)
    }

    async fn update(&self, movie: &mut Movie) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        match tables.movies.get_mut(&movie.id) {
            Some(stored) if stored.version == movie.version => {
                movie.version += 1;
                *stored = movie.clone();
                Ok(())
            }
            _ => Err(StoreError::EditConflict),
        }
    }

    async fn delete(&self, id: i64) -> StoreResult<()> {
        if id < 1 {
            return Err(StoreError::RecordNotFound);
        }
        self.tables
            .lock()
            .movies
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::RecordNotFound)
    }

    async fn get_all(
        &self,
        title: &str,
        genres: &[String],
        filters: &Filters,
    ) -> StoreResult<(Vec<Movie>, Metadata)> {
        let tables = self.tables.lock();
        let mut matched: Vec<Movie> = tables
            .movies
            .values()
            .filter(|m| title.is_empty() || title_matches(&m.title, title))
            .filter(|m| genres.iter().all(|g| m.genres.contains(g)))
            .cloned()
            .collect();
        drop(tables);

        let column = filters.sort_column().unwrap_or("id");
        let direction = filters.sort_direction();
        matched.sort_by(|a, b| {
            let primary = match direction {
                SortDirection::Ascending => compare_by(column, a, b),
                SortDirection::Descending => compare_by(column, b, a),
            };
            primary.then(a.id.cmp(&b.id))
        });

        let total = matched.len() as i64;
        let page: Vec<Movie> = matched
            .into_iter()
            .skip(filters.offset().max(0) as usize)
            .take(filters.limit().max(0) as usize)
            .collect();

        Ok((page, Metadata::calculate(total, filters.page, filters.page_size)))
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert(&self, user: &mut User) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        let email = user.email.to_lowercase();
        if tables.users.values().any(|u| u.email.to_lowercase() == email) {
            return Err(StoreError::DuplicateEmail);
        }
        tables.next_user_id += 1;
        user.id = tables.next_user_id;
        user.created_at = Utc::now();
        user.version = 1;
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<User> {
        let email = email.to_lowercase();
        self.tables
            .lock()
            .users
            .values()
            .find(|u| u.email.to_lowercase() == email)
            .cloned()
            .ok_or(StoreError::RecordNotFound)
    }

    async fn update(&self, user: &mut User) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        let email = user.email.to_lowercase();
        if tables
            .users
            .values()
            .any(|u| u.id != user.id && u.email.to_lowercase() == email)
        {
            return Err(StoreError::DuplicateEmail);
        }
        match tables.users.get_mut(&user.id) {
            Some(stored) if stored.version == user.version => {
                user.version += 1;
                *stored = user.clone();
                Ok(())
            }
            _ => Err(StoreError::EditConflict),
        }
    }

    async fn get_for_token(
        &self,
        scope: Scope,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<User> {
        let tables = self.tables.lock();
        tables
            .tokens
            .iter()
            .find(|t| t.scope == scope && t.hash == token_hash && t.expiry > now)
            .and_then(|t| tables.users.get(&t.user_id))
            .cloned()
            .ok_or(StoreError::RecordNotFound)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert(&self, token: &Token) -> StoreResult<()> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        tables.tokens.retain(|t| t.expiry > now);
        tables.tokens.push(TokenRecord {
            hash: token.hash.clone(),
            user_id: token.user_id,
            expiry: token.expiry,
            scope: token.scope,
        });
        Ok(())
    }

    async fn delete_all_for_user(&self, scope: Scope, user_id: i64) -> StoreResult<()> {
        self.tables
            .lock()
            .tokens
            .retain(|t| !(t.scope == scope && t.user_id == user_id));
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn get_all_for_user(&self, user_id: i64) -> StoreResult<Permissions> {
        let tables = self.tables.lock();
        Ok(tables
            .grants
            .get(&user_id)
            .map(|codes| codes.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_for_user(&self, user_id: i64, codes: &[&str]) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        if !tables.users.contains_key(&user_id) {
            return Err(StoreError::RecordNotFound);
        }
        tables
            .grants
            .entry(user_id)
            .or_default()
            .extend(codes.iter().map(|c| c.to_string()));
        Ok(())
    }
}
