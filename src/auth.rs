//! Who is calling, and what they may do.
//!
//! [`authenticate`] runs once per request and stores a [`Principal`] in the
//! request extensions. Routes then stack guards on top: a permission check
//! implies an activation check, which implies an authentication check, and
//! they always run in that order.

use axum::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{AUTHORIZATION, VARY};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::models::User;
use crate::server::AppState;
use crate::store::{PermissionStore, StoreError};
use crate::tokens::{validate_token_plaintext, Scope, TokenService};
use crate::validation::Validator;

/// The identity attached to one request.
#[derive(Debug, Clone)]
pub enum Principal {
    Anonymous,
    Authenticated(User),
}

impl Principal {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Principal::Anonymous => None,
            Principal::Authenticated(user) => Some(user),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or(ApiError::Invariant("principal missing from request"))
    }
}

/// The caller, for handlers that sit behind an authentication guard.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Principal::from_request_parts(parts, state).await? {
            Principal::Authenticated(user) => Ok(AuthenticatedUser(user)),
            Principal::Anonymous => Err(ApiError::Invariant("anonymous caller past authentication guard")),
        }
    }
}

/// Work out the principal from the `Authorization` header.
///
/// A malformed header, a token of the wrong shape and a token that does not
/// resolve all produce the same error.
pub async fn resolve_principal(tokens: &TokenService, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let header = match headers.get(AUTHORIZATION) {
        None => return Ok(Principal::Anonymous),
        Some(value) if value.is_empty() => return Ok(Principal::Anonymous),
        Some(value) => value.to_str().map_err(|_| ApiError::InvalidAuthenticationToken)?,
    };

    let token = match header.split(' ').collect::<Vec<_>>()[..] {
        ["Bearer", token] => token,
        _ => return Err(ApiError::InvalidAuthenticationToken),
    };

    let mut v = Validator::new();
    validate_token_plaintext(&mut v, token);
    if !v.valid() {
        return Err(ApiError::InvalidAuthenticationToken);
    }

    match tokens.resolve(Scope::Authentication, token).await {
        Ok(user) => Ok(Principal::Authenticated(user)),
        Err(StoreError::RecordNotFound) => Err(ApiError::InvalidAuthenticationToken),
        Err(err) => Err(ApiError::server(err)),
    }
}

pub async fn authenticate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let mut response = match resolve_principal(&state.tokens, req.headers()).await {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    };
    response
        .headers_mut()
        .append(VARY, HeaderValue::from_static("Authorization"));
    response
}

pub fn authenticated(principal: &Principal) -> Result<&User, ApiError> {
    principal.user().ok_or(ApiError::AuthenticationRequired)
}

pub fn activated(principal: &Principal) -> Result<&User, ApiError> {
    let user = authenticated(principal)?;
    if !user.activated {
        return Err(ApiError::InactiveAccount);
    }
    Ok(user)
}

pub async fn permitted<'a>(
    principal: &'a Principal,
    permissions: &dyn PermissionStore,
    code: &str,
) -> Result<&'a User, ApiError> {
    let user = activated(principal)?;
    let granted = permissions.get_all_for_user(user.id).await?;
    if !granted.includes(code) {
        return Err(ApiError::NotPermitted);
    }
    Ok(user)
}

fn principal_of(req: &Request) -> Result<&Principal, ApiError> {
    req.extensions()
        .get::<Principal>()
        .ok_or(ApiError::Invariant("principal missing from request"))
}

pub async fn require_authenticated_user(req: Request, next: Next) -> Result<Response, ApiError> {
    authenticated(principal_of(&req)?)?;
    Ok(next.run(req).await)
}

pub async fn require_activated_user(req: Request, next: Next) -> Result<Response, ApiError> {
    activated(principal_of(&req)?)?;
    Ok(next.run(req).await)
}

pub async fn require_permission(
    State(state): State<AppState>,
    code: &'static str,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = principal_of(&req)?.clone();
    permitted(&principal, state.models.permissions.as_ref(), code).await?;
    Ok(next.run(req).await)
}
