use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;

use super::users::password_matches;
use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, Result};
use crate::mailer::Email;
use crate::models::user::{validate_email, validate_password_plaintext};
use crate::models::User;
use crate::request::JsonBody;
use crate::response::Envelope;
use crate::server::AppState;
use crate::store::StoreError;
use crate::tokens::Scope;
use crate::validation::Validator;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CredentialsInput {
    email: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EmailInput {
    email: String,
}

async fn user_by_email(state: &AppState, email: &str) -> Result<User> {
    match state.models.users.get_by_email(email).await {
        Ok(user) => Ok(user),
        Err(StoreError::RecordNotFound) => {
            Err(ApiError::invalid_field("email", "no matching email address found"))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn create_authentication_token(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<CredentialsInput>,
) -> Result<Response> {
    let mut v = Validator::new();
    validate_email(&mut v, &input.email);
    validate_password_plaintext(&mut v, &input.password);
    v.finish()?;

    let user = match state.models.users.get_by_email(&input.email).await {
        Ok(user) => user,
        Err(StoreError::RecordNotFound) => return Err(ApiError::InvalidCredentials),
        Err(err) => return Err(err.into()),
    };

    if !password_matches(user.password.clone(), input.password).await? {
        return Err(ApiError::InvalidCredentials);
    }

    let token = state
        .tokens
        .issue(user.id, Scope::Authentication.default_ttl(), Scope::Authentication)
        .await?;

    Ok(Envelope::of("authentication_token", &token)?.with_status(StatusCode::CREATED))
}

/// Log out everywhere: every authentication token of the caller goes.
pub async fn delete_authentication_tokens(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Envelope> {
    state.tokens.revoke_all(Scope::Authentication, user.id).await?;
    Ok(Envelope::message("you have been logged out"))
}

pub async fn create_activation_token(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<EmailInput>,
) -> Result<Response> {
    let mut v = Validator::new();
    validate_email(&mut v, &input.email);
    v.finish()?;

    let user = user_by_email(&state, &input.email).await?;
    if user.activated {
        return Err(ApiError::invalid_field("email", "user has already been activated"));
    }

    let token = state
        .tokens
        .issue(user.id, Scope::Activation.default_ttl(), Scope::Activation)
        .await?;

    let mailer = state.mailer.clone();
    let email = Email::Activation {
        activation_token: token.plaintext,
    };
    state.background.spawn("activation email", async move {
        mailer.send(&user.email, &email).await
    });

    Ok(Envelope::message("an email will be sent to you containing activation instructions")
        .with_status(StatusCode::ACCEPTED))
}

pub async fn create_password_reset_token(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<EmailInput>,
) -> Result<Response> {
    let mut v = Validator::new();
    validate_email(&mut v, &input.email);
    v.finish()?;

    let user = user_by_email(&state, &input.email).await?;
    if !user.activated {
        return Err(ApiError::invalid_field("email", "user account must be activated"));
    }

    let token = state
        .tokens
        .issue(user.id, Scope::PasswordReset.default_ttl(), Scope::PasswordReset)
        .await?;

    let mailer = state.mailer.clone();
    let email = Email::PasswordReset {
        token: token.plaintext,
        expiry: token.expiry,
    };
    state.background.spawn("password reset email", async move {
        mailer.send(&user.email, &email).await
    });

    Ok(Envelope::message("an email will be sent to you containing password reset instructions")
        .with_status(StatusCode::ACCEPTED))
}
