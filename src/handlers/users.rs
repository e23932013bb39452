use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;

use crate::error::{ApiError, Result};
use crate::mailer::Email;
use crate::models::user::{validate_email, validate_name, validate_password_plaintext};
use crate::models::{Password, User, MOVIES_READ};
use crate::request::JsonBody;
use crate::response::Envelope;
use crate::server::AppState;
use crate::store::StoreError;
use crate::tokens::{validate_token_plaintext, Scope};
use crate::validation::Validator;

const DUPLICATE_EMAIL: &str = "a user with this email address already exists";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegisterUserInput {
    name: String,
    email: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ActivateUserInput {
    token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResetPasswordInput {
    password: String,
    token: String,
}

/// bcrypt is CPU bound; keep it off the async workers.
pub(crate) async fn hash_password(plaintext: String, cost: u32) -> Result<Password> {
    Ok(tokio::task::spawn_blocking(move || Password::hash(&plaintext, cost)).await??)
}

pub(crate) async fn password_matches(password: Password, plaintext: String) -> Result<bool> {
    Ok(tokio::task::spawn_blocking(move || password.matches(&plaintext)).await??)
}

fn translate_duplicate(err: StoreError) -> ApiError {
    match err {
        StoreError::DuplicateEmail => ApiError::invalid_field("email", DUPLICATE_EMAIL),
        other => other.into(),
    }
}

pub async fn register_user(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<RegisterUserInput>,
) -> Result<Response> {
    let mut v = Validator::new();
    validate_name(&mut v, &input.name);
    validate_email(&mut v, &input.email);
    validate_password_plaintext(&mut v, &input.password);
    v.finish()?;

    let password = hash_password(input.password, state.config.bcrypt_cost).await?;
    let mut user = User::draft(input.name, input.email, password);

    state.models.users.insert(&mut user).await.map_err(translate_duplicate)?;
    state.models.permissions.add_for_user(user.id, &[MOVIES_READ]).await?;

    let token = state
        .tokens
        .issue(user.id, Scope::Activation.default_ttl(), Scope::Activation)
        .await?;

    let mailer = state.mailer.clone();
    let recipient = user.email.clone();
    let email = Email::Welcome {
        user_id: user.id,
        activation_token: token.plaintext,
    };
    state.background.spawn("welcome email", async move {
        mailer.send(&recipient, &email).await
    });

    Ok(Envelope::of("user", &user)?.with_status(StatusCode::ACCEPTED))
}

pub async fn activate_user(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<ActivateUserInput>,
) -> Result<Envelope> {
    let mut v = Validator::new();
    validate_token_plaintext(&mut v, &input.token);
    v.finish()?;

    let mut user = match state.tokens.resolve(Scope::Activation, &input.token).await {
        Ok(user) => user,
        Err(StoreError::RecordNotFound) => {
            return Err(ApiError::invalid_field("token", "invalid or expired activation token"))
        }
        Err(err) => return Err(err.into()),
    };

    user.activated = true;
    state.models.users.update(&mut user).await.map_err(translate_duplicate)?;
    state.tokens.revoke_all(Scope::Activation, user.id).await?;

    Envelope::of("user", user)
}

pub async fn update_password(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<ResetPasswordInput>,
) -> Result<Envelope> {
    let mut v = Validator::new();
    validate_password_plaintext(&mut v, &input.password);
    validate_token_plaintext(&mut v, &input.token);
    v.finish()?;

    let mut user = match state.tokens.resolve(Scope::PasswordReset, &input.token).await {
        Ok(user) => user,
        Err(StoreError::RecordNotFound) => {
            return Err(ApiError::invalid_field("token", "invalid or expired password reset token"))
        }
        Err(err) => return Err(err.into()),
    };

    user.password = hash_password(input.password, state.config.bcrypt_cost).await?;
    state.models.users.update(&mut user).await.map_err(translate_duplicate)?;

    state.tokens.revoke_all(Scope::PasswordReset, user.id).await?;
    state.tokens.revoke_all(Scope::Authentication, user.id).await?;

    Ok(Envelope::message("your password was successfully reset"))
}
