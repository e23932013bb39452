use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;

use crate::mailer::MailError;
use crate::models::PasswordError;
use crate::store::StoreError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = ApiError> = std::result::Result<T, E>;

/// Every failure a request can end in, mapped onto one status code and one
/// client-facing message each.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed")]
    ValidationFailed(BTreeMap<String, String>),

    #[error("{0}")]
    MalformedRequestBody(String),

    #[error("invalid or missing authentication token")]
    InvalidAuthenticationToken,

    #[error("invalid authentication credentials")]
    InvalidCredentials,

    #[error("you must be authenticated to access this resource")]
    AuthenticationRequired,

    #[error("your user account must be activated to access this resource")]
    InactiveAccount,

    #[error("your user account doesn't have the necessary permissions to access this resource")]
    NotPermitted,

    #[error("the requested resource could not be found")]
    RecordNotFound,

    #[error("the {0} method is not supported for this resource")]
    MethodNotAllowed(Method),

    #[error("unable to update the record due to an edit conflict, please try again")]
    EditConflict,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// A state the request pipeline guarantees can never happen was observed.
    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),

    #[error("server error: {0}")]
    ServerError(ServerError),
}

/// The cause of an unexpected failure, kept for the log line only.
pub struct ServerError {
    source: BoxError,
    backtrace: Backtrace,
}

impl ServerError {
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
            backtrace: Backtrace::force_capture(),
        }
    }
}

impl fmt::Debug for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerError")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

const SERVER_ERROR_MESSAGE: &str =
    "the server encountered a problem and could not process your request";

const MISSING_PASSWORD_HASH: &str = "missing password hash";

impl ApiError {
    pub fn server(source: impl Into<BoxError>) -> Self {
        ApiError::ServerError(ServerError::new(source))
    }

    /// Shorthand for a single field failure.
    pub fn invalid_field(field: &str, message: &str) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(field.to_string(), message.to_string());
        ApiError::ValidationFailed(errors)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::MalformedRequestBody(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidAuthenticationToken
            | ApiError::InvalidCredentials
            | ApiError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            ApiError::InactiveAccount | ApiError::NotPermitted => StatusCode::FORBIDDEN,
            ApiError::RecordNotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::EditConflict => StatusCode::CONFLICT,
            ApiError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Invariant(_) | ApiError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::ValidationFailed(errors) => ErrorBody::Fields(errors.clone()),
            ApiError::Invariant(_) | ApiError::ServerError(_) => {
                ErrorBody::Message(SERVER_ERROR_MESSAGE.to_string())
            }
            other => ErrorBody::Message(other.to_string()),
        }
    }

    fn log(&self) {
        match self {
            ApiError::ServerError(err) => {
                tracing::error!(
                    target: "movies_api::error",
                    error = %err.source,
                    trace = %err.backtrace,
                    "request failed"
                );
            }
            ApiError::Invariant(what) => {
                tracing::error!(
                    target: "movies_api::error",
                    invariant = what,
                    trace = %Backtrace::force_capture(),
                    "request failed"
                );
            }
            _ => {}
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ErrorBody {
    Message(String),
    Fields(BTreeMap<String, String>),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.status();
        let body = ErrorResponse { error: self.body() };
        let mut response = crate::response::json_response(status, &body);

        if matches!(self, ApiError::InvalidAuthenticationToken) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RecordNotFound => ApiError::RecordNotFound,
            StoreError::EditConflict => ApiError::EditConflict,
            StoreError::MissingPasswordHash => ApiError::Invariant(MISSING_PASSWORD_HASH),
            other => ApiError::server(other),
        }
    }
}

impl From<PasswordError> for ApiError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::MissingHash => ApiError::Invariant(MISSING_PASSWORD_HASH),
            other => ApiError::server(other),
        }
    }
}

impl From<MailError> for ApiError {
    fn from(err: MailError) -> Self {
        ApiError::server(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::server(err)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::server(err)
    }
}
