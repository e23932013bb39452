pub mod movies;
pub mod tokens;
pub mod users;

use axum::extract::State;
use serde::Serialize;

use crate::error::{ApiError, Result};
use crate::response::Envelope;
use crate::server::AppState;

#[derive(Debug, Serialize)]
struct SystemInfo {
    environment: String,
    version: &'static str,
}

pub async fn healthcheck(State(state): State<AppState>) -> Result<Envelope> {
    Envelope::of("status", "available")?.with(
        "system_info",
        SystemInfo {
            environment: state.config.env.to_string(),
            version: env!("CARGO_PKG_VERSION"),
        },
    )
}

/// Fallback for paths no route matches.
pub async fn not_found() -> ApiError {
    ApiError::RecordNotFound
}
