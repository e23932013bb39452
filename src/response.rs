use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ApiError;

/// A JSON object whose top-level keys name the payloads it carries,
/// e.g. `{"movie": {...}}` or `{"movies": [...], "metadata": {...}}`.
#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a single payload under `key`.
    pub fn of<T: Serialize>(key: &str, value: T) -> Result<Self, ApiError> {
        Self::new().with(key, value)
    }

    pub fn with<T: Serialize>(mut self, key: &str, value: T) -> Result<Self, ApiError> {
        self.0.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Shorthand for `{"message": "..."}` bodies.
    pub fn message(text: &str) -> Self {
        let mut map = Map::new();
        map.insert("message".to_string(), Value::String(text.to_string()));
        Self(map)
    }

    pub fn with_status(self, status: StatusCode) -> Response {
        json_response(status, &self)
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        self.with_status(StatusCode::OK)
    }
}

/// Render `body` as indented JSON followed by a newline, so responses read
/// well from a terminal.
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec_pretty(body) {
        Ok(mut bytes) => {
            bytes.push(b'\n');
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            tracing::error!(target: "movies_api::response", error = %err, "failed to encode response");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}
