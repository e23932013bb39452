//! Reading what the client sent: JSON bodies, path ids and query strings.

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Path, Request};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use http_body_util::LengthLimitError;
use serde::de::DeserializeOwned;
use serde_json::error::Category;
use std::collections::HashMap;

use crate::error::ApiError;
use crate::validation::Validator;

pub const MAX_BODY_BYTES: usize = 1_048_576;

/// A JSON request body decoded into `T`.
///
/// Each way a body can be wrong gets its own message: bad syntax (with a
/// byte offset), a field of the wrong type, an unknown field, an empty or
/// oversized body, and trailing values after the first.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        if !has_json_content_type(req.headers()) {
            return Err(ApiError::MalformedRequestBody(
                "body must be sent with Content-Type: application/json".into(),
            ));
        }
        if declared_length(req.headers()).is_some_and(|len| len > MAX_BODY_BYTES) {
            return Err(too_large());
        }

        let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|err| {
                let inner = err.into_inner();
                if inner.downcast_ref::<LengthLimitError>().is_some() {
                    too_large()
                } else {
                    ApiError::MalformedRequestBody(format!("unable to read body: {inner}"))
                }
            })?;

        decode(&bytes).map(JsonBody)
    }
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn too_large() -> ApiError {
    ApiError::MalformedRequestBody(format!("body must not be larger than {MAX_BODY_BYTES} bytes"))
}

pub fn decode<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    let Some(start) = bytes.iter().position(|b| !b.is_ascii_whitespace()) else {
        return Err(ApiError::MalformedRequestBody("body must not be empty".into()));
    };
    // Bodies are objects. serde would fill a struct from an array by position.
    if bytes[start] == b'[' {
        return Err(ApiError::MalformedRequestBody(format!(
            "body contains incorrect JSON type (at character {})",
            start + 1
        )));
    }

    let mut de = serde_json::Deserializer::from_slice(bytes);
    let value: T = serde_path_to_error::deserialize(&mut de).map_err(|err| {
        let path = err.path().to_string();
        ApiError::MalformedRequestBody(describe(err.into_inner(), &path, bytes))
    })?;

    de.end().map_err(|_| {
        ApiError::MalformedRequestBody("body must only contain a single JSON value".into())
    })?;

    Ok(value)
}

fn describe(err: serde_json::Error, path: &str, bytes: &[u8]) -> String {
    let offset = byte_offset(bytes, err.line(), err.column());
    match err.classify() {
        Category::Syntax => format!("body contains badly-formed JSON (at character {offset})"),
        Category::Eof => "body contains badly-formed JSON".to_string(),
        Category::Io => format!("unable to read body: {err}"),
        Category::Data => {
            let message = strip_position(&err.to_string());
            if let Some(field) = unknown_field(&message) {
                format!("body contains unknown key \"{field}\"")
            } else if message.starts_with("invalid type") {
                if path.is_empty() || path == "." {
                    format!("body contains incorrect JSON type (at character {offset})")
                } else {
                    format!("body contains incorrect JSON type for field \"{path}\"")
                }
            } else {
                message
            }
        }
    }
}

/// serde_json reports 1-based line and column; turn them into a byte offset.
fn byte_offset(bytes: &[u8], line: usize, column: usize) -> usize {
    let line_start: usize = bytes
        .split(|b| *b == b'\n')
        .take(line.saturating_sub(1))
        .map(|l| l.len() + 1)
        .sum();
    line_start + column
}

fn strip_position(message: &str) -> String {
    match message.rfind(" at line ") {
        Some(idx) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

fn unknown_field(message: &str) -> Option<&str> {
    let rest = message.strip_prefix("unknown field `")?;
    rest.split('`').next()
}

/// The positive integer `:id` path segment. Anything else reads as a
/// missing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for RecordId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::RecordNotFound)?;
        read_id(&raw).map(RecordId)
    }
}

pub fn read_id(raw: &str) -> Result<i64, ApiError> {
    match raw.parse::<i64>() {
        Ok(id) if id >= 1 => Ok(id),
        _ => Err(ApiError::RecordNotFound),
    }
}

pub fn read_string(qs: &HashMap<String, String>, key: &str, default: &str) -> String {
    match qs.get(key) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => default.to_string(),
    }
}

pub fn read_csv(qs: &HashMap<String, String>, key: &str, default: Vec<String>) -> Vec<String> {
    match qs.get(key) {
        Some(value) if !value.is_empty() => value.split(',').map(str::to_string).collect(),
        _ => default,
    }
}

/// Integer query parameter; a value that does not parse is recorded on `v`
/// and the default is returned.
pub fn read_int(qs: &HashMap<String, String>, key: &str, default: i64, v: &mut Validator) -> i64 {
    match qs.get(key) {
        Some(value) if !value.is_empty() => value.parse().unwrap_or_else(|_| {
            v.add_error(key, "must be an integer value");
            default
        }),
        _ => default,
    }
}
