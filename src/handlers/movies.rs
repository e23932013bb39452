use axum::extract::{Query, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{ApiError, Result};
use crate::models::{validate_filters, validate_movie, Filters, Movie, Runtime};
use crate::request::{read_csv, read_int, read_string, JsonBody, RecordId};
use crate::response::Envelope;
use crate::server::AppState;
use crate::validation::Validator;

pub const EXPECTED_VERSION_HEADER: &str = "x-expected-version";

const SORT_SAFELIST: &[&str] = &["id", "title", "year", "runtime", "-id", "-title", "-year", "-runtime"];

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CreateMovieInput {
    title: String,
    year: i32,
    runtime: Runtime,
    genres: Vec<String>,
}

/// Every field optional; only the ones present are changed.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UpdateMovieInput {
    title: Option<String>,
    year: Option<i32>,
    runtime: Option<Runtime>,
    genres: Option<Vec<String>>,
}

pub async fn create_movie(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<CreateMovieInput>,
) -> Result<Response> {
    let mut movie = Movie::draft(input.title, input.year, input.runtime, input.genres);

    let mut v = Validator::new();
    validate_movie(&mut v, &movie);
    v.finish()?;

    state.models.movies.insert(&mut movie).await?;

    let mut response = Envelope::of("movie", &movie)?.with_status(StatusCode::CREATED);
    let location = format!("/v1/movies/{}", movie.id);
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(LOCATION, value);
    }
    Ok(response)
}

pub async fn show_movie(State(state): State<AppState>, RecordId(id): RecordId) -> Result<Envelope> {
    let movie = state.models.movies.get(id).await?;
    Envelope::of("movie", movie)
}

pub async fn update_movie(
    State(state): State<AppState>,
    RecordId(id): RecordId,
    headers: HeaderMap,
    JsonBody(input): JsonBody<UpdateMovieInput>,
) -> Result<Envelope> {
    let mut movie = state.models.movies.get(id).await?;

    if let Some(expected) = headers.get(EXPECTED_VERSION_HEADER) {
        let expected = expected.to_str().unwrap_or_default();
        if expected != movie.version.to_string() {
            return Err(ApiError::EditConflict);
        }
    }

    if let Some(title) = input.title {
        movie.title = title;
    }
    if let Some(year) = input.year {
        movie.year = year;
    }
    if let Some(runtime) = input.runtime {
        movie.runtime = runtime;
    }
    if let Some(genres) = input.genres {
        movie.genres = genres;
    }

    let mut v = Validator::new();
    validate_movie(&mut v, &movie);
    v.finish()?;

    state.models.movies.update(&mut movie).await?;
    Envelope::of("movie", movie)
}

pub async fn delete_movie(State(state): State<AppState>, RecordId(id): RecordId) -> Result<Envelope> {
    state.models.movies.delete(id).await?;
    Ok(Envelope::message("movie successfully deleted"))
}

pub async fn list_movies(
    State(state): State<AppState>,
    Query(qs): Query<HashMap<String, String>>,
) -> Result<Envelope> {
    let mut v = Validator::new();

    let title = read_string(&qs, "title", "");
    let genres = read_csv(&qs, "genres", Vec::new());
    let filters = Filters {
        page: read_int(&qs, "page", 1, &mut v),
        page_size: read_int(&qs, "page_size", 20, &mut v),
        sort: read_string(&qs, "sort", "id"),
        sort_safelist: SORT_SAFELIST,
    };

    validate_filters(&mut v, &filters);
    v.finish()?;

    let (movies, metadata) = state.models.movies.get_all(&title, &genres, &filters).await?;
    Envelope::of("movies", movies)?.with("metadata", metadata)
}
