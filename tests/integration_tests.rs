use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use clap::Parser;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use tower::ServiceExt;

use movies_api::config::Config;
use movies_api::mailer::{Email, MailError, Mailer};
use movies_api::models::{Filters, Metadata, Movie, Password, User, MOVIES_WRITE};
use movies_api::server::{create_app, AppState, Server};
use movies_api::shutdown::{DrainOutcome, DrainReport, ServeError};
use movies_api::store::{Models, MovieStore, StoreError, StoreResult};

#[derive(Clone, Default)]
struct RecordingMailer {
    sent: Arc<Mutex<Vec<(String, Email)>>>,
    delay: Option<Duration>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, recipient: &str, email: &Email) -> Result<(), MailError> {
        match self.delay {
            Some(delay) if delay == Duration::MAX => std::future::pending::<()>().await,
            Some(delay) => tokio::time::sleep(delay).await,
            None => {}
        }
        self.sent.lock().push((recipient.to_string(), email.clone()));
        Ok(())
    }
}

impl RecordingMailer {
    /// Waits until `recipient` has received `count` emails and returns the
    /// token carried by the latest one.
    async fn token_for(&self, recipient: &str, count: usize) -> String {
        for _ in 0..200 {
            let received: Vec<Email> = self
                .sent
                .lock()
                .iter()
                .filter(|(to, _)| to == recipient)
                .map(|(_, email)| email.clone())
                .collect();
            if received.len() >= count {
                return match received.last() {
                    Some(Email::Welcome { activation_token, .. }) => activation_token.clone(),
                    Some(Email::Activation { activation_token }) => activation_token.clone(),
                    Some(Email::PasswordReset { token, .. }) => token.clone(),
                    None => unreachable!(),
                };
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{recipient} never received email #{count}");
    }
}

fn test_config() -> Config {
    let mut config = Config::parse_from(["movies-api"]);
    config.bcrypt_cost = 4;
    config.limiter.enabled = false;
    config
}

struct TestApp {
    app: Router,
    state: AppState,
    mailer: RecordingMailer,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: Config) -> Self {
        Self::with_models(config, Models::memory())
    }

    fn with_models(config: Config, models: Models) -> Self {
        let mailer = RecordingMailer::default();
        let state = AppState::new(config, models, Arc::new(mailer.clone()));
        let app = create_app(state.clone())
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        Self { app, state, mailer }
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send_raw(request).await
    }

    async fn send_raw(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    /// Register, activate and log in a user; returns (user id, auth token).
    async fn activated_user(&self, email: &str) -> (i64, String) {
        let (status, _, body) = self
            .send(
                Method::POST,
                "/v1/users",
                None,
                Some(json!({"name": "Alice", "email": email, "password": "pa55word"})),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["user"]["id"].as_i64().unwrap();

        let activation = self.mailer.token_for(email, 1).await;
        let (status, _, body) = self
            .send(Method::PUT, "/v1/users/activated", None, Some(json!({"token": activation})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["activated"], true);

        (id, self.login(email, "pa55word").await)
    }

    async fn login(&self, email: &str, password: &str) -> String {
        let (status, _, body) = self
            .send(
                Method::POST,
                "/v1/tokens/authentication",
                None,
                Some(json!({"email": email, "password": password})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["authentication_token"]["token"].as_str().unwrap().to_string()
    }

    async fn writer(&self) -> String {
        let (id, token) = self.activated_user("writer@example.com").await;
        self.state.models.permissions.add_for_user(id, &[MOVIES_WRITE]).await.unwrap();
        token
    }
}

fn varies_on_authorization(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::VARY)
        .iter()
        .any(|value| value.to_str().is_ok_and(|v| v.contains("Authorization")))
}

fn moana() -> Value {
    json!({"title": "Moana", "year": 2016, "runtime": "107 mins", "genres": ["animation", "adventure"]})
}

#[tokio::test]
async fn test_healthcheck() {
    let app = TestApp::new();
    let (status, headers, body) = app.send(Method::GET, "/v1/healthcheck", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "available");
    assert_eq!(body["system_info"]["environment"], "development");
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert!(varies_on_authorization(&headers));
    assert!(headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn test_unknown_route_and_wrong_method() {
    let app = TestApp::new();

    let (status, _, body) = app.send(Method::GET, "/v1/nothing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "the requested resource could not be found");

    let (status, headers, body) = app.send(Method::PUT, "/v1/healthcheck", None, None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["error"], "the PUT method is not supported for this resource");
    assert!(headers.contains_key(header::ALLOW));
}

#[tokio::test]
async fn test_anonymous_caller_needs_authentication_first() {
    let app = TestApp::new();
    for (method, uri) in [
        (Method::GET, "/v1/movies"),
        (Method::GET, "/v1/movies/1"),
        (Method::DELETE, "/v1/movies/1"),
        (Method::DELETE, "/v1/tokens/authentication"),
    ] {
        let (status, _, body) = app.send(method, uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "you must be authenticated to access this resource");
    }
}

#[tokio::test]
async fn test_bad_tokens_get_identical_responses() {
    let app = TestApp::new();
    let mut responses = Vec::new();

    for header in [
        "Bearer ABCDEFGHIJKLMNOPQRSTUVWXYZ",
        "Bearer short",
        "Basic YWxpY2U6cGE1NXdvcmQ=",
        "Bearer",
    ] {
        let request = Request::builder()
            .uri("/v1/healthcheck")
            .header(header::AUTHORIZATION, header)
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = app.send_raw(request).await;
        assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
        assert!(varies_on_authorization(&headers));
        responses.push((status, body));
    }

    assert_eq!(responses[0].0, StatusCode::UNAUTHORIZED);
    assert_eq!(responses[0].1["error"], "invalid or missing authentication token");
    assert!(responses.iter().all(|r| *r == responses[0]));
}

#[tokio::test]
async fn test_inactive_and_unpermitted_users_are_refused() {
    let app = TestApp::new();

    let (status, _, _) = app
        .send(
            Method::POST,
            "/v1/users",
            None,
            Some(json!({"name": "Bob", "email": "bob@example.com", "password": "pa55word"})),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let inactive = app.login("bob@example.com", "pa55word").await;

    let (status, _, body) = app.send(Method::GET, "/v1/movies", Some(&inactive), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "your user account must be activated to access this resource");

    let (_, reader) = app.activated_user("reader@example.com").await;
    let (status, _, _) = app.send(Method::GET, "/v1/movies", Some(&reader), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = app.send(Method::POST, "/v1/movies", Some(&reader), Some(moana())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["error"],
        "your user account doesn't have the necessary permissions to access this resource"
    );
}

#[tokio::test]
async fn test_movie_lifecycle() {
    let app = TestApp::new();
    let token = app.writer().await;

    let (status, headers, body) = app.send(Method::POST, "/v1/movies", Some(&token), Some(moana())).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["movie"]["id"].as_i64().unwrap();
    assert_eq!(headers[header::LOCATION], format!("/v1/movies/{id}").as_str());
    assert_eq!(body["movie"]["runtime"], "107 mins");
    assert_eq!(body["movie"]["version"], 1);

    let uri = format!("/v1/movies/{id}");
    let (status, _, body) = app.send(Method::GET, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["movie"]["title"], "Moana");

    let (status, _, body) = app
        .send(Method::PATCH, &uri, Some(&token), Some(json!({"title": "Moana (2016)"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["movie"]["title"], "Moana (2016)");
    assert_eq!(body["movie"]["year"], 2016);
    assert_eq!(body["movie"]["version"], 2);

    let (status, _, body) = app.send(Method::DELETE, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "movie successfully deleted");

    let (status, _, _) = app.send(Method::DELETE, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = app.send(Method::GET, "/v1/movies/abc", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_genre_validation() {
    let app = TestApp::new();
    let token = app.writer().await;

    let mut duplicate = moana();
    duplicate["genres"] = json!(["drama", "drama"]);
    let (status, _, body) = app.send(Method::POST, "/v1/movies", Some(&token), Some(duplicate)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["genres"], "must not contain duplicate genres");

    let mut too_many = moana();
    too_many["genres"] = json!(["a", "b", "c", "d", "e", "f"]);
    let (status, _, body) = app.send(Method::POST, "/v1/movies", Some(&token), Some(too_many)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["error"]["genres"],
        "too many genres: must not contain more than 5 genres"
    );

    let (status, _, body) = app.send(Method::POST, "/v1/movies", Some(&token), Some(json!({}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    for field in ["title", "year", "runtime", "genres"] {
        assert!(body["error"][field].is_string(), "missing error for {field}");
    }
}

#[tokio::test]
async fn test_concurrent_edits_conflict() {
    let app = TestApp::new();
    let token = app.writer().await;
    let (_, _, body) = app.send(Method::POST, "/v1/movies", Some(&token), Some(moana())).await;
    let uri = format!("/v1/movies/{}", body["movie"]["id"]);

    let patch = |year: i32| {
        Request::builder()
            .method(Method::PATCH)
            .uri(&uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-expected-version", "1")
            .body(Body::from(json!({ "year": year }).to_string()))
            .unwrap()
    };

    let (status, _, _) = app.send_raw(patch(2015)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = app.send_raw(patch(2014)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        body["error"],
        "unable to update the record due to an edit conflict, please try again"
    );
}

#[tokio::test]
async fn test_list_movies_filters_and_paginates() {
    let app = TestApp::new();
    let token = app.writer().await;
    for (title, year, genres) in [
        ("Moana", 2016, json!(["animation", "adventure"])),
        ("Black Panther", 2018, json!(["action", "adventure"])),
        ("Deadpool", 2016, json!(["action", "comedy"])),
    ] {
        let body = json!({"title": title, "year": year, "runtime": "100 mins", "genres": genres});
        let (status, _, _) = app.send(Method::POST, "/v1/movies", Some(&token), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, _, body) = app
        .send(Method::GET, "/v1/movies?sort=-year&page_size=2", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["movies"].as_array().unwrap().len(), 2);
    assert_eq!(body["movies"][0]["title"], "Black Panther");
    assert_eq!(body["metadata"]["total_records"], 3);
    assert_eq!(body["metadata"]["last_page"], 2);

    let (_, _, body) = app
        .send(Method::GET, "/v1/movies?genres=adventure&title=moana", Some(&token), None)
        .await;
    assert_eq!(body["movies"].as_array().unwrap().len(), 1);

    let (status, _, body) = app
        .send(Method::GET, "/v1/movies?sort=rating&page=0&page_size=x", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["sort"], "invalid sort value");
    assert_eq!(body["error"]["page"], "must be greater than zero");
    assert_eq!(body["error"]["page_size"], "must be an integer value");
}

#[tokio::test]
async fn test_malformed_bodies() {
    let app = TestApp::new();
    let token = app.writer().await;

    let post = |body: &'static str, content_type: &'static str| {
        Request::builder()
            .method(Method::POST)
            .uri("/v1/movies")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    };

    for (body, expected) in [
        ("", "body must not be empty"),
        (r#"{"title": "Moana", "rating": 5}"#, "body contains unknown key \"rating\""),
        (r#"{"title": 42}"#, "body contains incorrect JSON type for field \"title\""),
        (r#"{"title": "Moana"}{"title": "Cars"}"#, "body must only contain a single JSON value"),
        (r#"{"title": "Moana""#, "body contains badly-formed JSON"),
        (r#"{"runtime": "107 minutes"}"#, "invalid runtime format"),
        ("[]", "body contains incorrect JSON type (at character 1)"),
        (
            r#"["Moana", 2016, "107 mins", ["drama"]]"#,
            "body contains incorrect JSON type (at character 1)",
        ),
    ] {
        let (status, _, response) = app.send_raw(post(body, "application/json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(response["error"], expected, "{body}");
    }

    let (status, _, _) = app.send_raw(post(r#"{"title": "Moana"}"#, "text/plain")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, _, listing) = app.send(Method::GET, "/v1/movies", Some(&token), None).await;
    assert!(listing["movies"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_registration_rules() {
    let app = TestApp::new();
    app.activated_user("alice@example.com").await;

    let (status, _, body) = app
        .send(
            Method::POST,
            "/v1/users",
            None,
            Some(json!({"name": "Alice", "email": "alice@example.com", "password": "pa55word"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["email"], "a user with this email address already exists");

    let (status, _, body) = app
        .send(
            Method::POST,
            "/v1/users",
            None,
            Some(json!({"name": "", "email": "not-an-email", "password": "short"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["name"], "must be provided");
    assert_eq!(body["error"]["email"], "must be a valid email address");
    assert_eq!(body["error"]["password"], "must be at least 8 bytes long");

    let (status, _, body) = app
        .send(Method::PUT, "/v1/users/activated", None, Some(json!({"token": "ABCDEFGHIJKLMNOPQRSTUVWXYZ"})))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["token"], "invalid or expired activation token");

    let (status, _, body) = app
        .send(
            Method::POST,
            "/v1/tokens/activation",
            None,
            Some(json!({"email": "alice@example.com"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["email"], "user has already been activated");
}

#[tokio::test]
async fn test_login_rejects_bad_credentials() {
    let app = TestApp::new();
    app.activated_user("alice@example.com").await;

    for (email, password) in [
        ("alice@example.com", "wrong-password"),
        ("nobody@example.com", "pa55word"),
    ] {
        let (status, _, body) = app
            .send(
                Method::POST,
                "/v1/tokens/authentication",
                None,
                Some(json!({"email": email, "password": password})),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid authentication credentials");
    }
}

#[tokio::test]
async fn test_logout_revokes_tokens() {
    let app = TestApp::new();
    let (_, token) = app.activated_user("alice@example.com").await;

    let (status, _, _) = app.send(Method::DELETE, "/v1/tokens/authentication", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = app.send(Method::GET, "/v1/movies", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid or missing authentication token");
}

#[tokio::test]
async fn test_password_reset_flow() {
    let app = TestApp::new();
    let (_, old_token) = app.activated_user("alice@example.com").await;

    let (status, _, _) = app
        .send(
            Method::POST,
            "/v1/tokens/password-reset",
            None,
            Some(json!({"email": "alice@example.com"})),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let reset = app.mailer.token_for("alice@example.com", 2).await;

    let (status, _, body) = app
        .send(
            Method::PUT,
            "/v1/users/password",
            None,
            Some(json!({"password": "n3w-pa55word", "token": reset})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "your password was successfully reset");

    let (status, _, _) = app.send(Method::GET, "/v1/movies", Some(&old_token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = app
        .send(
            Method::PUT,
            "/v1/users/password",
            None,
            Some(json!({"password": "an0ther-pa55word", "token": reset})),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    app.login("alice@example.com", "n3w-pa55word").await;
}

#[tokio::test]
async fn test_rate_limit_rejects_burst_overflow() {
    let mut config = test_config();
    config.limiter.enabled = true;
    config.limiter.burst = 2;
    config.limiter.rps = 0.001;
    let app = TestApp::with_config(config);

    for _ in 0..2 {
        let (status, _, _) = app.send(Method::GET, "/v1/healthcheck", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _, body) = app.send(Method::GET, "/v1/healthcheck", None, None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate limit exceeded");
    assert_eq!(app.state.limiter.tracked_clients(), 1);
}

#[tokio::test]
async fn test_disabled_rate_limit_admits_everything() {
    let mut config = test_config();
    config.limiter.burst = 1;
    let app = TestApp::with_config(config);

    for _ in 0..10 {
        let (status, _, _) = app.send(Method::GET, "/v1/healthcheck", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(app.state.limiter.tracked_clients(), 0);
}

const SERVER_ERROR: &str = "the server encountered a problem and could not process your request";

/// Movie storage where reading a movie panics and every other call fails.
struct BrokenMovies;

#[async_trait]
impl MovieStore for BrokenMovies {
    async fn insert(&self, _movie: &mut Movie) -> StoreResult<()> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn get(&self, id: i64) -> StoreResult<Movie> {
        panic!("movie {id} is unreadable")
    }

    async fn update(&self, _movie: &mut Movie) -> StoreResult<()> {
        Err(StoreError::Timeout(Duration::from_secs(3)))
    }

    async fn delete(&self, _id: i64) -> StoreResult<()> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn get_all(
        &self,
        _title: &str,
        _genres: &[String],
        _filters: &Filters,
    ) -> StoreResult<(Vec<Movie>, Metadata)> {
        Err(StoreError::Timeout(Duration::from_secs(3)))
    }
}

fn broken_movies_app() -> TestApp {
    let mut models = Models::memory();
    models.movies = Arc::new(BrokenMovies);
    TestApp::with_models(test_config(), models)
}

#[tokio::test]
async fn test_failed_delete_is_a_server_error() {
    let app = broken_movies_app();
    let token = app.writer().await;

    let (status, _, body) = app.send(Method::DELETE, "/v1/movies/1", Some(&token), None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], SERVER_ERROR);

    let (status, _, body) = app.send(Method::GET, "/v1/movies", Some(&token), None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], SERVER_ERROR);
}

#[tokio::test]
async fn test_handler_panic_is_recovered() {
    let app = broken_movies_app();
    let token = app.writer().await;

    let (status, headers, body) = app.send(Method::GET, "/v1/movies/1", Some(&token), None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(headers[header::CONNECTION], "close");
    assert_eq!(body["error"], SERVER_ERROR);

    let (status, _, _) = app.send(Method::GET, "/v1/healthcheck", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_user_without_password_hash_is_a_server_error() {
    let app = TestApp::new();
    let mut user = User::draft("Ghost".into(), "ghost@example.com".into(), Password::default());
    user.activated = true;
    app.state.models.users.insert(&mut user).await.unwrap();

    let (status, _, body) = app
        .send(
            Method::POST,
            "/v1/tokens/authentication",
            None,
            Some(json!({"email": "ghost@example.com", "password": "pa55word"})),
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], SERVER_ERROR);
}

#[tokio::test]
async fn test_cors_answers_trusted_preflight_only() {
    let mut config = test_config();
    config.cors_trusted_origins = vec!["https://trusted.example".to_string()];
    let app = TestApp::with_config(config);

    let preflight = |origin: &str| {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/v1/movies/1")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PATCH")
            .body(Body::empty())
            .unwrap()
    };

    let (status, headers, _) = app.send_raw(preflight("https://trusted.example")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://trusted.example");

    let (_, headers, _) = app.send_raw(preflight("https://elsewhere.example")).await;
    assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

async fn spawn_server(
    mailer: RecordingMailer,
    shutdown_timeout: Duration,
) -> (
    String,
    tokio::sync::oneshot::Sender<()>,
    tokio::task::JoinHandle<Result<DrainReport, ServeError>>,
) {
    let mut config = test_config();
    config.shutdown_timeout = shutdown_timeout;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let server = Server::new(config, Models::memory(), Arc::new(mailer));

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(listener, async move {
        let _ = rx.await;
    }));
    (base, tx, handle)
}

async fn register_over_http(base: &str) {
    let response = reqwest::Client::new()
        .post(format!("{base}/v1/users"))
        .json(&json!({"name": "Alice", "email": "alice@example.com", "password": "pa55word"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
}

#[tokio::test]
async fn test_shutdown_drains_background_work() {
    let mailer = RecordingMailer {
        delay: Some(Duration::from_millis(300)),
        ..Default::default()
    };
    let (base, trigger, handle) = spawn_server(mailer.clone(), Duration::from_secs(5)).await;

    let health = reqwest::get(format!("{base}/v1/healthcheck")).await.unwrap();
    assert_eq!(health.status().as_u16(), 200);

    register_over_http(&base).await;
    assert!(mailer.sent.lock().is_empty());

    trigger.send(()).unwrap();
    let report = assert_ok!(handle.await.unwrap());

    assert_eq!(report.outcome, DrainOutcome::Completed);
    assert_eq!(report.outstanding_tasks, 0);
    assert_eq!(mailer.sent.lock().len(), 1);
    assert!(reqwest::get(format!("{base}/v1/healthcheck")).await.is_err());
}

#[tokio::test]
async fn test_shutdown_deadline_abandons_stuck_work() {
    let mailer = RecordingMailer {
        delay: Some(Duration::MAX),
        ..Default::default()
    };
    let (base, trigger, handle) = spawn_server(mailer.clone(), Duration::from_millis(200)).await;

    register_over_http(&base).await;
    trigger.send(()).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server exits within the deadline")
        .unwrap();
    let report = assert_ok!(report);
    assert_eq!(report.outcome, DrainOutcome::DeadlineElapsed);
    assert_eq!(report.outstanding_tasks, 1);
    assert!(mailer.sent.lock().is_empty());
}
