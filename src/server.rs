use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::routing::{get, post, put, MethodRouter};
use axum::Router;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth;
use crate::background::BackgroundTasks;
use crate::config::Config;
use crate::handlers::{self, movies, tokens, users};
use crate::mailer::Mailer;
use crate::middleware::{logging_middleware, method_not_allowed, rate_limit, recover_panic};
use crate::models::{MOVIES_READ, MOVIES_WRITE};
use crate::rate_limiter::RateLimiter;
use crate::shutdown::{shutdown_signal, DrainReport, ServeError, ShutdownCoordinator};
use crate::store::Models;
use crate::tokens::TokenService;

/// Everything a handler may reach, cloned cheaply into each request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub models: Models,
    pub tokens: TokenService,
    pub limiter: Arc<RateLimiter>,
    pub mailer: Arc<dyn Mailer>,
    pub background: BackgroundTasks,
}

impl AppState {
    pub fn new(config: Config, models: Models, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(&config.limiter)),
            tokens: TokenService::new(&models),
            config: Arc::new(config),
            models,
            mailer,
            background: BackgroundTasks::new(),
        }
    }
}

fn with_permission(route: MethodRouter<AppState>, state: &AppState, code: &'static str) -> MethodRouter<AppState> {
    route.route_layer(middleware::from_fn_with_state(
        state.clone(),
        move |state: State<AppState>, req: Request, next: Next| auth::require_permission(state, code, req, next),
    ))
}

fn with_authentication(route: MethodRouter<AppState>) -> MethodRouter<AppState> {
    route.route_layer(middleware::from_fn(auth::require_authenticated_user))
}

fn cors(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_trusted_origins
        .iter()
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring malformed trusted origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::OPTIONS, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ])
}

/// The full application: routes, guards and the middleware stack.
pub fn create_app(state: AppState) -> Router {
    let movie_collection = with_permission(get(movies::list_movies), &state, MOVIES_READ)
        .merge(with_permission(post(movies::create_movie), &state, MOVIES_WRITE));
    let movie_item = with_permission(get(movies::show_movie), &state, MOVIES_READ).merge(with_permission(
        axum::routing::patch(movies::update_movie).delete(movies::delete_movie),
        &state,
        MOVIES_WRITE,
    ));
    let authentication_tokens = post(tokens::create_authentication_token)
        .merge(with_authentication(axum::routing::delete(tokens::delete_authentication_tokens)));

    Router::new()
        .route("/v1/healthcheck", get(handlers::healthcheck))
        .route("/v1/movies", movie_collection)
        .route("/v1/movies/:id", movie_item)
        .route("/v1/users", post(users::register_user))
        .route("/v1/users/activated", put(users::activate_user))
        .route("/v1/users/password", put(users::update_password))
        .route("/v1/tokens/authentication", authentication_tokens)
        .route("/v1/tokens/activation", post(tokens::create_activation_token))
        .route("/v1/tokens/password-reset", post(tokens::create_password_reset_token))
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), auth::authenticate))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(recover_panic))
                .layer(TraceLayer::new_for_http())
                .layer(cors(&state.config))
                .layer(middleware::from_fn(logging_middleware))
                .layer(middleware::from_fn(method_not_allowed)),
        )
        .with_state(state)
}

pub struct Server {
    state: AppState,
    coordinator: ShutdownCoordinator,
}

impl Server {
    pub fn new(config: Config, models: Models, mailer: Arc<dyn Mailer>) -> Self {
        let coordinator = ShutdownCoordinator::new(config.shutdown_timeout);
        Self {
            state: AppState::new(config, models, mailer),
            coordinator,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, ServeError> {
        TcpListener::bind(("0.0.0.0", self.state.config.port))
            .await
            .map_err(ServeError::Bind)
    }

    /// Serve until SIGINT or SIGTERM, then drain.
    pub async fn run(self, listener: TcpListener) -> Result<DrainReport, ServeError> {
        self.run_until(listener, shutdown_signal()).await
    }

    /// Serve until `signal` resolves, then drain.
    pub async fn run_until<F>(self, listener: TcpListener, signal: F) -> Result<DrainReport, ServeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().map_err(ServeError::Bind)?;
        info!(
            addr = %addr,
            env = %self.state.config.env,
            limiter_enabled = self.state.limiter.is_enabled(),
            "starting server"
        );

        let trigger = self.coordinator.clone();
        let watcher = tokio::spawn(async move {
            signal.await;
            trigger.begin_draining();
        });

        let sweeper = self
            .state
            .limiter
            .is_enabled()
            .then(|| self.state.limiter.spawn_sweeper(self.coordinator.subscribe()));

        let background = self.state.background.clone();
        let app = create_app(self.state);
        let listener = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(self.coordinator.draining())
            .into_future();

        let report = self.coordinator.drain(listener, &background).await;

        watcher.abort();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        report
    }
}
