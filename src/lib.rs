pub mod auth;
pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod mailer;
pub mod middleware;
pub mod models;
pub mod rate_limiter;
pub mod request;
pub mod response;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod token_bucket;
pub mod tokens;
pub mod validation;

pub use config::Config;
pub use error::{ApiError, Result};
pub use response::Envelope;
pub use server::{create_app, AppState, Server};
