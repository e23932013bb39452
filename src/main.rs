use anyhow::{Context, Result};
use clap::Parser;
use movies_api::config::{Config, LogFormat};
use movies_api::mailer::{LogMailer, Mailer, SmtpMailer};
use movies_api::server::Server;
use movies_api::shutdown::DrainOutcome;
use movies_api::store::postgres::PostgresStore;
use movies_api::store::Models;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("movies_api={level},tower_http={level}", level = config.log_level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::parse();
    config.validate().context("invalid configuration")?;

    init_tracing(&config);
    tracing::info!(env = %config.env, port = config.port, "starting movies api");

    let models = match config.db.dsn.as_deref() {
        Some(dsn) => {
            let store = PostgresStore::connect(dsn, &config.db)
                .await
                .context("failed to connect to database")?;
            tracing::info!("database connection pool established");
            Models::postgres(store)
        }
        None => {
            tracing::warn!("no database configured, using in-memory store");
            Models::memory()
        }
    };

    let mailer: Arc<dyn Mailer> = match config.smtp.host.as_deref() {
        Some(host) => Arc::new(SmtpMailer::new(host, &config.smtp).context("invalid smtp settings")?),
        None => {
            tracing::warn!("no smtp host configured, mail will only be logged");
            Arc::new(LogMailer)
        }
    };

    let server = Server::new(config, models, mailer);
    let listener = server.bind().await?;
    let report = server.run(listener).await.context("server error")?;

    if report.outcome == DrainOutcome::DeadlineElapsed {
        tracing::warn!(
            outstanding = report.outstanding_tasks,
            "exited before all background work finished"
        );
    }
    Ok(())
}
