//! Outbound mail.
//!
//! Messages are plain text built in code. Delivery is attempted a fixed
//! number of times with a pause in between; callers run it from a
//! background task so the triggering request never waits on the relay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SmtpConfig;

pub const SEND_ATTEMPTS: u32 = 3;
pub const RETRY_PAUSE: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("could not build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("smtp delivery failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// The messages this service sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Email {
    Welcome {
        user_id: i64,
        activation_token: String,
    },
    Activation {
        activation_token: String,
    },
    PasswordReset {
        token: String,
        expiry: DateTime<Utc>,
    },
}

impl Email {
    pub fn subject(&self) -> &'static str {
        match self {
            Email::Welcome { .. } => "Welcome to Movies!",
            Email::Activation { .. } => "Activate your Movies account",
            Email::PasswordReset { .. } => "Reset your Movies password",
        }
    }

    pub fn body(&self) -> String {
        match self {
            Email::Welcome {
                user_id,
                activation_token,
            } => format!(
                "Hi,\n\n\
                 Thanks for signing up for a Movies account. We're excited to have you on board!\n\n\
                 For future reference, your user ID number is {user_id}.\n\n\
                 Please send a request to the `PUT /v1/users/activated` endpoint with the following \
                 JSON body to activate your account:\n\n\
                 {{\"token\": \"{activation_token}\"}}\n\n\
                 Please note that this is a one-time use token and it will expire in 3 days.\n\n\
                 Thanks,\n\nThe Movies Team\n"
            ),
            Email::Activation { activation_token } => format!(
                "Hi,\n\n\
                 Please send a `PUT /v1/users/activated` request with the following JSON body to \
                 activate your account:\n\n\
                 {{\"token\": \"{activation_token}\"}}\n\n\
                 Please note that this is a one-time use token and it will expire in 3 days.\n\n\
                 Thanks,\n\nThe Movies Team\n"
            ),
            Email::PasswordReset { token, expiry } => format!(
                "Hi,\n\n\
                 Please send a `PUT /v1/users/password` request with the following JSON body to \
                 set a new password:\n\n\
                 {{\"password\": \"your new password\", \"token\": \"{token}\"}}\n\n\
                 Please note that this is a one-time use token and it will expire at {expiry}.\n\n\
                 Thanks,\n\nThe Movies Team\n",
                expiry = expiry.to_rfc3339()
            ),
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipient: &str, email: &Email) -> Result<(), MailError>;
}

/// Delivers through an SMTP relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpMailer {
    pub fn new(host: &str, config: &SmtpConfig) -> Result<Self, MailError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(config.port)
            .timeout(Some(CONNECT_TIMEOUT))
            .tls(Tls::Opportunistic(TlsParameters::new(host.to_string())?));

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            sender: config.sender.parse()?,
        })
    }

    fn message(&self, recipient: &str, email: &Email) -> Result<Message, MailError> {
        Ok(Message::builder()
            .from(self.sender.clone())
            .to(recipient.parse()?)
            .subject(email.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(email.body())?)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, recipient: &str, email: &Email) -> Result<(), MailError> {
        let message = self.message(recipient, email)?;

        let mut attempt = 1;
        loop {
            match self.transport.send(message.clone()).await {
                Ok(_) => return Ok(()),
                Err(err) if attempt < SEND_ATTEMPTS => {
                    warn!(attempt, error = %err, "mail delivery failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Writes messages to the log instead of delivering them. Used when no
/// relay is configured.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, recipient: &str, email: &Email) -> Result<(), MailError> {
        let _: Mailbox = recipient.parse()?;
        info!(
            recipient,
            subject = email.subject(),
            body = %email.body(),
            "mail not delivered, no smtp relay configured"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welcome_body_carries_token_and_id() {
        let email = Email::Welcome {
            user_id: 42,
            activation_token: "Y3QMGX3PJ3WLRL2YRTQGQ6KRHU".into(),
        };
        let body = email.body();
        assert!(body.contains("user ID number is 42"));
        assert!(body.contains("{\"token\": \"Y3QMGX3PJ3WLRL2YRTQGQ6KRHU\"}"));
    }

    #[tokio::test]
    async fn test_log_mailer_rejects_bad_recipient() {
        let email = Email::Activation {
            activation_token: "x".into(),
        };
        assert!(LogMailer.send("alice@example.com", &email).await.is_ok());
        assert!(matches!(
            LogMailer.send("not an address", &email).await,
            Err(MailError::Address(_))
        ));
    }

    #[tokio::test]
    async fn test_smtp_message_headers() {
        let config = SmtpConfig {
            host: Some("localhost".into()),
            port: 2525,
            username: String::new(),
            password: String::new(),
            sender: "Movies <no-reply@movies.local>".into(),
        };
        let mailer = SmtpMailer::new("localhost", &config).unwrap();
        let email = Email::Activation {
            activation_token: "abc".into(),
        };
        let message = mailer.message("bob@example.com", &email).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Activate your Movies account"));
        assert!(raw.contains("To: bob@example.com"));
    }
}
