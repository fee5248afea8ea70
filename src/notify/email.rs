use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::EmailTransport;
use crate::config::SmtpConfig;
use crate::error::{AppError, AppResult};

/// Implicit-TLS submission port; everything else goes through STARTTLS.
const SMTPS_PORT: u16 = 465;

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig, timeout: std::time::Duration) -> AppResult<Self> {
        let builder = if config.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|e| AppError::internal(format!("invalid SMTP relay {}: {e}", config.host)))?;

        let mut builder = builder.port(config.port).timeout(Some(timeout));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| AppError::internal(format!("invalid SMTP_FROM: {e}")))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

fn build_message(from: &Mailbox, to: &str, subject: &str, body: &str) -> AppResult<Message> {
    let to = to
        .parse::<Mailbox>()
        .map_err(|_| AppError::bad_request(format!("Некорректный email: {to}")))?;
    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| AppError::internal(format!("failed to build email: {e}")))
}

#[async_trait]
impl EmailTransport for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> AppResult<()> {
        let message = build_message(&self.from, to, subject, body)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| AppError::upstream("smtp", e))?;
        tracing::debug!(to, subject, "email sent");
        Ok(())
    }
}
