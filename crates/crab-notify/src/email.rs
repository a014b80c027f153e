//! SMTP transport: one alert per message, plain text.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crab_core::config::EmailTransportConfig;

use crate::error::{Result, TransportError};
use crate::transport::Transport;

pub struct EmailTransport {
    config: EmailTransportConfig,
}

impl EmailTransport {
    pub fn new(config: EmailTransportConfig) -> Self {
        Self { config }
    }

    fn mailer(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(
            &self.config.smtp_host,
        )
        .map_err(|e| TransportError::Config(format!("SMTP relay: {e}")))?
        .port(self.config.smtp_port);

        if let (Some(username), Some(password)) =
            (&self.config.username, &self.config.password)
        {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl Transport for EmailTransport {
    fn name(&self) -> &str {
        "email"
    }

    async fn dispatch(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        let from: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|e| TransportError::Config(format!("invalid from address: {e}")))?;
        let to: Mailbox = address
            .parse()
            .map_err(|e| TransportError::Dispatch(format!("invalid to address: {e}")))?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| TransportError::Dispatch(format!("build message: {e}")))?;

        self.mailer()?
            .send(email)
            .await
            .map_err(|e| TransportError::Dispatch(format!("SMTP send: {e}")))?;
        Ok(())
    }
}
