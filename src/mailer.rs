use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug)]
pub enum MailError {
    /// Transport-level failure: connect, TLS, timeout inside the client.
    Transport(String),
    /// The mail API answered with a non-success status.
    Rejected { status: u16, body: String },
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailError::Transport(msg) => write!(f, "mail transport error: {msg}"),
            MailError::Rejected { status, body } => {
                write!(f, "mail API rejected message ({status}): {body}")
            }
        }
    }
}

impl std::error::Error for MailError {}

/// Outbound mail capability. Any error is retryable from the caller's side.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

#[derive(Serialize)]
struct OutboundEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

/// Sends through a Resend-compatible JSON API: `POST {api_url}` with a bearer key.
pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(api_url: String, api_key: String, from: String, timeout: Duration) -> Result<Self, MailError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_url,
            api_key,
            from,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let payload = OutboundEmail {
            from: &self.from,
            to: [to],
            subject,
            text: body,
        };
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(MailError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Used when no mail API is configured: messages are logged and count as sent.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        tracing::info!(%to, %subject, "mail (log only): {body}");
        Ok(())
    }
}
