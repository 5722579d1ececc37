//! Email delivery of password reset links.

use async_trait::async_trait;
use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{EmailConfig, EmailTransportConfig};
use crate::errors::Error;

/// Delivers reset tokens to subjects.
#[async_trait]
pub trait ResetNotifier: Send + Sync {
    async fn send_password_reset(&self, to_email: &str, to_name: Option<&str>, token: &str, valid_for: Duration) -> Result<(), Error>;

    /// Cheap reachability check for the health probe.
    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct EmailService {
    transport: EmailTransport,
    from_email: String,
    from_name: String,
    reply_to: Option<String>,
    reset_url: String,
}

enum EmailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File {
        transport: AsyncFileTransport<Tokio1Executor>,
        dir: PathBuf,
    },
}

impl EmailService {
    pub fn new(config: &EmailConfig) -> Result<Self, Error> {
        let transport = match &config.transport {
            EmailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let smtp_builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                } else {
                    Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
                }
                .map_err(|e| Error::Internal {
                    operation: format!("create SMTP transport: {e}"),
                })?
                .port(*port)
                .credentials(Credentials::new(username.clone(), password.clone()));

                EmailTransport::Smtp(smtp_builder.build())
            }
            EmailTransportConfig::File { path } => {
                let dir = Path::new(path).to_path_buf();
                if !dir.exists() {
                    std::fs::create_dir_all(&dir).map_err(|e| Error::Internal {
                        operation: format!("create emails directory: {e}"),
                    })?;
                }
                EmailTransport::File {
                    transport: AsyncFileTransport::<Tokio1Executor>::new(&dir),
                    dir,
                }
            }
        };

        Ok(Self {
            transport,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
            reply_to: config.reply_to.clone(),
            reset_url: config.reset_url.clone(),
        })
    }

    fn reset_link(&self, token: &str) -> String {
        let separator = if self.reset_url.contains('?') { '&' } else { '?' };
        format!("{}{separator}token={token}", self.reset_url)
    }

    async fn send_email(&self, to_email: &str, to_name: Option<&str>, subject: &str, body: String) -> Result<(), Error> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| Error::Internal {
                operation: format!("parse from email: {e}"),
            })?;

        let to = if let Some(name) = to_name {
            format!("{name} <{to_email}>")
        } else {
            to_email.to_string()
        }
        .parse::<Mailbox>()
        .map_err(|e| Error::Internal {
            operation: format!("parse to email: {e}"),
        })?;

        let mut builder = Message::builder().from(from).to(to).subject(subject).header(ContentType::TEXT_HTML);
        if let Some(reply_to) = &self.reply_to {
            let reply_to = reply_to.parse::<Mailbox>().map_err(|e| Error::Internal {
                operation: format!("parse reply-to email: {e}"),
            })?;
            builder = builder.reply_to(reply_to);
        }
        let message = builder.body(body).map_err(|e| Error::Internal {
            operation: format!("build email message: {e}"),
        })?;

        match &self.transport {
            EmailTransport::Smtp(smtp) => {
                smtp.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send SMTP email: {e}"),
                })?;
            }
            EmailTransport::File { transport, .. } => {
                transport.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send file email: {e}"),
                })?;
            }
        }

        Ok(())
    }

    fn password_reset_body(&self, to_name: Option<&str>, reset_link: &str, valid_for: Duration) -> String {
        let greeting = match to_name {
            Some(name) => format!("Hello {name},"),
            None => "Hello,".to_string(),
        };
        let minutes = valid_for.as_secs().div_ceil(60).max(1);

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Password Reset Request</title>
</head>
<body>
    <h2>Password Reset Request</h2>
    <p>{greeting}</p>
    <p>We received a request to reset your password. If you didn't make this request, you can safely ignore this email.</p>
    <p><a href="{reset_link}">Reset your password</a></p>
    <p>Or copy and paste this link into your browser:</p>
    <p>{reset_link}</p>
    <p>This link can be used once and expires in {minutes} minutes.</p>
</body>
</html>"#
        )
    }
}

#[async_trait]
impl ResetNotifier for EmailService {
    async fn send_password_reset(&self, to_email: &str, to_name: Option<&str>, token: &str, valid_for: Duration) -> Result<(), Error> {
        let body = self.password_reset_body(to_name, &self.reset_link(token), valid_for);
        self.send_email(to_email, to_name, "Password Reset Request", body).await
    }

    async fn ping(&self) -> Result<(), Error> {
        match &self.transport {
            EmailTransport::Smtp(smtp) => match smtp.test_connection().await {
                Ok(true) => Ok(()),
                Ok(false) => Err(Error::Unavailable {
                    dependency: "smtp".to_string(),
                }),
                Err(e) => {
                    tracing::debug!(error = %e, "SMTP connection test failed");
                    Err(Error::Unavailable {
                        dependency: "smtp".to_string(),
                    })
                }
            },
            EmailTransport::File { dir, .. } => {
                if tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
                    Ok(())
                } else {
                    Err(Error::Unavailable {
                        dependency: "email directory".to_string(),
                    })
                }
            }
        }
    }
}

/// Keeps every reset message in memory instead of sending it.
#[cfg(test)]
#[derive(Default)]
pub struct CapturingNotifier {
    pub sent: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl CapturingNotifier {
    /// Token of the most recent message sent to `email`.
    pub fn last_token_for(&self, email: &str) -> Option<String> {
        self.sent
            .lock()
            .ok()?
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, token)| token.clone())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
#[async_trait]
impl ResetNotifier for CapturingNotifier {
    async fn send_password_reset(&self, to_email: &str, _to_name: Option<&str>, token: &str, _valid_for: Duration) -> Result<(), Error> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((to_email.to_string(), token.to_string()));
        }
        Ok(())
    }
}
