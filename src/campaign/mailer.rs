//! 邮件外发：MailTransport 抽象 + lettre SMTP 实现 + 记录型实现（测试 / 演练）

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use thiserror::Error;

use crate::config::SmtpConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailError {
    #[error("Invalid address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("Message build failed: {0}")]
    Build(String),

    #[error("SMTP error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub email: String,
    pub name: String,
}

#[derive(Clone)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 邮件发送通道
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        mail: &OutboundMail,
        sender: &SenderIdentity,
        credentials: &SmtpCredentials,
    ) -> Result<(), MailError>;
}

fn parse_address(raw: &str) -> Result<Address, MailError> {
    raw.trim().parse::<Address>().map_err(|e| MailError::Address {
        address: raw.to_string(),
        reason: e.to_string(),
    })
}

/// 纯文本邮件，发件人显示为 `Name <email>`
pub fn build_message(mail: &OutboundMail, sender: &SenderIdentity) -> Result<Message, MailError> {
    let from = Mailbox::new(Some(sender.name.clone()), parse_address(&sender.email)?);
    let to = Mailbox::new(None, parse_address(&mail.to)?);
    Message::builder()
        .from(from)
        .to(to)
        .subject(mail.subject.as_str())
        .body(mail.body.clone())
        .map_err(|e| MailError::Build(e.to_string()))
}

/// lettre 同步 SMTP 传输，放到阻塞线程池执行
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    server: String,
    port: u16,
    starttls: bool,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Self {
        Self {
            server: config.server.clone(),
            port: config.port,
            starttls: config.starttls,
        }
    }

    fn transport(&self, credentials: &SmtpCredentials) -> Result<SmtpTransport, MailError> {
        let builder = if self.starttls {
            SmtpTransport::starttls_relay(&self.server)
        } else {
            SmtpTransport::relay(&self.server)
        }
        .map_err(|e| MailError::Transport(format!("relay init failed for '{}': {}", self.server, e)))?;
        Ok(builder
            .port(self.port)
            .credentials(Credentials::new(
                credentials.username.clone(),
                credentials.password.clone(),
            ))
            .build())
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(
        &self,
        mail: &OutboundMail,
        sender: &SenderIdentity,
        credentials: &SmtpCredentials,
    ) -> Result<(), MailError> {
        let message = build_message(mail, sender)?;
        let transport = self.transport(credentials)?;
        let to = mail.to.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?
            .map_err(|e| MailError::Transport(format!("send failed for '{}': {}", to, e)))?;
        tracing::debug!(to = %mail.to, "mail sent");
        Ok(())
    }
}

/// 只记录不发送；可指定对某些收件人失败
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundMail>>,
    reject: Vec<String>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(mut self, address: &str) -> Self {
        self.reject.push(address.to_string());
        self
    }

    pub fn sent(&self) -> Vec<OutboundMail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn send(
        &self,
        mail: &OutboundMail,
        sender: &SenderIdentity,
        _credentials: &SmtpCredentials,
    ) -> Result<(), MailError> {
        build_message(mail, sender)?;
        if self.reject.iter().any(|r| r == &mail.to) {
            return Err(MailError::Transport(format!("recipient rejected: {}", mail.to)));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(mail.clone());
        }
        Ok(())
    }
}
