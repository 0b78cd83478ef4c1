//! 外联层：内容生成、邮件外发、活动引擎

pub mod content;
pub mod engine;
pub mod mailer;

pub use content::{fallback_content, truncate_words, ContentGenerator, ContentPreview, GeneratedContent};
pub use engine::{CampaignEngine, CampaignSettings, ContentOverride};
pub use mailer::{
    build_message, MailError, MailTransport, OutboundMail, RecordingMailer, SenderIdentity,
    SmtpCredentials, SmtpMailer,
};
