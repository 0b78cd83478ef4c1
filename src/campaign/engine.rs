//! 外联活动引擎：过滤 → 逐条解析内容 → 发送 → 计数 → 节奏等待
//!
//! CampaignState 是整个运行期间唯一的可变对象，每次变化都整份发布；
//! 单封失败只记入错误日志，不会中断循环。取消在每条记录之前与等待期间检查。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::content::ContentGenerator;
use super::mailer::{MailTransport, OutboundMail, SenderIdentity, SmtpCredentials};
use crate::config::CampaignConfig;
use crate::core::{CampaignState, StatusSink};
use crate::dataset::{Dataset, EnrichedRecord};

/// 人工编辑过的内容；index 指向合格工作集中的位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentOverride {
    pub index: usize,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct CampaignSettings {
    pub message_type: String,
    pub sender: SenderIdentity,
    pub credentials: SmtpCredentials,
    pub delay: Duration,
    pub overrides: Vec<ContentOverride>,
}

impl CampaignSettings {
    pub fn from_config(
        config: &CampaignConfig,
        sender: SenderIdentity,
        credentials: SmtpCredentials,
    ) -> Self {
        Self {
            message_type: config.message_type.clone(),
            sender,
            credentials,
            delay: config.delay(),
            overrides: Vec::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: Vec<ContentOverride>) -> Self {
        self.overrides = overrides;
        self
    }
}

fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (completed.min(total) * 100 / total) as u8
}

pub struct CampaignEngine {
    generator: ContentGenerator,
    transport: Arc<dyn MailTransport>,
}

impl CampaignEngine {
    pub fn new(generator: ContentGenerator, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            generator,
            transport,
        }
    }

    /// 运行一次活动并返回终态快照
    pub async fn run(
        &self,
        dataset: &Dataset,
        settings: &CampaignSettings,
        cancel: &CancellationToken,
        sink: &dyn StatusSink<CampaignState>,
    ) -> CampaignState {
        let mut state = CampaignState::starting();
        sink.publish(state.clone());

        let eligible = dataset.eligible();
        let total = eligible.len();
        state.total = total;
        state.message = format!("Found {} businesses with email addresses", total);
        sink.publish(state.clone());
        tracing::info!(total, query = %dataset.query, "campaign started");

        if total == 0 {
            state.running = false;
            state.message = "No businesses with email addresses found".to_string();
            sink.publish(state.clone());
            return state;
        }

        let mut stopped = false;
        for (i, record) in eligible.iter().enumerate() {
            if cancel.is_cancelled() {
                stopped = true;
                break;
            }

            state.message = format!("Processing {} ({}/{})", record.title(), i + 1, total);
            sink.publish(state.clone());

            match self.deliver(i, record, settings).await {
                Ok(()) => {
                    state.sent += 1;
                    tracing::info!(index = i + 1, total, title = %record.title(), "mail sent");
                }
                Err(reason) => {
                    state.failed += 1;
                    tracing::warn!(index = i + 1, title = %record.title(), reason = %reason, "mail failed");
                    state
                        .errors
                        .push(format!("Failed to send to {}: {}", record.title(), reason));
                }
            }
            state.progress_percent = percent(state.completed(), total);
            sink.publish(state.clone());

            let is_last = i + 1 == total;
            if !is_last && !settings.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(settings.delay) => {}
                }
            }
        }

        state.running = false;
        state.message = if stopped {
            "Campaign stopped by user".to_string()
        } else {
            format!(
                "Campaign completed! Sent: {}, Failed: {}",
                state.sent, state.failed
            )
        };
        tracing::info!(sent = state.sent, failed = state.failed, stopped, "campaign finished");
        sink.publish(state.clone());
        state
    }

    /// 覆盖内容优先，否则现场生成；返回失败原因
    async fn deliver(
        &self,
        index: usize,
        record: &EnrichedRecord,
        settings: &CampaignSettings,
    ) -> Result<(), String> {
        let (subject, body) = match settings.overrides.iter().find(|o| o.index == index) {
            Some(o) => {
                tracing::debug!(index, "using edited content");
                (o.subject.clone(), o.body.clone())
            }
            None => {
                let content = self.generator.generate(record, &settings.message_type).await;
                (content.subject, content.body)
            }
        };
        let mail = OutboundMail {
            to: record.email.trim().to_string(),
            subject,
            body,
        };
        self.transport
            .send(&mail, &settings.sender, &settings.credentials)
            .await
            .map_err(|e| e.to_string())
    }
}
