//! 严格补全通道：同步请求 / 响应式的结构化补全服务
//!
//! 构建时做一次连通性探测（失败只记日志）；每条记录一次调用，结果经解码流水线映射为状态标签，
//! 失败不自动重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::decode::{decode_object, string_field, take_chars};
use super::Enricher;
use crate::config::StrictConfig;
use crate::dataset::{is_sentinel, Enrichment, EnrichmentTrack, ExtractionStatus, Record, NOT_AVAILABLE};
use crate::llm::{CompletionOptions, LlmClient, LlmError, Message};

const SYSTEM_PROMPT: &str = "You are a business research assistant. Find contact information and background details about businesses. Always respond with valid JSON format only, no additional text or explanations.";

const PROBE_PROMPT: &str = "Hello, just testing the connection. Please respond with 'OK'.";

/// 连通性探测结果
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Ok,
    Failed(String),
    Skipped,
}

pub struct StrictEnricher {
    client: Arc<dyn LlmClient>,
    options: CompletionOptions,
    delay: Duration,
    probe: ProbeResult,
}

impl StrictEnricher {
    /// 构建并（按配置）探测服务；探测失败不影响构建
    pub async fn connect(client: Arc<dyn LlmClient>, config: &StrictConfig) -> Self {
        let mut enricher = Self {
            client,
            options: CompletionOptions::new(config.max_tokens, config.temperature),
            delay: Duration::from_millis(config.delay_ms),
            probe: ProbeResult::Skipped,
        };
        if config.probe {
            enricher.probe = enricher.probe().await;
        }
        enricher
    }

    pub fn probe_result(&self) -> &ProbeResult {
        &self.probe
    }

    async fn probe(&self) -> ProbeResult {
        let messages = [Message::user(PROBE_PROMPT)];
        match self
            .client
            .complete(&messages, CompletionOptions::new(30, self.options.temperature))
            .await
        {
            Ok(_) => {
                tracing::info!("enrichment API connection successful");
                ProbeResult::Ok
            }
            Err(LlmError::Status { status, .. }) => {
                tracing::warn!(status, "enrichment API connection failed");
                ProbeResult::Failed(format!("HTTP {}", status))
            }
            Err(e) => {
                tracing::warn!(error = %e, "enrichment API connection test failed");
                ProbeResult::Failed(e.to_string())
            }
        }
    }
}

/// 自然语言提示词：名称、地址，以及非哨兵的网站 / 电话
pub fn build_prompt(record: &Record) -> String {
    let mut prompt = format!(
        "Find the contact email address and business background information for \"{}\" located at {}.",
        record.title, record.address
    );
    if !is_sentinel(&record.website) {
        prompt.push_str(&format!(" Their website is: {}.", record.website.trim()));
    }
    if !is_sentinel(&record.phone) {
        prompt.push_str(&format!(" Their phone number is: {}.", record.phone.trim()));
    }
    prompt.push_str(
        r#"

Please provide:
1. Email address (if available, otherwise "N/A")
1(a) If email address is not found on first try try one more time and search deeper.
2. Brief background about the business (what they do, specialties, etc.)

Return the information in the following JSON format only:
{
    "Email": "email@example.com or N/A",
    "Background": "Brief description of the business"
}
"#,
    );
    prompt
}

/// 将 200 响应的正文映射为补全结果
pub fn interpret_reply(content: &str) -> Enrichment {
    match decode_object(content) {
        Ok(map) => Enrichment {
            email: string_field(&map, "Email"),
            background: string_field(&map, "Background"),
            status: ExtractionStatus::Success,
            error_detail: None,
            raw_response: None,
            source: None,
        },
        Err(e) => {
            let background = if content.is_empty() {
                NOT_AVAILABLE.to_string()
            } else {
                take_chars(content, 200)
            };
            Enrichment {
                email: NOT_AVAILABLE.to_string(),
                background,
                status: ExtractionStatus::JsonError,
                error_detail: Some(e.to_string()),
                raw_response: Some(content.to_string()),
                source: None,
            }
        }
    }
}

/// 将调用错误映射为状态标签
pub fn interpret_error(error: LlmError) -> Enrichment {
    match error {
        LlmError::Status { status, body } => {
            let mut out = Enrichment::failed(
                ExtractionStatus::ApiError,
                Some(format!("HTTP {}: {}", status, body)),
            );
            out.raw_response = Some(body);
            out
        }
        LlmError::Empty => Enrichment::failed(
            ExtractionStatus::NoContent,
            Some("Response contained no message content".to_string()),
        ),
        e @ (LlmError::Timeout | LlmError::Request(_)) => {
            Enrichment::failed(ExtractionStatus::RequestError, Some(e.to_string()))
        }
    }
}

#[async_trait]
impl Enricher for StrictEnricher {
    fn track(&self) -> EnrichmentTrack {
        EnrichmentTrack::Api
    }

    async fn enrich(&self, record: &Record) -> Enrichment {
        let messages = [Message::system(SYSTEM_PROMPT), Message::user(build_prompt(record))];
        tracing::debug!(title = %record.title, "requesting enrichment");

        match self.client.complete(&messages, self.options).await {
            Ok(content) => {
                let out = interpret_reply(&content);
                if out.status == ExtractionStatus::JsonError {
                    tracing::warn!(title = %record.title, "enrichment reply was not valid JSON");
                }
                out
            }
            Err(e) => {
                tracing::warn!(title = %record.title, error = %e, "enrichment request failed");
                interpret_error(e)
            }
        }
    }

    fn record_delay(&self) -> Duration {
        self.delay
    }
}
