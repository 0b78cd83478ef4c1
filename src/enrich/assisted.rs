//! AI 辅助补全通道：驱动一个对话式网页完成每条记录的查询
//!
//! 整批记录只导航一次；每条记录走一遍状态机：
//! Idle → PromptComposed → Submitted → AwaitingResponse → ResponseExtracted → Parsed → Done，
//! 任一阶段都可能以 Failed(status) 结束，且不影响后续记录。
//!
//! 回复到达的判定沿用「消息类元素数量达到阈值」的启发式，对页面结构变化敏感。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::decode::{
    find_email, locate_object, page_json_candidate, parse_object, string_field, strip_fences,
    trim_background, DecodeError,
};
use super::Enricher;
use crate::browser::{Action, AutomationSession, ElementRef};
use crate::config::AssistedConfig;
use crate::dataset::{Enrichment, EnrichmentTrack, ExtractionStatus, Record, NOT_AVAILABLE};

const SOURCE_DEFAULT: &str = "Copilot search";
const SOURCE_REGEX: &str = "Copilot search (regex extracted)";

/// 单条记录的处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PromptComposed,
    Submitted,
    AwaitingResponse,
    ResponseExtracted,
    Parsed,
    Done,
}

/// 提示词：列出已知字段与期望的 JSON 结构
pub fn build_prompt(record: &Record) -> String {
    format!(
        r#"Please help me find contact email addresses for this business using web search.

**Business Details:**
- Name: {title}
- Address: {address}
- Website: {website}
- Phone: {phone}

**Task:**
Search the web for this business and find their email addresses. Look on their website, business directories, social media profiles, and other online sources.

**Response Format:**
Please respond with ONLY this exact JSON format:

{{
    "business_name": "{title}",
    "email": "found-email@example.com",
    "background": "Brief description of what this business does",
    "search_status": "success",
    "source": "where you found the email"
}}

If no email is found, use "N/A" for email and set search_status to "failed".

Start your web search now."#,
        title = record.title,
        address = record.address,
        website = record.website,
        phone = record.phone,
    )
}

/// 解析对话回复：JSON 优先，失败时正则兜底
pub fn parse_reply(content: &str) -> Enrichment {
    let cleaned = strip_fences(content);
    match parse_object(locate_object(&cleaned)) {
        Ok(map) => {
            let searched = map
                .get("search_status")
                .and_then(|v| v.as_str())
                .map(|s| s == "success")
                .unwrap_or(false);
            let source = map
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or(SOURCE_DEFAULT)
                .to_string();
            Enrichment {
                email: string_field(&map, "email"),
                background: string_field(&map, "background"),
                status: if searched {
                    ExtractionStatus::Success
                } else {
                    ExtractionStatus::Failed
                },
                error_detail: None,
                raw_response: Some(content.to_string()),
                source: Some(source),
            }
        }
        Err(DecodeError::NotObject) => {
            let mut out = Enrichment::failed(
                ExtractionStatus::ParseError,
                Some(DecodeError::NotObject.to_string()),
            )
            .with_source("Error");
            out.raw_response = Some(content.to_string());
            out
        }
        Err(DecodeError::Json(_)) => {
            let email = find_email(content);
            Enrichment {
                status: if email.is_some() {
                    ExtractionStatus::Success
                } else {
                    ExtractionStatus::Failed
                },
                email: email.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
                background: trim_background(content),
                error_detail: None,
                raw_response: Some(content.to_string()),
                source: Some(SOURCE_REGEX.to_string()),
            }
        }
    }
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// 对话式页面补全器；与抓取共用同一个自动化会话
pub struct AssistedEnricher {
    session: Arc<dyn AutomationSession>,
    config: AssistedConfig,
}

impl AssistedEnricher {
    pub fn new(session: Arc<dyn AutomationSession>, config: AssistedConfig) -> Self {
        Self { session, config }
    }

    fn enter(&self, record: &Record, phase: Phase) {
        tracing::debug!(title = %record.title, phase = ?phase, "assisted enrichment phase");
    }

    async fn input_prompt(&self, prompt: &str) -> Result<ElementRef, String> {
        let session = self.session.as_ref();
        let (input, locator) = self
            .config
            .input_locators
            .first_interactable(session)
            .await
            .ok_or_else(|| "Chat input not found".to_string())?;
        tracing::debug!(locator = %locator, "found chat input");

        if let Err(e) = session.interact(&input, Action::Clear).await {
            tracing::debug!(error = %e, "clearing chat input failed");
        }
        pause(self.config.clear_pause_ms).await;
        session
            .interact(&input, Action::Type(prompt.to_string()))
            .await
            .map_err(|e| format!("Failed to input prompt: {}", e))?;
        pause(self.config.type_settle_ms).await;
        Ok(input)
    }

    /// 依次尝试：发送按钮（脚本点击优先，其次指针点击）→ 输入框回车 → 固定位置按钮
    async fn submit(&self, input: &ElementRef) -> Option<&'static str> {
        let session = self.session.as_ref();

        for locator in self.config.submit_locators.locators() {
            let Ok(found) = session.find_all(locator).await else {
                continue;
            };
            let mut button = None;
            for candidate in found {
                if session.is_interactable(&candidate).await.unwrap_or(false) {
                    button = Some(candidate);
                    break;
                }
            }
            let Some(button) = button else {
                continue;
            };

            let _ = session.interact(&button, Action::ScrollIntoView).await;
            pause(self.config.submit_scroll_pause_ms).await;
            if session.interact(&button, Action::ScriptClick).await.is_ok() {
                pause(self.config.submit_settle_ms).await;
                return Some("script click");
            }
            if session.interact(&button, Action::Click).await.is_ok() {
                pause(self.config.submit_settle_ms).await;
                return Some("pointer click");
            }
            tracing::debug!(locator = %locator, "send button did not accept clicks");
        }

        if session.interact(input, Action::Focus).await.is_ok() {
            pause(self.config.enter_focus_pause_ms).await;
            if session.interact(input, Action::PressEnter).await.is_ok() {
                pause(self.config.submit_settle_ms).await;
                return Some("enter key");
            }
        }

        let fallback = session
            .wait_for(
                &self.config.fallback_submit,
                Duration::from_millis(self.config.fallback_wait_ms),
            )
            .await
            .ok()
            .flatten();
        if let Some(button) = fallback {
            if session.interact(&button, Action::ScriptClick).await.is_ok() {
                pause(self.config.submit_settle_ms).await;
                return Some("fixed-position button");
            }
        }
        None
    }

    /// 轮询直到消息类元素数量达到阈值；超时返回 false
    async fn await_response(&self) -> bool {
        let session = self.session.as_ref();
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.response_timeout_ms);
        loop {
            if self
                .config
                .message_locators
                .any_reaches(session, self.config.min_messages)
                .await
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms.max(1))).await;
        }
    }

    /// 最新消息文本；没有时在整页文本中找 JSON 片段
    async fn extract_response(&self) -> Option<String> {
        let session = self.session.as_ref();
        if let Some((text, locator)) = self.config.content_locators.first_text(session).await {
            tracing::debug!(locator = %locator, chars = text.len(), "found response content");
            return Some(text);
        }

        let page = match session.page_text().await {
            Ok(text) => text,
            Err(_) => {
                let html = session.page_source().await.ok()?;
                html2text::from_read(html.as_bytes(), 120).ok()?
            }
        };
        page_json_candidate(&page)
    }

    async fn process(&self, record: &Record) -> Enrichment {
        self.enter(record, Phase::Idle);
        let prompt = build_prompt(record);
        self.enter(record, Phase::PromptComposed);

        let input = match self.input_prompt(&prompt).await {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(title = %record.title, error = %e, "could not enter prompt");
                return Enrichment::failed(ExtractionStatus::Failed, Some(e)).with_source("Error");
            }
        };

        match self.submit(&input).await {
            Some(method) => tracing::debug!(method, "message sent"),
            None => {
                tracing::warn!(title = %record.title, "could not send message");
                return Enrichment::failed(
                    ExtractionStatus::Failed,
                    Some("Failed to send message".to_string()),
                )
                .with_source("Error");
            }
        }
        self.enter(record, Phase::Submitted);

        self.enter(record, Phase::AwaitingResponse);
        if !self.await_response().await {
            tracing::warn!(
                title = %record.title,
                timeout_ms = self.config.response_timeout_ms,
                "no response within timeout"
            );
            return Enrichment::failed(
                ExtractionStatus::Timeout,
                Some(format!(
                    "No response within {}s",
                    self.config.response_timeout_ms / 1000
                )),
            )
            .with_source("Timeout");
        }

        let Some(content) = self.extract_response().await else {
            tracing::warn!(title = %record.title, "could not extract response content");
            return Enrichment::failed(ExtractionStatus::NoContent, None).with_source("No content");
        };
        self.enter(record, Phase::ResponseExtracted);

        let parsed = parse_reply(&content);
        self.enter(record, Phase::Parsed);
        self.enter(record, Phase::Done);
        parsed
    }
}

#[async_trait]
impl Enricher for AssistedEnricher {
    fn track(&self) -> EnrichmentTrack {
        EnrichmentTrack::Free
    }

    async fn prepare(&self) -> Result<(), String> {
        tracing::info!(url = %self.config.surface_url, "navigating to chat surface");
        self.session
            .navigate(&self.config.surface_url)
            .await
            .map_err(|e| format!("Navigation failed: {}", e))?;
        pause(self.config.settle_ms).await;
        Ok(())
    }

    async fn enrich(&self, record: &Record) -> Enrichment {
        self.process(record).await
    }

    fn record_delay(&self) -> Duration {
        Duration::from_millis(self.config.record_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{Effect, FakeElement, Locator, ScriptedSession};
    use crate::enrich::run_batch;
    use tokio_util::sync::CancellationToken;

    const MESSAGES: &str = r#"[data-testid="chat-message"]"#;

    fn joes() -> Record {
        Record {
            title: "Joe's Cafe".into(),
            address: "1 Main St".into(),
            ..Record::default()
        }
    }

    fn config() -> AssistedConfig {
        AssistedConfig {
            response_timeout_ms: 50,
            ..AssistedConfig::default()
        }
        .without_pauses()
    }

    fn chat_page(replies: &[&str]) -> ScriptedSession {
        ScriptedSession::new()
            .with_element("#userInput", FakeElement::new(""))
            .with_element(
                "button.rounded-submitButton",
                FakeElement::new("").on_activate(Effect::Reply {
                    locator: Locator::css(MESSAGES),
                }),
            )
            .with_replies(replies.iter().copied())
    }

    #[tokio::test]
    async fn test_json_reply_success() {
        let reply = r#"```json
{"business_name": "Joe's Cafe", "email": "joe@cafe.com", "background": "Neighborhood coffee", "search_status": "success", "source": "website"}
```"#;
        let session = Arc::new(chat_page(&[reply]));
        let agent = AssistedEnricher::new(session.clone(), config());

        let out = agent.enrich(&joes()).await;
        assert_eq!(out.status, ExtractionStatus::Success);
        assert_eq!(out.email, "joe@cafe.com");
        assert_eq!(out.background, "Neighborhood coffee");
        assert_eq!(out.source.as_deref(), Some("website"));
        assert!(session.last_typed().contains("- Name: Joe's Cafe"));
        assert!(session
            .actions()
            .iter()
            .any(|a| a.starts_with("script_click")));
    }

    #[tokio::test]
    async fn test_poll_timeout_yields_timeout_status() {
        // 发送按钮可用，但从未出现回复
        let session = Arc::new(chat_page(&[]));
        let agent = AssistedEnricher::new(session, config());

        let out = agent.enrich(&joes()).await;
        assert_eq!(out.status, ExtractionStatus::Timeout);
        assert_eq!(out.email, "N/A");
        assert_eq!(out.source.as_deref(), Some("Timeout"));
    }

    #[tokio::test]
    async fn test_failed_search_status() {
        let reply = r#"{"business_name": "Joe's Cafe", "email": "N/A", "background": "Cafe", "search_status": "failed"}"#;
        let agent = AssistedEnricher::new(Arc::new(chat_page(&[reply])), config());
        let out = agent.enrich(&joes()).await;
        assert_eq!(out.status, ExtractionStatus::Failed);
        assert_eq!(out.email, "N/A");
        assert_eq!(out.source.as_deref(), Some("Copilot search"));
    }

    #[tokio::test]
    async fn test_narrative_reply_uses_regex_fallback() {
        let reply = "I found the following contact details for Joe's Cafe after searching their website and several local directories: you can reach them at hello@joescafe.com for catering and events.";
        let agent = AssistedEnricher::new(Arc::new(chat_page(&[reply])), config());
        let out = agent.enrich(&joes()).await;
        assert_eq!(out.status, ExtractionStatus::Success);
        assert_eq!(out.email, "hello@joescafe.com");
        assert_eq!(out.source.as_deref(), Some(SOURCE_REGEX));
        assert!(!out.background.starts_with("I found"));
    }

    #[test]
    fn test_parse_reply_edge_cases() {
        // 合法 JSON 但不是对象
        let out = parse_reply("[1, 2, 3]");
        assert_eq!(out.status, ExtractionStatus::ParseError);
        // 花括号区间不是合法 JSON，正则也找不到邮箱
        let out = parse_reply("{\"a\": 1} trailing } [\"x\"]");
        assert_eq!(out.status, ExtractionStatus::Failed);
        assert_eq!(out.source.as_deref(), Some(SOURCE_REGEX));
        // 没有 search_status
        let out = parse_reply("{ \"list\": [1] }");
        assert_eq!(out.status, ExtractionStatus::Failed);
        assert_eq!(out.source.as_deref(), Some(SOURCE_DEFAULT));
    }

    #[tokio::test]
    async fn test_enter_key_fallback_when_no_button() {
        let reply = r#"{"email": "joe@cafe.com", "search_status": "success"}"#;
        let session = Arc::new(
            ScriptedSession::new()
                .with_element(
                    "textarea#userInput",
                    FakeElement::new("").on_activate(Effect::Reply {
                        locator: Locator::css(MESSAGES),
                    }),
                )
                .with_replies([reply]),
        );
        let agent = AssistedEnricher::new(session.clone(), config());
        let out = agent.enrich(&joes()).await;
        assert_eq!(out.status, ExtractionStatus::Success);
        assert!(session.actions().iter().any(|a| a.starts_with("enter")));
    }

    #[tokio::test]
    async fn test_page_text_fallback() {
        // 最新消息定位不到，但整页文本里有 JSON 片段
        let cfg = AssistedConfig {
            content_locators: crate::browser::LocatorChain::from_strs(&[".nowhere"]),
            ..config()
        };
        let session = Arc::new(
            chat_page(&["(rendered elsewhere)"]).with_body_text(
                r#"Copilot says {"business_name": "Joe's Cafe", "email": "joe@cafe.com", "search_status": "success"}"#,
            ),
        );
        let out = AssistedEnricher::new(session, cfg).enrich(&joes()).await;
        assert_eq!(out.email, "joe@cafe.com");
        assert_eq!(out.status, ExtractionStatus::Success);
    }

    #[tokio::test]
    async fn test_missing_input_fails_record() {
        let session = Arc::new(ScriptedSession::new());
        let out = AssistedEnricher::new(session, config()).enrich(&joes()).await;
        assert_eq!(out.status, ExtractionStatus::Failed);
        assert_eq!(out.error_detail.as_deref(), Some("Chat input not found"));
    }

    #[tokio::test]
    async fn test_batch_navigates_once() {
        let ok = r#"{"email": "a@a.com", "search_status": "success"}"#;
        let session = Arc::new(chat_page(&[ok, ok]));
        let agent = AssistedEnricher::new(session.clone(), config());
        let out = run_batch(
            &agent,
            vec![joes(), joes()],
            &CancellationToken::new(),
            &mut |_, _| {},
        )
        .await;

        assert_eq!(session.visited(), vec!["https://copilot.microsoft.com".to_string()]);
        assert_eq!(out.successful, 2);
        assert_eq!(out.records[0].extraction_method, Some(EnrichmentTrack::Free));
    }
}
