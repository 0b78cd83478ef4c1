//! 外联内容生成：主题与正文两次独立调用，任一失败退回固定模板

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::CampaignConfig;
use crate::dataset::{is_sentinel, synthesize_background, EnrichedRecord};
use crate::llm::{CompletionOptions, LlmClient, LlmError, Message};

const SUBJECT_SYSTEM: &str = "You are a professional email marketing expert.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedContent {
    pub subject: String,
    pub body: String,
    /// 模板兜底时为 0
    pub word_count: usize,
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 预览条目：工作集序号 + 收件信息 + 生成内容
#[derive(Debug, Clone, Serialize)]
pub struct ContentPreview {
    pub index: usize,
    pub title: String,
    pub email: String,
    pub content: GeneratedContent,
}

/// 超过 `limit` 个词时截断为恰好 `limit` 个词并追加 "..."；否则原样返回
pub fn truncate_words(body: &str, limit: usize) -> String {
    let words: Vec<&str> = body.split_whitespace().collect();
    if words.len() > limit {
        format!("{}...", words[..limit].join(" "))
    } else {
        body.to_string()
    }
}

/// 去掉主题首尾的引号与空白
fn clean_subject(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string()
}

fn field(value: &str) -> &str {
    if is_sentinel(value) {
        ""
    } else {
        value.trim()
    }
}

/// 固定模板（使用名称与地址）
pub fn fallback_content(record: &EnrichedRecord, error: String) -> GeneratedContent {
    let r = &record.record;
    let name = if is_sentinel(&r.title) { "Business" } else { r.title.trim() };
    let location = if is_sentinel(&r.address) {
        String::new()
    } else {
        format!(" at {}", r.address.trim())
    };
    GeneratedContent {
        subject: format!("Partnership Opportunity for {}", name),
        body: format!(
            "Hi {name} team,\n\nI hope this email finds you well. I came across your business{location} and was impressed by your work.\n\nI believe we could create a valuable partnership that would benefit both our companies.\n\nWould you be interested in a brief call to discuss potential collaboration opportunities?\n\nBest regards,\n[Your Name]"
        ),
        word_count: 0,
        generated_at: Utc::now(),
        error: Some(error),
    }
}

pub struct ContentGenerator {
    client: Arc<dyn LlmClient>,
    config: CampaignConfig,
}

impl ContentGenerator {
    pub fn new(client: Arc<dyn LlmClient>, config: CampaignConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    /// 为单条记录生成主题与正文；失败时返回模板并附带错误
    pub async fn generate(&self, record: &EnrichedRecord, message_type: &str) -> GeneratedContent {
        match self.try_generate(record, message_type).await {
            Ok((subject, body)) => {
                let body = truncate_words(&body, self.config.word_limit);
                GeneratedContent {
                    word_count: body.split_whitespace().count(),
                    subject,
                    body,
                    generated_at: Utc::now(),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(title = %record.title(), error = %e, "content generation failed, using template");
                fallback_content(record, e.to_string())
            }
        }
    }

    async fn try_generate(
        &self,
        record: &EnrichedRecord,
        message_type: &str,
    ) -> Result<(String, String), LlmError> {
        let r = &record.record;
        let name = if is_sentinel(&r.title) { "Business" } else { r.title.trim() };
        let background = if is_sentinel(&record.background) {
            synthesize_background(r)
        } else {
            record.background.clone()
        };

        let subject_prompt = format!(
            "Generate a compelling email subject line for a {message_type} outreach to {name}.\n\
             The subject should be professional, personalized, and under 60 characters.\n\
             Return only the subject line, nothing else."
        );
        let subject = self
            .client
            .complete(
                &[Message::system(SUBJECT_SYSTEM), Message::user(subject_prompt)],
                CompletionOptions::new(self.config.subject_max_tokens, self.config.temperature),
            )
            .await?;

        let limit = self.config.word_limit;
        let context = format!(
            "Business Information:\n\
             - Name: {name}\n\
             - Address: {address}\n\
             - Website: {website}\n\
             - Phone: {phone}\n\
             - Rating: {rating}\n\
             - Background: {background}\n\n\
             Email Type: {message_type}",
            address = field(&r.address),
            website = field(&r.website),
            phone = field(&r.phone),
            rating = field(&r.rating_display),
        );
        let body_prompt = format!(
            "Write a professional {message_type} outreach email for {name}.\n\n\
             Business Context: {context}\n\n\
             Requirements:\n\
             - Personalized and relevant to their business\n\
             - Professional tone\n\
             - Include a clear call-to-action\n\
             - MAXIMUM {limit} words (strict limit)\n\
             - Use their business name naturally\n\
             - Mention their location or specific details if available\n\
             - Use the background information to personalize the content\n\
             - Keep it concise but engaging\n\n\
             Format the email with proper greeting, body, and closing."
        );
        let body_system = format!(
            "You are a professional business development expert. Always keep emails under {limit} words."
        );
        let body = self
            .client
            .complete(
                &[Message::system(body_system), Message::user(body_prompt)],
                CompletionOptions::new(self.config.body_max_tokens, self.config.temperature),
            )
            .await?;

        Ok((clean_subject(&subject), body.trim().to_string()))
    }

    /// 为前 `count` 条记录生成内容但不发送；`index` 与覆盖内容的序号一致
    pub async fn preview(
        &self,
        records: &[&EnrichedRecord],
        message_type: &str,
        count: usize,
    ) -> Vec<ContentPreview> {
        let mut out = Vec::new();
        for (index, record) in records.iter().take(count).enumerate() {
            let content = self.generate(record, message_type).await;
            out.push(ContentPreview {
                index,
                title: record.title().to_string(),
                email: record.email.clone(),
                content,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Record;
    use crate::llm::MockLlmClient;

    fn cafe() -> EnrichedRecord {
        let mut r = EnrichedRecord::pending(Record {
            title: "Blue Door Cafe".into(),
            rating_display: "4.6 (212)".into(),
            address: "12 Elm St".into(),
            website: "N/A".into(),
            phone: "555-0101".into(),
        });
        r.email = "hi@bluedoor.example".into();
        r
    }

    #[test]
    fn test_truncate_words() {
        let long: String = (0..305).map(|i| format!("w{} ", i)).collect();
        let out = truncate_words(&long, 300);
        assert!(out.ends_with("w299..."));
        assert_eq!(out.trim_end_matches("...").split_whitespace().count(), 300);

        let exact: String = (0..300).map(|i| format!("w{} ", i)).collect();
        assert_eq!(truncate_words(&exact, 300), exact);
        assert_eq!(truncate_words("short body", 300), "short body");
    }

    #[test]
    fn test_truncation_property_across_lengths() {
        for n in [0usize, 1, 4, 5, 6, 50] {
            let body: String = vec!["word"; n].join(" ");
            let out = truncate_words(&body, 5);
            if n > 5 {
                assert_eq!(out, format!("{}...", vec!["word"; 5].join(" ")));
            } else {
                assert_eq!(out, body);
            }
        }
    }

    #[tokio::test]
    async fn test_generate_trims_quotes_and_synthesizes_background() {
        let client = Arc::new(
            MockLlmClient::new()
                .reply("\"Partnering with Blue Door Cafe\"")
                .reply("  Hello Blue Door Cafe team!  "),
        );
        let gen = ContentGenerator::new(client.clone(), CampaignConfig::default());
        let out = gen.generate(&cafe(), "partnership").await;

        assert_eq!(out.subject, "Partnering with Blue Door Cafe");
        assert_eq!(out.body, "Hello Blue Door Cafe team!");
        assert_eq!(out.word_count, 5);
        assert!(out.error.is_none());

        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].options.max_tokens, 50);
        assert_eq!(calls[1].options.max_tokens, 500);
        let body_prompt = &calls[1].messages[1].content;
        assert!(body_prompt.contains("Blue Door Cafe is a professional business located at 12 Elm St"));
        assert!(body_prompt.contains("MAXIMUM 300 words"));
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_template() {
        let client = Arc::new(
            MockLlmClient::new()
                .reply("Subject ok")
                .fail(LlmError::Status {
                    status: 429,
                    body: "rate limited".into(),
                }),
        );
        let gen = ContentGenerator::new(client, CampaignConfig::default());
        let out = gen.generate(&cafe(), "partnership").await;

        assert_eq!(out.subject, "Partnership Opportunity for Blue Door Cafe");
        assert!(out.body.contains("your business at 12 Elm St"));
        assert_eq!(out.word_count, 0);
        assert_eq!(out.error.as_deref(), Some("HTTP 429: rate limited"));
    }

    #[tokio::test]
    async fn test_long_body_truncated() {
        let long: String = vec!["lorem"; 320].join(" ");
        let client = Arc::new(MockLlmClient::new().reply("Hi").reply(&long));
        let config = CampaignConfig {
            word_limit: 300,
            ..CampaignConfig::default()
        };
        let out = ContentGenerator::new(client, config)
            .generate(&cafe(), "partnership")
            .await;
        assert!(out.body.ends_with("lorem..."));
        assert_eq!(out.word_count, 300);
    }

    #[tokio::test]
    async fn test_preview_limits_count() {
        let a = cafe();
        let b = cafe();
        let gen = ContentGenerator::new(Arc::new(MockLlmClient::new()), CampaignConfig::default());
        let previews = gen.preview(&[&a, &b], "service", 1).await;
        assert_eq!(previews.len(), 1);
        assert_eq!(previews[0].index, 0);
        assert_eq!(previews[0].email, "hi@bluedoor.example");
    }
}
