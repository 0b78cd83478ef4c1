//! 直连 HTTP 的 Chat Completions 客户端
//!
//! 严格补全通道需要区分「非 200 响应（保留状态码与响应体）」和「传输失败 / 超时」，
//! 所以这里直接用 reqwest 发请求，而不是经过 async_openai 的错误折叠。
//! 默认指向 Perplexity 的 sonar 模型，任何 OpenAI 兼容端点都可用。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::llm::traits::{CompletionOptions, LlmClient, LlmError, Message};

pub const PERPLEXITY_CHAT_URL: &str = "https://api.perplexity.ai/chat/completions";
pub const SONAR: &str = "sonar";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat Completions over HTTP：Bearer 鉴权，带请求超时
pub struct HttpChatClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl HttpChatClient {
    pub fn new(endpoint: &str, model: &str, api_key: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Perplexity sonar，密钥取自 `PERPLEXITY_API_KEY`
    pub fn perplexity(api_key: Option<&str>, timeout: Duration) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("PERPLEXITY_API_KEY").ok())
            .unwrap_or_default();
        Self::new(PERPLEXITY_CHAT_URL, SONAR, &api_key, timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LlmClient for HttpChatClient {
    async fn complete(
        &self,
        messages: &[Message],
        options: CompletionOptions,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Request(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.as_u16() != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Request(format!("Read body: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::Empty)
    }
}
