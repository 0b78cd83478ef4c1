//! 内容生成用的 OpenAI 兼容客户端
//!
//! base_url 可指向任意兼容端点（DeepSeek、本地网关等）。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::traits::{CompletionOptions, LlmClient, LlmError, Message, Role};

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    /// 没有密钥时照常构建；请求被服务端拒绝后由调用方走模板兜底
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key.unwrap_or_default());
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn to_request_message(m: &Message) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let content = m.content.clone();
    Ok(match m.role {
        Role::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()?,
        ),
        Role::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?,
        ),
        Role::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(content)
                .build()?,
        ),
    })
}

/// async_openai 不暴露状态码，只能按错误文本区分超时
fn map_error(e: OpenAIError) -> LlmError {
    let message = e.to_string();
    if message.to_lowercase().contains("timed out") {
        LlmError::Timeout
    } else {
        LlmError::Request(message)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        options: CompletionOptions,
    ) -> Result<String, LlmError> {
        let converted = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_error)?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(converted)
            .max_completion_tokens(options.max_tokens)
            .temperature(options.temperature)
            .build()
            .map_err(map_error)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_error)?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "completion usage"
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::Empty)
    }
}
