//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置的回复或错误；预置用完后回显最后一条 User 消息。
//! 每次调用的消息与参数都会记录下来，便于断言提示词内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::traits::{CompletionOptions, LlmClient, LlmError, Message, Role};

/// 一次调用的记录
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub options: CompletionOptions,
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, LlmError>>,
    {
        Self {
            scripted: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条成功回复
    pub fn reply(self, text: &str) -> Self {
        if let Ok(mut q) = self.scripted.lock() {
            q.push_back(Ok(text.to_string()));
        }
        self
    }

    /// 追加一条错误
    pub fn fail(self, error: LlmError) -> Self {
        if let Ok(mut q) = self.scripted.lock() {
            q.push_back(Err(error));
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        options: CompletionOptions,
    ) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                messages: messages.to_vec(),
                options,
            });
        }

        let next = self.scripted.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(next) = next {
            return next;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_then_echo() {
        let client = MockLlmClient::new()
            .reply("first")
            .fail(LlmError::Timeout);
        let opts = CompletionOptions::new(10, 0.0);
        let msgs = [Message::user("hello")];

        assert_eq!(client.complete(&msgs, opts).await.unwrap(), "first");
        assert_eq!(client.complete(&msgs, opts).await.unwrap_err(), LlmError::Timeout);
        assert_eq!(
            client.complete(&msgs, opts).await.unwrap(),
            "Echo from Mock: hello"
        );
        assert_eq!(client.calls().len(), 3);
        assert_eq!(client.calls()[0].options.max_tokens, 10);
    }
}
