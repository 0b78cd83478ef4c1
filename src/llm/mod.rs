//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 直连 HTTP / Mock）

pub mod http;
pub mod mock;
pub mod openai;
pub mod traits;

pub use http::{HttpChatClient, PERPLEXITY_CHAT_URL, SONAR};
pub use mock::{MockLlmClient, RecordedCall};
pub use openai::OpenAiClient;
pub use traits::{CompletionOptions, LlmClient, LlmError, Message, Role};
