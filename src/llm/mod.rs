//! LLM 层：Reasoning Oracle 的传输客户端（OpenAI 兼容 / DeepSeek / Mock）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use message::{Message, Role};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage, DEEPSEEK_BASE_URL};
pub use traits::{CompletionRequest, LlmClient, LlmError};

use crate::config::LlmSection;

/// 按 [llm] 配置创建客户端：deepseek / openai / mock
pub fn create_client_from_config(llm: &LlmSection) -> Arc<dyn LlmClient> {
    match llm.provider.as_str() {
        "mock" => Arc::new(MockLlmClient),
        "openai" => Arc::new(
            OpenAiClient::new(llm.base_url.as_deref(), &llm.model, None)
                .with_timeout_secs(llm.timeouts.request),
        ),
        _ => {
            let client = match &llm.base_url {
                Some(url) => OpenAiClient::new(Some(url), &llm.model, None),
                None => OpenAiClient::deepseek(&llm.model),
            };
            Arc::new(client.with_timeout_secs(llm.timeouts.request))
        }
    }
}
