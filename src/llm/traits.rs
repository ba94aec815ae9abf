//! LLM 客户端抽象
//!
//! Reasoning Oracle 的传输层：所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::complete，
//! 接收 system + user 消息与采样参数，返回原始文本（期望内含一个 JSON 对象）。

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::Message;

/// LLM 传输层错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM unavailable: {0}")]
    Unavailable(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

/// 单次完成请求：消息 + 温度 + 最大 token + 是否要求 JSON 输出
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub json_response: bool,
}

impl CompletionRequest {
    /// system + user 两段式请求，默认要求 JSON 输出
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system), Message::user(user)],
            temperature: 0.1,
            max_tokens: 1000,
            json_response: true,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// 首条 system 消息内容（Mock 按此路由）
    pub fn system_prompt(&self) -> &str {
        self.messages
            .iter()
            .find(|m| matches!(m.role, crate::llm::Role::System))
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    /// 最后一条 user 消息内容
    pub fn user_prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::llm::Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
