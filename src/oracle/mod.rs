//! Reasoning Oracle：LLM 决策服务的强类型边界
//!
//! 各组件以 system + user prompt 调用 `decide::<T>()`，得到已解码、已校验的决策对象；
//! 传输失败为 OracleError::Unavailable，结构不合法为 OracleError::Decode，由调用方走各自的兜底。

pub mod decode;
pub mod schema;

use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::OracleSection;
use crate::llm::{CompletionRequest, LlmClient, LlmError};

pub use decode::{decode, extract_json_object, OracleDecodeError, Validate};
pub use schema::response_schema_json;

/// Oracle 调用失败
#[derive(Error, Debug, Clone)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(#[from] LlmError),

    #[error(transparent)]
    Decode(#[from] OracleDecodeError),
}

/// Oracle 客户端：持有 LLM 与采样参数
#[derive(Clone)]
pub struct ReasoningOracle {
    llm: Arc<dyn LlmClient>,
    temperature: f32,
    max_tokens: u32,
    preview_chars: usize,
}

impl ReasoningOracle {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::from_config(llm, &OracleSection::default())
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, config: &OracleSection) -> Self {
        Self {
            llm,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            preview_chars: config.preview_chars,
        }
    }

    /// 前序结果写入 prompt 时的最大字符数
    pub fn preview_chars(&self) -> usize {
        self.preview_chars
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 发送请求并解码为 T；system prompt 末尾自动附上 T 的 JSON Schema
    pub async fn decide<T>(&self, system: &str, user: &str) -> Result<T, OracleError>
    where
        T: DeserializeOwned + JsonSchema + Validate,
    {
        let system = format!(
            "{}\n\nRespond with ONLY one JSON object matching this schema:\n{}",
            system,
            response_schema_json::<T>()
        );
        tracing::debug!(
            system_chars = system.len(),
            user_chars = user.len(),
            "oracle request"
        );
        let request = CompletionRequest::new(system, user)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        let raw = self.llm.complete(&request).await?;
        Ok(decode::<T>(&raw)?)
    }
}

/// 截断到 max 个字符，超出时追加 "..."
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}
