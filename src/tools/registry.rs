//! 工具注册表适配器
//!
//! 引擎只依赖 ToolRegistryAdapter 契约：列出工具 / 工作流模板及其参数 schema、按名调用、按 schema 校验参数。
//! 调用协议（MCP、HTTP 等）由具体实现负责，对引擎不透明。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// 注册表调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },

    #[error("Tool timeout: {0}")]
    Timeout(String),

    #[error("Registry error: {0}")]
    Registry(String),
}

impl ToolError {
    /// 面向 Error Handler 的错误正文（不含工具名前缀）
    pub fn message(&self) -> String {
        match self {
            ToolError::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// 工具参数 schema（JSON Schema 子集：properties + required）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// 工作流模板（prompt）描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// 校验时附带的请求上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationContext {
    pub request_id: String,
    pub user_query: String,
    pub goal: String,
}

/// 缺失参数分类：可调用其它工具获取 / 可由上下文推断 / 必须询问用户
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamCategorization {
    #[serde(default)]
    pub resolvable: Vec<String>,
    #[serde(default)]
    pub can_infer: Vec<String>,
    #[serde(default)]
    pub must_ask_user: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    #[serde(default)]
    pub missing_params: Vec<String>,
    #[serde(default)]
    pub categorization: ParamCategorization,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub provided_params: Vec<String>,
}

/// 工具注册表契约
#[async_trait]
pub trait ToolRegistryAdapter: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, ToolError>;

    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError>;

    async fn validate(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        context: &ValidationContext,
    ) -> Result<ValidationReport, ToolError>;
}
