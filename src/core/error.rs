//! 引擎错误类型与步骤失败分类
//!
//! EngineError 覆盖各边界（LLM、Oracle 解码、工具注册表、配置）；
//! ErrorType 是写入 ExecutionResult 的机器可读失败类别。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;
use crate::oracle::OracleError;
use crate::tools::ToolError;

/// 引擎运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum EngineError {
    /// 参数无法从前序结果中提取，或仍残留占位符
    #[error("Coordination failed: {0}")]
    Coordination(String),

    /// 必填参数缺失或格式不合法
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Config error: {0}")]
    Config(String),
}

impl EngineError {
    /// 映射为步骤失败类别；Oracle / LLM 错误不单独暴露，归入工具错误
    pub fn error_type(&self) -> ErrorType {
        match self {
            EngineError::Coordination(_) => ErrorType::CoordinationError,
            EngineError::Validation(_) | EngineError::Config(_) => ErrorType::ValidationError,
            EngineError::Tool(_) | EngineError::Oracle(_) | EngineError::Llm(_) => {
                ErrorType::ToolError
            }
        }
    }
}

/// 步骤失败类别（序列化为 kebab-case，如 "coordination-error"）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorType {
    CoordinationError,
    ValidationError,
    ToolError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::CoordinationError => "coordination-error",
            ErrorType::ValidationError => "validation-error",
            ErrorType::ToolError => "tool-error",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
