//! Error Handler：工具调用失败后的恢复决策
//!
//! 向 Oracle 提供：动作声明的必填参数 vs 实际使用的参数、执行历史（成功 / 失败计数）、前序结果预览，
//! 解码为封闭的 ErrorDecision。Oracle 不可用或回复不合法时一律回落为 ask-user。

use std::collections::BTreeMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{EngineError, ErrorType};
use crate::engine::{ExecutionState, Step};
use crate::oracle::{preview, ReasoningOracle, Validate};
use crate::tools::{lookup_schema, ToolRegistryAdapter};

const ERROR_HANDLER_SYSTEM: &str = "You are an error recovery advisor for a tool-executing agent. \
A tool call failed. Decide ONE recovery: \"retry\" for transient failures, \"adapt\" to switch to a \
different available tool (give adaptedAction and adaptedParameters), \"ask-user\" when information only \
the user can provide is missing, or \"skip\" when the step is not essential to the goal.";

/// 前序结果预览条数
const PREVIEW_RESULTS: usize = 3;

/// adapt 决策携带的替代动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Adaptation {
    pub adapted_action: String,
    #[serde(default)]
    pub adapted_parameters: BTreeMap<String, Value>,
}

/// 恢复决策（封闭集合，穷尽匹配）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum ErrorDecision {
    Retry {
        #[serde(default)]
        reason: String,
        #[serde(default, rename = "maxRetries")]
        max_retries: Option<u32>,
    },
    Adapt {
        #[serde(default)]
        reason: String,
        adaptation: Adaptation,
    },
    #[serde(alias = "ask_user")]
    AskUser {
        #[serde(default)]
        reason: String,
    },
    Skip {
        #[serde(default)]
        reason: String,
    },
}

impl ErrorDecision {
    pub fn reason(&self) -> &str {
        match self {
            ErrorDecision::Retry { reason, .. }
            | ErrorDecision::Adapt { reason, .. }
            | ErrorDecision::AskUser { reason }
            | ErrorDecision::Skip { reason } => reason,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorDecision::Retry { .. } => "retry",
            ErrorDecision::Adapt { .. } => "adapt",
            ErrorDecision::AskUser { .. } => "ask-user",
            ErrorDecision::Skip { .. } => "skip",
        }
    }
}

impl Validate for ErrorDecision {
    fn validate(&self) -> Result<(), String> {
        match self {
            ErrorDecision::Adapt { adaptation, .. } if adaptation.adapted_action.trim().is_empty() => {
                Err("adapt decision without adaptedAction".to_string())
            }
            ErrorDecision::Retry {
                max_retries: Some(0),
                ..
            } => Err("maxRetries must be positive".to_string()),
            _ => Ok(()),
        }
    }
}

pub struct ErrorHandler {
    oracle: ReasoningOracle,
    registry: Arc<dyn ToolRegistryAdapter>,
}

impl ErrorHandler {
    pub fn new(oracle: ReasoningOracle, registry: Arc<dyn ToolRegistryAdapter>) -> Self {
        Self { oracle, registry }
    }

    /// 给出恢复决策；注册表查询失败向上返回（由执行器按 tool-error 终止），Oracle 失败回落 ask-user
    pub async fn handle_error(
        &self,
        error_message: &str,
        error_type: ErrorType,
        step: &Step,
        parameters_used: &Map<String, Value>,
        state: &ExecutionState,
        attempts: u32,
    ) -> Result<ErrorDecision, EngineError> {
        let schema = lookup_schema(self.registry.as_ref(), &step.action).await?;
        let available = self.registry.list_tools().await?;

        let required = schema
            .as_ref()
            .map(|s| s.required.join(", "))
            .unwrap_or_else(|| "unknown".to_string());
        let used: Vec<&String> = parameters_used.keys().collect();
        let limit = self.oracle.preview_chars();
        let recent: Vec<String> = state
            .partial_results
            .iter()
            .rev()
            .take(PREVIEW_RESULTS)
            .map(|p| {
                format!(
                    "- step {} ({}): {}",
                    p.step_order,
                    p.action,
                    preview(&p.output.to_string(), limit)
                )
            })
            .collect();
        let tools: Vec<&str> = available.iter().map(|t| t.name.as_str()).collect();

        let user = format!(
            "Goal: {}\nUser query: {}\n\nFailed step {} ({}): {}\nError ({}): {}\nAttempts so far: {}\n\n\
Required parameters: {}\nParameters used: {}\nValues used: {}\n\n\
History: {} completed, {} failed\nRecent results:\n{}\n\nAvailable tools: {}",
            state.plan.goal,
            state.request.user_query,
            step.order,
            step.action,
            step.description,
            error_type,
            error_message,
            attempts,
            required,
            used.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
            Value::Object(parameters_used.clone()),
            state.completed_count(),
            state.failed_count(),
            if recent.is_empty() {
                "(none)".to_string()
            } else {
                recent.join("\n")
            },
            tools.join(", "),
        );

        match self
            .oracle
            .decide::<ErrorDecision>(ERROR_HANDLER_SYSTEM, &user)
            .await
        {
            Ok(decision) => {
                tracing::info!(
                    step = %step.id,
                    decision = decision.label(),
                    reason = decision.reason(),
                    "error recovery decided"
                );
                Ok(decision)
            }
            Err(e) => {
                tracing::warn!("Error handler oracle failed for step {}: {}", step.id, e);
                Ok(ErrorDecision::AskUser {
                    reason: format!("recovery advice unavailable ({e}); user input required"),
                })
            }
        }
    }
}
