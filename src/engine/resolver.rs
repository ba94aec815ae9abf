//! 参数校验与补全
//!
//! 协调之后按注册表的 validate 入口检查参数；缺失的必填参数分三类处理：
//! resolvable 由 Oracle 选择另一个注册表工具去查询，can_infer 由 Oracle 根据上下文推断，
//! must_ask_user 无安全默认值。补全后只重新校验一次。

use std::collections::BTreeMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::engine::guards::{first_item, ParameterGuard};
use crate::engine::ExecutionState;
use crate::oracle::{preview, ReasoningOracle, Validate};
use crate::tools::{ToolExecutor, ValidationContext, ValidationReport};

const RESOLVER_SYSTEM: &str = "You are a parameter resolver. A tool call is missing a required \
identifier. Choose ONE available lookup tool whose output contains that identifier, the arguments \
to call it with (using only values from the context), and the result field that holds the identifier.";

const INFER_SYSTEM: &str = "You are a parameter inference assistant. Infer sensible values for the \
listed parameters from the goal and user query (for example a current timestamp or a default page size). \
Return only parameters you can infer with confidence.";

/// Oracle 给出的解析方案：调用哪个工具、用什么参数、取哪个字段
#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct ResolutionPlan {
    tool: String,
    #[serde(default)]
    arguments: Map<String, Value>,
    /// 结果首项中承载取值的字段名
    field: String,
}

impl Validate for ResolutionPlan {
    fn validate(&self) -> Result<(), String> {
        if self.tool.trim().is_empty() || self.field.trim().is_empty() {
            return Err("tool and field must be non-empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct InferredValues {
    #[serde(default)]
    values: BTreeMap<String, Value>,
    #[serde(default)]
    reasoning: String,
}

impl Validate for InferredValues {}

/// 校验失败：仍缺失的参数，以及其中必须询问用户的部分
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub message: String,
    pub missing: Vec<String>,
    pub must_ask_user: Vec<String>,
}

pub struct ParameterResolver {
    oracle: ReasoningOracle,
    tools: Arc<ToolExecutor>,
    guard: Arc<ParameterGuard>,
}

impl ParameterResolver {
    pub fn new(oracle: ReasoningOracle, tools: Arc<ToolExecutor>, guard: Arc<ParameterGuard>) -> Self {
        Self {
            oracle,
            tools,
            guard,
        }
    }

    /// 校验并补全参数；成功返回（可能已补全的）参数集
    pub async fn resolve(
        &self,
        action: &str,
        params: &Map<String, Value>,
        state: &ExecutionState,
    ) -> Result<Map<String, Value>, ValidationFailure> {
        let context = ValidationContext {
            request_id: state.request.id.clone(),
            user_query: state.request.user_query.clone(),
            goal: state.plan.goal.clone(),
        };

        let report = self.validate(action, params, &context).await?;
        if report.is_valid {
            return Ok(params.clone());
        }

        tracing::info!(
            action = action,
            missing = ?report.missing_params,
            "resolving missing parameters"
        );

        let mut params = params.clone();
        for name in &report.categorization.resolvable {
            if let Some(value) = self.resolve_via_tool(action, name, state).await {
                params.insert(name.clone(), value);
            }
        }
        if !report.categorization.can_infer.is_empty() {
            let inferred = self
                .infer(action, &report.categorization.can_infer, state)
                .await;
            for (name, value) in inferred {
                params.insert(name, value);
            }
        }

        let second = self.validate(action, &params, &context).await?;
        if second.is_valid {
            return Ok(params);
        }
        Err(ValidationFailure {
            message: format!(
                "missing required parameters for {}: {}",
                action,
                second.missing_params.join(", ")
            ),
            must_ask_user: second.categorization.must_ask_user.clone(),
            missing: second.missing_params,
        })
    }

    async fn validate(
        &self,
        action: &str,
        params: &Map<String, Value>,
        context: &ValidationContext,
    ) -> Result<ValidationReport, ValidationFailure> {
        self.tools
            .registry()
            .validate(action, params, context)
            .await
            .map_err(|e| ValidationFailure {
                message: format!("cannot validate parameters for {action}: {e}"),
                missing: Vec::new(),
                must_ask_user: Vec::new(),
            })
    }

    /// 由 Oracle 选择查询工具并调用；取值须通过守卫
    async fn resolve_via_tool(&self, action: &str, name: &str, state: &ExecutionState) -> Option<Value> {
        let tools = match self.tools.registry().list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!("Cannot list tools to resolve {}: {}", name, e);
                return None;
            }
        };
        let catalog: Vec<String> = tools
            .iter()
            .filter(|t| t.name != action)
            .map(|t| {
                format!(
                    "- {}: {} (required: {})",
                    t.name,
                    t.description,
                    t.input_schema.required.join(", ")
                )
            })
            .collect();
        if catalog.is_empty() {
            return None;
        }

        let user = format!(
            "Goal: {}\nUser query: {}\nTool needing the value: {}\nMissing parameter: {}\n\nAvailable lookup tools:\n{}",
            state.plan.goal,
            state.request.user_query,
            action,
            name,
            catalog.join("\n")
        );
        let plan = match self.oracle.decide::<ResolutionPlan>(RESOLVER_SYSTEM, &user).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("Resolver oracle failed for {}: {}", name, e);
                return None;
            }
        };
        let lookup = match tools.iter().find(|t| t.name == plan.tool) {
            Some(tool) if tool.name != action => tool,
            _ => {
                tracing::warn!("Resolver proposed unusable tool {}", plan.tool);
                return None;
            }
        };

        // 查询调用同样不得携带占位符、"null" 或未声明参数
        let arguments: Map<String, Value> = plan
            .arguments
            .into_iter()
            .filter(|(k, _)| {
                let declared = lookup.input_schema.properties.contains_key(k)
                    || lookup.input_schema.required.contains(k);
                if !declared {
                    tracing::warn!("Dropping undeclared lookup argument '{}' for {}", k, plan.tool);
                }
                declared
            })
            .collect();
        if let Err(e) = self.guard.check_invocation(&arguments) {
            tracing::warn!("Lookup via {} rejected before invocation: {}", plan.tool, e);
            return None;
        }

        let output = match self.tools.invoke(&plan.tool, Value::Object(arguments)).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("Lookup via {} failed: {}", plan.tool, e);
                return None;
            }
        };
        let item = first_item(&output).unwrap_or(&output);
        let value = item.get(&plan.field)?;
        if self.guard.admits(name, value) {
            tracing::info!(
                "Resolved {} via {}: {}",
                name,
                plan.tool,
                preview(&value.to_string(), 80)
            );
            Some(value.clone())
        } else {
            tracing::warn!("Resolved value for {} rejected by guard: {}", name, value);
            None
        }
    }

    /// Oracle 推断；失败时退回 schema 中声明的 default
    async fn infer(&self, action: &str, names: &[String], state: &ExecutionState) -> Map<String, Value> {
        let user = format!(
            "Goal: {}\nUser query: {}\nTool: {}\nParameters to infer: {}\nCurrent time (ms): {}",
            state.plan.goal,
            state.request.user_query,
            action,
            names.join(", "),
            chrono::Utc::now().timestamp_millis()
        );
        let proposed = match self.oracle.decide::<InferredValues>(INFER_SYSTEM, &user).await {
            Ok(inferred) => {
                tracing::debug!(action = action, reasoning = %inferred.reasoning, "inferred parameters");
                inferred.values
            }
            Err(e) => {
                tracing::warn!("Inference oracle failed for {}: {}", action, e);
                BTreeMap::new()
            }
        };

        let defaults = self.schema_defaults(action).await;
        let mut out = Map::new();
        for name in names {
            let candidate = proposed
                .get(name)
                .filter(|v| self.guard.admits(name, v))
                .or_else(|| defaults.get(name));
            if let Some(value) = candidate {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }

    async fn schema_defaults(&self, action: &str) -> Map<String, Value> {
        let Ok(tools) = self.tools.registry().list_tools().await else {
            return Map::new();
        };
        tools
            .into_iter()
            .find(|t| t.name == action)
            .map(|t| {
                t.input_schema
                    .properties
                    .into_iter()
                    .filter_map(|(k, p)| p.get("default").cloned().map(|d| (k, d)))
                    .collect()
            })
            .unwrap_or_default()
    }
}
