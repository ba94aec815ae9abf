//! Coordinator：步骤参数协调
//!
//! 判断步骤参数是否需要补全；需要时结合计划目标、动作 schema 与前序结果询问 Oracle，
//! 再用确定性守卫过滤 Oracle 给出的取值（空值 / "null" / 未声明字段 / 不合格标识符一律丢弃），
//! 最后对残留占位符做一次直接提取兜底（取最近数组结果首项的标识符字段）。

use std::collections::BTreeMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::guards::{first_item, is_empty_result, is_error_result, ParameterGuard};
use crate::engine::{ExecutionState, PartialResult, PlanUpdate, Step};
use crate::oracle::{preview, ReasoningOracle, Validate};
use crate::tools::{is_identifier_field, is_missing_value, lookup_schema, ActionSchema, ToolRegistryAdapter};

const COORDINATOR_SYSTEM: &str = "You are a parameter coordinator for a tool-executing agent. \
Given the plan goal, the current step, the tool's declared parameters and the outputs of previous steps, \
decide whether the step's parameters must be resolved from previous results. \
Only propose concrete values that literally appear in the previous results. \
Never invent identifiers, never return placeholders, and never return \"null\".";

/// 最多放入 prompt 的前序结果条数
const MAX_PREVIOUS_IN_PROMPT: usize = 5;

/// Oracle 给出的协调决策；只消费一次
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinationResult {
    /// 参数是否需要从前序结果中补全
    pub needs_coordination: bool,
    pub reasoning: String,
    /// 建议的完整参数集
    pub parameters: BTreeMap<String, Value>,
    /// 从前序结果中提取出的具体取值（优先于 parameters）
    pub extracted_values: BTreeMap<String, Value>,
    pub missing_params: Vec<String>,
    pub alternatives: Vec<String>,
    pub recommendation: Option<String>,
}

impl Validate for CoordinationResult {
    fn validate(&self) -> Result<(), String> {
        if self
            .parameters
            .keys()
            .chain(self.extracted_values.keys())
            .any(|k| k.trim().is_empty())
        {
            return Err("empty parameter name".to_string());
        }
        Ok(())
    }
}

impl CoordinationResult {
    fn skip(parameters: &Map<String, Value>, reasoning: impl Into<String>) -> Self {
        Self {
            needs_coordination: false,
            reasoning: reasoning.into(),
            parameters: parameters.clone().into_iter().collect(),
            ..Self::default()
        }
    }
}

/// coordinate_parameters 的结果
#[derive(Debug, Clone)]
pub struct CoordinationOutcome {
    pub parameters: Map<String, Value>,
    pub was_updated: bool,
    pub original_parameters: Map<String, Value>,
    pub extraction_impossible: bool,
    pub reason: Option<String>,
    pub remaining_placeholders: Vec<String>,
    /// 参数被改写时的审计记录（与后续校验是否通过无关）
    pub plan_update: Option<PlanUpdate>,
}

impl CoordinationOutcome {
    fn unchanged(parameters: &Map<String, Value>) -> Self {
        Self {
            parameters: parameters.clone(),
            was_updated: false,
            original_parameters: parameters.clone(),
            extraction_impossible: false,
            reason: None,
            remaining_placeholders: Vec::new(),
            plan_update: None,
        }
    }
}

pub struct Coordinator {
    oracle: ReasoningOracle,
    registry: Arc<dyn ToolRegistryAdapter>,
    guard: Arc<ParameterGuard>,
}

impl Coordinator {
    pub fn new(
        oracle: ReasoningOracle,
        registry: Arc<dyn ToolRegistryAdapter>,
        guard: Arc<ParameterGuard>,
    ) -> Self {
        Self {
            oracle,
            registry,
            guard,
        }
    }

    async fn schema_for(&self, action: &str) -> Option<ActionSchema> {
        match lookup_schema(self.registry.as_ref(), action).await {
            Ok(schema) => schema,
            Err(e) => {
                tracing::warn!("Schema lookup for {} failed: {}", action, e);
                None
            }
        }
    }

    /// 未解析参数中，依赖的前序结果为空或带错误的那些（无需 Oracle 即可判定无法提取）
    fn dead_dependencies(
        &self,
        step: &Step,
        unresolved: &[String],
        previous: &[PartialResult],
    ) -> Vec<(String, PartialResult)> {
        unresolved
            .iter()
            .filter_map(|name| {
                let dep = self
                    .guard
                    .dependency_for(name, step.parameters.get(name), previous)?;
                (is_empty_result(&dep.output) || is_error_result(&dep.output))
                    .then(|| (name.clone(), dep.clone()))
            })
            .collect()
    }

    /// 判断步骤是否需要协调；只有存在未解析参数且有可用前序结果时才询问 Oracle
    pub async fn should_coordinate(
        &self,
        step: &Step,
        state: &ExecutionState,
        previous: &[PartialResult],
    ) -> CoordinationResult {
        let schema = self.schema_for(&step.action).await;
        let unresolved = self.guard.unresolved_params(&step.parameters, schema.as_ref());

        if unresolved.is_empty() {
            return CoordinationResult::skip(&step.parameters, "all parameters are concrete");
        }

        if previous.is_empty() {
            let has_placeholders = !self.guard.placeholder_params(&step.parameters).is_empty();
            return CoordinationResult {
                needs_coordination: has_placeholders,
                reasoning: "no previous results to extract from".to_string(),
                parameters: step.parameters.clone().into_iter().collect(),
                missing_params: unresolved,
                ..CoordinationResult::default()
            };
        }

        let dead = self.dead_dependencies(step, &unresolved, previous);
        if !dead.is_empty() {
            let names: Vec<String> = dead.iter().map(|(n, _)| n.clone()).collect();
            return CoordinationResult {
                needs_coordination: true,
                reasoning: format!(
                    "previous results for {} are empty or failed",
                    names.join(", ")
                ),
                parameters: step.parameters.clone().into_iter().collect(),
                missing_params: names,
                ..CoordinationResult::default()
            };
        }

        let user = self.build_context(step, state, previous, schema.as_ref(), &unresolved);
        match self
            .oracle
            .decide::<CoordinationResult>(COORDINATOR_SYSTEM, &user)
            .await
        {
            Ok(result) => {
                tracing::debug!(
                    step = %step.id,
                    needs = result.needs_coordination,
                    "coordination decided"
                );
                result
            }
            Err(e) => {
                tracing::warn!("Coordinator oracle failed for step {}: {}", step.id, e);
                CoordinationResult {
                    needs_coordination: true,
                    reasoning: format!("oracle unavailable, falling back to direct extraction: {e}"),
                    parameters: step.parameters.clone().into_iter().collect(),
                    missing_params: unresolved,
                    ..CoordinationResult::default()
                }
            }
        }
    }

    /// 应用协调决策，返回新参数集；never 原地修改 step
    pub async fn coordinate_parameters(
        &self,
        step: &Step,
        _state: &ExecutionState,
        previous: &[PartialResult],
        coordination: &CoordinationResult,
    ) -> CoordinationOutcome {
        if !coordination.needs_coordination {
            return CoordinationOutcome::unchanged(&step.parameters);
        }

        let schema = self.schema_for(&step.action).await;
        let unresolved = self.guard.unresolved_params(&step.parameters, schema.as_ref());

        let dead = self.dead_dependencies(step, &unresolved, previous);
        if let Some((name, dep)) = dead.first() {
            let what = if is_error_result(&dep.output) {
                "returned an error"
            } else {
                "returned no results"
            };
            return CoordinationOutcome {
                extraction_impossible: true,
                reason: Some(format!(
                    "cannot resolve '{}': step {} ({}) {}",
                    name, dep.step_order, dep.action, what
                )),
                remaining_placeholders: self.guard.placeholder_params(&step.parameters),
                ..CoordinationOutcome::unchanged(&step.parameters)
            };
        }

        let mut params = step.parameters.clone();
        let mut reasons = Vec::new();

        // extracted_values 覆盖 parameters 中的同名建议
        let mut proposals: BTreeMap<&String, &Value> = coordination.parameters.iter().collect();
        proposals.extend(coordination.extracted_values.iter());

        for (name, value) in proposals {
            if !self.declared(name, schema.as_ref(), &step.parameters) {
                tracing::warn!("Discarding undeclared parameter '{}' for {}", name, step.action);
                continue;
            }
            if !self.guard.admits(name, value) {
                tracing::warn!("Discarding implausible value for '{}': {}", name, value);
                continue;
            }
            if params.get(name.as_str()) != Some(value) {
                params.insert(name.clone(), value.clone());
                reasons.push(format!("{name} resolved by coordinator"));
            }
        }

        // 可选参数上的空值直接去掉，必填参数留给校验阶段
        let dropped: Vec<String> = params
            .iter()
            .filter(|(k, v)| {
                is_missing_value(v) && !schema.as_ref().map(|s| s.is_required(k)).unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for name in dropped {
            params.remove(&name);
            reasons.push(format!("{name} dropped (empty)"));
        }

        let mut remaining = self.guard.placeholder_params(&params);
        let missing_ids: Vec<String> = schema
            .as_ref()
            .map(|s| {
                s.required
                    .iter()
                    .filter(|r| is_identifier_field(r) && !params.contains_key(r.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if !remaining.is_empty() || !missing_ids.is_empty() {
            let targets: Vec<String> = remaining.iter().chain(missing_ids.iter()).cloned().collect();
            for name in targets {
                if let Some(value) = self.direct_extract(&name, previous) {
                    reasons.push(format!("{name} extracted directly from latest result"));
                    params.insert(name, value);
                }
            }
            remaining = self.guard.placeholder_params(&params);
        }

        let was_updated = params != step.parameters;
        let plan_update = was_updated.then(|| PlanUpdate {
            step_id: step.id.clone(),
            step_order: step.order,
            timestamp: chrono::Utc::now().timestamp_millis(),
            original_parameters: step.parameters.clone(),
            updated_parameters: params.clone(),
            reason: if coordination.reasoning.is_empty() {
                reasons.join("; ")
            } else {
                format!("{} ({})", coordination.reasoning, reasons.join("; "))
            },
            updated_action: None,
        });

        CoordinationOutcome {
            parameters: params,
            was_updated,
            original_parameters: step.parameters.clone(),
            extraction_impossible: false,
            reason: (!remaining.is_empty())
                .then(|| format!("placeholders remain in: {}", remaining.join(", "))),
            remaining_placeholders: remaining,
            plan_update,
        }
    }

    /// 字段是否在 schema 中声明；schema 不可得时只接受步骤已有的参数名
    fn declared(
        &self,
        name: &str,
        schema: Option<&ActionSchema>,
        original: &Map<String, Value>,
    ) -> bool {
        match schema {
            Some(s) => s.declares(name),
            None => original.contains_key(name),
        }
    }

    /// 兜底：从最近一个非空数组结果的首项中直接取标识符字段
    fn direct_extract(&self, name: &str, previous: &[PartialResult]) -> Option<Value> {
        if !is_identifier_field(name) {
            return None;
        }
        let item = previous
            .iter()
            .rev()
            .filter(|p| !is_error_result(&p.output))
            .find_map(|p| first_item(&p.output))?;
        let obj = item.as_object()?;
        [name, "_id", "id"]
            .iter()
            .filter_map(|k| obj.get(*k))
            .find(|v| self.guard.admits(name, v))
            .cloned()
    }

    fn build_context(
        &self,
        step: &Step,
        state: &ExecutionState,
        previous: &[PartialResult],
        schema: Option<&ActionSchema>,
        unresolved: &[String],
    ) -> String {
        let limit = self.oracle.preview_chars();
        let previous_block: Vec<String> = previous
            .iter()
            .rev()
            .take(MAX_PREVIOUS_IN_PROMPT)
            .rev()
            .map(|p| {
                format!(
                    "- step {} ({}): {}",
                    p.step_order,
                    p.action,
                    preview(&p.output.to_string(), limit)
                )
            })
            .collect();
        let schema_block = schema
            .map(|s| s.describe())
            .unwrap_or_else(|| format!("{} (schema unavailable)", step.action));

        format!(
            "Goal: {}\nUser query: {}\n\nCurrent step {} ({}): {}\nCurrent parameters: {}\nUnresolved parameters: {}\n\nDeclared parameters:\n{}\n\nPrevious results:\n{}",
            state.plan.goal,
            state.request.user_query,
            step.order,
            step.action,
            step.description,
            Value::Object(step.parameters.clone()),
            unresolved.join(", "),
            schema_block,
            previous_block.join("\n"),
        )
    }
}
