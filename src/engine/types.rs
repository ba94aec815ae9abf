//! 计划执行数据模型
//!
//! Plan / Step 由上游规划器拥有；引擎不原地修改 Step，而是返回新的步骤修订（revision）与 PlanUpdate，
//! 由调用方通过 `Plan::commit` 提交（版本号递增）。ExecutionState 每次计划执行一份，执行结束即丢弃。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ErrorType;

pub type StepId = String;

/// 计划中的一个步骤：动作名 + 参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub order: u32,
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Step {
    pub fn new(id: impl Into<String>, order: u32, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            order,
            action: action.into(),
            description: String::new(),
            parameters: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// 有序步骤序列 + 自然语言目标；version 在每次提交修订时递增
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub id: String,
    pub goal: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub version: u32,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut steps = steps;
        steps.sort_by_key(|s| s.order);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            steps,
            version: 0,
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// 用修订替换同 id 的步骤；找不到时返回 false 且版本不变
    pub fn commit(&mut self, revision: Step) -> bool {
        match self.steps.iter_mut().find(|s| s.id == revision.id) {
            Some(slot) => {
                *slot = revision;
                self.version += 1;
                true
            }
            None => false,
        }
    }
}

/// 请求上下文：请求 id、用户原始问题、经手的 agent 链
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub id: String,
    pub user_query: String,
    #[serde(default)]
    pub agent_chain: Vec<String>,
}

impl RequestContext {
    pub fn new(user_query: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_query: user_query.into(),
            agent_chain: Vec::new(),
        }
    }
}

/// 前序步骤的工具输出（供参数提取）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialResult {
    pub step_id: StepId,
    pub step_order: u32,
    pub action: String,
    pub output: Value,
}

/// 步骤终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    AwaitingUser,
}

/// 每个步骤一条、只追加的执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub step_id: StepId,
    pub step_order: u32,
    pub success: bool,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub duration_ms: u64,
    /// 实际调用次数
    pub retries: u32,
    pub timestamp: i64,
    pub tool_called: String,
    pub parameters_used: Map<String, Value>,
}

/// 参数改写审计记录（与改写本身分离）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanUpdate {
    pub step_id: StepId,
    pub step_order: u32,
    pub timestamp: i64,
    pub original_parameters: Map<String, Value>,
    pub updated_parameters: Map<String, Value>,
    pub reason: String,
    /// adapt 改写了动作时记录新动作
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_action: Option<String>,
}

/// adapt 决策导致的动作切换
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptationRecord {
    pub step_id: StepId,
    pub from_action: String,
    pub to_action: String,
    pub reason: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionCategory {
    MissingData,
    ErrorRecovery,
    Clarification,
    Confirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum QuestionPriority {
    High,
    Medium,
    Low,
}

/// 问题上下文：失败了什么、尝试过什么、建议
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionContext {
    pub step_id: StepId,
    pub action: String,
    pub what_failed: String,
    pub what_was_attempted: String,
    pub suggestion: String,
    #[serde(default)]
    pub missing_params: Vec<String>,
}

/// 面向用户的结构化追问；创建后不再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    pub id: String,
    pub question: String,
    pub category: QuestionCategory,
    pub priority: QuestionPriority,
    pub context: QuestionContext,
}

/// 单次计划执行的进程内状态
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub request: RequestContext,
    pub plan: Plan,
    /// 已成功完成的步骤 id
    pub executed_steps: BTreeSet<StepId>,
    pub execution_results: Vec<ExecutionResult>,
    /// 按产生顺序排列的前序输出（含调用方提供的历史结果）
    pub partial_results: Vec<PartialResult>,
    pub errors: Vec<String>,
    pub questions_asked: Vec<FollowUpQuestion>,
    pub adaptations: Vec<AdaptationRecord>,
}

impl ExecutionState {
    pub fn new(request: RequestContext, plan: Plan) -> Self {
        Self {
            request,
            plan,
            executed_steps: BTreeSet::new(),
            execution_results: Vec::new(),
            partial_results: Vec::new(),
            errors: Vec::new(),
            questions_asked: Vec::new(),
            adaptations: Vec::new(),
        }
    }

    /// 预置调用方从外部存储读取的历史结果
    pub fn with_previous_results(mut self, previous: Vec<PartialResult>) -> Self {
        self.partial_results = previous;
        self
    }

    pub fn completed_count(&self) -> usize {
        self.executed_steps.len()
    }

    pub fn failed_count(&self) -> usize {
        self.execution_results.iter().filter(|r| !r.success).count()
    }

    /// 记录步骤终态：成功写入 executed_steps 与 partial_results，失败写入 errors（skipped 不计入）
    pub fn record(&mut self, result: ExecutionResult, action: &str) {
        if result.success {
            self.executed_steps.insert(result.step_id.clone());
            self.partial_results.push(PartialResult {
                step_id: result.step_id.clone(),
                step_order: result.step_order,
                action: action.to_string(),
                output: result.result.clone().unwrap_or(Value::Null),
            });
        } else if let (Some(err), false) = (&result.error, result.status == StepStatus::Skipped) {
            self.errors.push(format!(
                "Step {} ({}): {}",
                result.step_order, action, err
            ));
        }
        self.execution_results.push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_sorts_steps_and_commits_revisions() {
        let plan_steps = vec![
            Step::new("b", 2, "get_facility"),
            Step::new("a", 1, "list_facilities"),
        ];
        let mut plan = Plan::new("find Hannover", plan_steps);
        assert_eq!(plan.steps[0].id, "a");

        let revised = plan.steps[1].clone().with_param("id", json!("6905db9211cc522275d5f013"));
        assert!(plan.commit(revised));
        assert_eq!(plan.version, 1);
        assert_eq!(
            plan.step("b").unwrap().parameters["id"],
            "6905db9211cc522275d5f013"
        );

        assert!(!plan.commit(Step::new("zzz", 9, "x")));
        assert_eq!(plan.version, 1);
    }

    #[test]
    fn test_execution_result_serializes_camel_case() {
        let result = ExecutionResult {
            step_id: "s1".into(),
            step_order: 1,
            success: false,
            status: StepStatus::AwaitingUser,
            result: None,
            error: Some("boom".into()),
            error_type: Some(ErrorType::ToolError),
            duration_ms: 3,
            retries: 1,
            timestamp: 0,
            tool_called: "echo".into(),
            parameters_used: Map::new(),
        };
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["stepId"], "s1");
        assert_eq!(v["status"], "awaiting-user");
        assert_eq!(v["errorType"], "tool-error");
    }

    #[test]
    fn test_record_tracks_success_and_errors() {
        let mut state = ExecutionState::new(
            RequestContext::new("q"),
            Plan::new("g", vec![Step::new("s1", 1, "echo")]),
        );
        let mut result = ExecutionResult {
            step_id: "s1".into(),
            step_order: 1,
            success: true,
            status: StepStatus::Succeeded,
            result: Some(json!([1])),
            error: None,
            error_type: None,
            duration_ms: 0,
            retries: 1,
            timestamp: 0,
            tool_called: "echo".into(),
            parameters_used: Map::new(),
        };
        state.record(result.clone(), "echo");
        assert_eq!(state.completed_count(), 1);
        assert_eq!(state.partial_results[0].output, json!([1]));

        result.success = false;
        result.status = StepStatus::Failed;
        result.error = Some("bad".into());
        state.record(result, "echo");
        assert_eq!(state.failed_count(), 1);
        assert_eq!(state.errors, vec!["Step 1 (echo): bad".to_string()]);
    }
}
