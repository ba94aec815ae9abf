//! Plan Validator：每步结束后重新评估计划进度
//!
//! 确定性进度 = 已完成 / 总步骤；再请 Oracle 结合目标、近期结果与累计错误确认或覆盖。
//! Oracle 不可用时 fail-closed：存在任何未解决错误即停止。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::engine::ExecutionState;
use crate::oracle::{preview, ReasoningOracle, Validate};

const VALIDATOR_SYSTEM: &str = "You are a plan progress validator. Given the goal, the plan steps, \
the results so far and any errors, judge whether the plan is still valid, whether the goal is already \
achieved, and whether execution should continue, adapt, or be re-planned.";

const RECENT_RESULTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanValidationResult {
    pub is_valid: bool,
    /// 0.0 ~ 1.0
    pub progress: f64,
    pub goal_achieved: bool,
    pub should_continue: bool,
    pub should_adapt: bool,
    pub should_replan: bool,
    pub reasoning: String,
    pub recommendations: Vec<String>,
}

/// Oracle 的评估；缺省字段沿用确定性结果
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
struct ProgressAssessment {
    is_valid: Option<bool>,
    progress: Option<f64>,
    goal_achieved: Option<bool>,
    should_continue: Option<bool>,
    should_adapt: Option<bool>,
    should_replan: Option<bool>,
    reasoning: Option<String>,
    recommendations: Vec<String>,
}

impl Validate for ProgressAssessment {
    fn validate(&self) -> Result<(), String> {
        match self.progress {
            Some(p) if !(0.0..=1.0).contains(&p) => Err(format!("progress {p} outside [0, 1]")),
            _ => Ok(()),
        }
    }
}

pub struct PlanValidator {
    oracle: ReasoningOracle,
}

impl PlanValidator {
    pub fn new(oracle: ReasoningOracle) -> Self {
        Self { oracle }
    }

    pub async fn validate_progress(&self, state: &ExecutionState) -> PlanValidationResult {
        let baseline = baseline(state);

        let limit = self.oracle.preview_chars();
        let steps: Vec<String> = state
            .plan
            .steps
            .iter()
            .map(|s| {
                let mark = if state.executed_steps.contains(&s.id) {
                    "done"
                } else {
                    "pending"
                };
                format!("- [{}] {} {}: {}", mark, s.order, s.action, s.description)
            })
            .collect();
        let recent: Vec<String> = state
            .partial_results
            .iter()
            .rev()
            .take(RECENT_RESULTS)
            .map(|p| format!("- step {} ({}): {}", p.step_order, p.action, preview(&p.output.to_string(), limit)))
            .collect();
        let user = format!(
            "Goal: {}\nUser query: {}\nProgress: {}/{} steps ({:.0}%)\n\nSteps:\n{}\n\nRecent results:\n{}\n\nErrors:\n{}",
            state.plan.goal,
            state.request.user_query,
            state.completed_count(),
            state.plan.steps.len(),
            baseline.progress * 100.0,
            steps.join("\n"),
            if recent.is_empty() { "(none)".to_string() } else { recent.join("\n") },
            if state.errors.is_empty() { "(none)".to_string() } else { state.errors.join("\n") },
        );

        match self
            .oracle
            .decide::<ProgressAssessment>(VALIDATOR_SYSTEM, &user)
            .await
        {
            Ok(a) => PlanValidationResult {
                is_valid: a.is_valid.unwrap_or(baseline.is_valid),
                progress: a.progress.unwrap_or(baseline.progress),
                goal_achieved: a.goal_achieved.unwrap_or(baseline.goal_achieved),
                should_continue: a.should_continue.unwrap_or(baseline.should_continue),
                should_adapt: a.should_adapt.unwrap_or(baseline.should_adapt),
                should_replan: a.should_replan.unwrap_or(baseline.should_replan),
                reasoning: a.reasoning.unwrap_or(baseline.reasoning),
                recommendations: if a.recommendations.is_empty() {
                    baseline.recommendations
                } else {
                    a.recommendations
                },
            },
            Err(e) => {
                tracing::warn!("Plan validator oracle failed, failing closed: {}", e);
                baseline
            }
        }
    }
}

/// 不依赖 Oracle 的评估；有错误即不继续
fn baseline(state: &ExecutionState) -> PlanValidationResult {
    let total = state.plan.steps.len();
    let completed = state.completed_count();
    let progress = if total == 0 {
        1.0
    } else {
        completed as f64 / total as f64
    };
    let clean = state.errors.is_empty();
    let all_done = state
        .plan
        .steps
        .iter()
        .all(|s| state.executed_steps.contains(&s.id));

    let mut recommendations = Vec::new();
    if !clean {
        recommendations.push(format!(
            "Resolve {} error(s) before continuing",
            state.errors.len()
        ));
    }
    PlanValidationResult {
        is_valid: clean,
        progress,
        goal_achieved: all_done && clean,
        should_continue: clean,
        should_adapt: !clean,
        should_replan: false,
        reasoning: format!("{completed}/{total} steps completed, {} error(s)", state.errors.len()),
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Plan, RequestContext, Step};
    use crate::llm::ScriptedLlmClient;
    use serde_json::json;
    use std::sync::Arc;

    fn state() -> ExecutionState {
        ExecutionState::new(
            RequestContext::new("q"),
            Plan::new(
                "g",
                vec![Step::new("a", 1, "list"), Step::new("b", 2, "get")],
            ),
        )
    }

    #[tokio::test]
    async fn test_fail_closed_on_errors() {
        let v = PlanValidator::new(ReasoningOracle::new(Arc::new(ScriptedLlmClient::unavailable())));
        let mut s = state();
        s.executed_steps.insert("a".into());
        s.errors.push("Step 2 (get): not found".into());
        let r = v.validate_progress(&s).await;
        assert!(!r.should_continue);
        assert!(!r.is_valid);
        assert!(!r.goal_achieved);
        assert_eq!(r.progress, 0.5);
    }

    #[tokio::test]
    async fn test_oracle_overrides_and_fills_gaps() {
        let llm = ScriptedLlmClient::new().route(
            "plan progress validator",
            json!({"goalAchieved": true, "shouldContinue": false, "reasoning": "answer found"}).to_string(),
        );
        let v = PlanValidator::new(ReasoningOracle::new(Arc::new(llm)));
        let mut s = state();
        s.executed_steps.insert("a".into());
        let r = v.validate_progress(&s).await;
        assert!(r.goal_achieved);
        assert!(!r.should_continue);
        assert_eq!(r.progress, 0.5);
        assert_eq!(r.reasoning, "answer found");
    }

    #[tokio::test]
    async fn test_out_of_range_progress_is_rejected() {
        let llm = ScriptedLlmClient::new().route("plan progress validator", r#"{"progress": 3.0}"#);
        let v = PlanValidator::new(ReasoningOracle::new(Arc::new(llm)));
        let r = v.validate_progress(&state()).await;
        assert_eq!(r.progress, 0.0);
        assert!(r.should_continue);
    }
}
