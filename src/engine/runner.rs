//! 计划执行外层循环
//!
//! 按顺序执行步骤；每步的修订通过 `Plan::commit` 提交；每步结束后由 Plan Validator 决定继续、停止或重新规划。
//! 取消为协作式：只在下一步开始前检查，不中断进行中的工具调用。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::engine::events::{send_event, ExecutionEvent};
use crate::engine::step_executor::StepExecutor;
use crate::engine::validator::{PlanValidationResult, PlanValidator};
use crate::engine::{
    AdaptationRecord, ExecutionResult, ExecutionState, FollowUpQuestion, Plan, PlanUpdate,
};

/// 一次计划执行的结束方式
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Halted { reason: String },
    AwaitingUser { question: FollowUpQuestion },
    ReplanRequested { reason: String },
    Cancelled,
}

/// 交给调用方持久化 / 展示的执行报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub plan: Plan,
    pub results: Vec<ExecutionResult>,
    pub plan_updates: Vec<PlanUpdate>,
    pub validations: Vec<PlanValidationResult>,
    pub adaptations: Vec<AdaptationRecord>,
    pub questions: Vec<FollowUpQuestion>,
    pub errors: Vec<String>,
}

pub struct PlanRunner {
    executor: StepExecutor,
    validator: PlanValidator,
    cancel: CancellationToken,
    event_tx: Option<UnboundedSender<ExecutionEvent>>,
}

impl PlanRunner {
    pub fn new(executor: StepExecutor, validator: PlanValidator) -> Self {
        Self {
            executor,
            validator,
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// 设置进度事件发送端；步骤级事件请在 StepExecutor 上单独设置
    pub fn with_event_tx(mut self, tx: UnboundedSender<ExecutionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// 执行整份计划；state 在结束时被消费
    pub async fn run(&self, mut state: ExecutionState) -> RunReport {
        let mut plan_updates = Vec::new();
        let mut validations = Vec::new();
        let step_ids: Vec<String> = state.plan.steps.iter().map(|s| s.id.clone()).collect();

        tracing::info!(
            plan = %state.plan.id,
            steps = step_ids.len(),
            "Running plan: {}",
            state.plan.goal
        );

        let mut outcome = None;
        for id in step_ids {
            if self.cancel.is_cancelled() {
                tracing::info!("Plan run cancelled before step {}", id);
                outcome = Some(RunOutcome::Cancelled);
                break;
            }
            if state.executed_steps.contains(&id) {
                continue;
            }
            let Some(step) = state.plan.step(&id).cloned() else {
                continue;
            };

            let step_outcome = self.executor.execute_step(&step, &mut state).await;
            if let Some(update) = step_outcome.plan_update {
                plan_updates.push(update);
            }
            if let Some(revision) = step_outcome.revision {
                state.plan.commit(revision);
            }
            if let Some(question) = step_outcome.question {
                outcome = Some(RunOutcome::AwaitingUser { question });
                break;
            }

            let validation = self.validator.validate_progress(&state).await;
            send_event(
                &self.event_tx,
                ExecutionEvent::ProgressValidated {
                    progress: validation.progress,
                    should_continue: validation.should_continue,
                },
            );
            let verdict = if validation.goal_achieved {
                Some(RunOutcome::Completed)
            } else if validation.should_replan {
                Some(RunOutcome::ReplanRequested {
                    reason: validation.reasoning.clone(),
                })
            } else if !validation.should_continue {
                Some(RunOutcome::Halted {
                    reason: validation.reasoning.clone(),
                })
            } else {
                None
            };
            validations.push(validation);
            if verdict.is_some() {
                outcome = verdict;
                break;
            }
        }

        let outcome = outcome.unwrap_or_else(|| {
            if state.errors.is_empty() {
                RunOutcome::Completed
            } else {
                RunOutcome::Halted {
                    reason: format!("plan finished with {} error(s)", state.errors.len()),
                }
            }
        });
        tracing::info!(outcome = ?outcome, version = state.plan.version, "Plan run finished");

        RunReport {
            outcome,
            plan: state.plan,
            results: state.execution_results,
            plan_updates,
            validations,
            adaptations: state.adaptations,
            questions: state.questions_asked,
            errors: state.errors,
        }
    }
}
