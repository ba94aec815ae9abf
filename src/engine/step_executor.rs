//! Step Executor：单步状态机
//!
//! coordinating → validating → invoking → (succeeded | retrying | recovering | awaiting-user | skipped | failed)
//!
//! - 协调报告 extraction_impossible → failed（coordination-error），不触达注册表
//! - 校验失败 → failed（validation-error），附带缺失数据追问
//! - 工具失败 → recovering，由 Error Handler 决定 retry / adapt / ask-user / skip；调用次数上限 max_attempts
//! - Error Handler 自身出错 → failed，沿用最后一次工具错误（tool-error）
//!
//! 每步恰好产生一条 ExecutionResult；步骤本身不被修改，动作或参数变化以修订（revision）+ PlanUpdate 返回。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::core::{EngineError, ErrorType};
use crate::engine::coordinator::Coordinator;
use crate::engine::error_handler::{ErrorDecision, ErrorHandler};
use crate::engine::events::{send_event, ExecutionEvent};
use crate::engine::guards::ParameterGuard;
use crate::engine::question::QuestionGenerator;
use crate::engine::resolver::ParameterResolver;
use crate::engine::{
    AdaptationRecord, ExecutionResult, ExecutionState, FollowUpQuestion, PlanUpdate, Step,
    StepStatus,
};
use crate::oracle::ReasoningOracle;
use crate::tools::{ToolError, ToolExecutor, ToolRegistryAdapter};

/// 单步执行结果：执行记录 + 可选的步骤修订与审计
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: ExecutionResult,
    /// 动作或参数被改写时的审计记录
    pub plan_update: Option<PlanUpdate>,
    /// 待调用方通过 `Plan::commit` 提交的新步骤
    pub revision: Option<Step>,
    /// awaiting-user 或缺失数据时需要呈现给用户的问题
    pub question: Option<FollowUpQuestion>,
}

enum StepPhase {
    Coordinating,
    Validating,
    Invoking,
    Retrying,
    Recovering(ToolError),
    AwaitingUser {
        question: FollowUpQuestion,
        error: ToolError,
    },
    Succeeded(Value),
    Skipped {
        reason: String,
        error: ToolError,
    },
    Failed {
        error_type: ErrorType,
        message: String,
    },
}

/// 单步执行中的可变工作集（动作、参数、调用次数）
struct Attempt {
    action: String,
    params: Map<String, Value>,
    attempts: u32,
    notes: Vec<String>,
    question: Option<FollowUpQuestion>,
}

impl Attempt {
    fn working_step(&self, step: &Step) -> Step {
        Step {
            action: self.action.clone(),
            parameters: self.params.clone(),
            ..step.clone()
        }
    }
}

pub struct StepExecutor {
    tools: Arc<ToolExecutor>,
    guard: Arc<ParameterGuard>,
    coordinator: Coordinator,
    resolver: ParameterResolver,
    error_handler: ErrorHandler,
    questions: QuestionGenerator,
    max_attempts: u32,
    backoff_base_ms: u64,
    recoordinate_on_adapt: bool,
    event_tx: Option<UnboundedSender<ExecutionEvent>>,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<dyn ToolRegistryAdapter>,
        oracle: ReasoningOracle,
        config: &AppConfig,
    ) -> Result<Self, EngineError> {
        let guard = Arc::new(ParameterGuard::from_config(&config.coordination)?);
        let tools = Arc::new(ToolExecutor::new(
            registry.clone(),
            config.executor.tool_timeout_secs,
        ));
        Ok(Self {
            coordinator: Coordinator::new(oracle.clone(), registry.clone(), guard.clone()),
            resolver: ParameterResolver::new(oracle.clone(), tools.clone(), guard.clone()),
            error_handler: ErrorHandler::new(oracle.clone(), registry),
            questions: QuestionGenerator::new(oracle),
            tools,
            guard,
            max_attempts: config.executor.max_attempts.max(1),
            backoff_base_ms: config.executor.backoff_base_ms,
            recoordinate_on_adapt: config.executor.recoordinate_on_adapt,
            event_tx: None,
        })
    }

    /// 设置过程事件发送端（时间线 / SSE）
    pub fn with_event_tx(mut self, tx: UnboundedSender<ExecutionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn questions(&self) -> &QuestionGenerator {
        &self.questions
    }

    /// 执行单个步骤直至终态；结果写入 state，步骤修订交由调用方提交
    pub async fn execute_step(&self, step: &Step, state: &mut ExecutionState) -> StepOutcome {
        let start = Instant::now();
        tracing::info!("Executing step {} ({}): {}", step.order, step.action, step.id);
        send_event(
            &self.event_tx,
            ExecutionEvent::StepStarted {
                step_id: step.id.clone(),
                order: step.order,
                action: step.action.clone(),
            },
        );

        let mut work = Attempt {
            action: step.action.clone(),
            params: step.parameters.clone(),
            attempts: 0,
            notes: Vec::new(),
            question: None,
        };

        let mut phase = StepPhase::Coordinating;
        let terminal = loop {
            phase = match phase {
                StepPhase::Coordinating => self.coordinate(step, &mut work, state).await,
                StepPhase::Validating => self.validate(step, &mut work, state).await,
                StepPhase::Invoking => self.invoke(&mut work).await,
                StepPhase::Retrying => {
                    let delay = self.backoff_base_ms.saturating_mul(u64::from(work.attempts));
                    tracing::info!(
                        "Retrying {} in {}ms (attempt {}/{})",
                        work.action,
                        delay,
                        work.attempts + 1,
                        self.max_attempts
                    );
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    StepPhase::Invoking
                }
                StepPhase::Recovering(error) => self.recover(step, &mut work, state, error).await,
                done => break done,
            };
        };

        self.finish(step, work, state, terminal, start)
    }

    async fn coordinate(&self, step: &Step, work: &mut Attempt, state: &ExecutionState) -> StepPhase {
        let working = work.working_step(step);
        let previous = &state.partial_results;
        let decision = self
            .coordinator
            .should_coordinate(&working, state, previous)
            .await;
        let outcome = self
            .coordinator
            .coordinate_parameters(&working, state, previous, &decision)
            .await;

        send_event(
            &self.event_tx,
            ExecutionEvent::Coordinated {
                step_id: step.id.clone(),
                updated: outcome.was_updated,
            },
        );
        if let Some(update) = &outcome.plan_update {
            tracing::info!("Parameters for step {} rewritten: {}", step.id, update.reason);
            work.notes.push(update.reason.clone());
        }
        work.params = outcome.parameters;

        if outcome.extraction_impossible {
            let message = outcome
                .reason
                .unwrap_or_else(|| "parameter extraction impossible".to_string());
            tracing::warn!("Step {} cannot be coordinated: {}", step.id, message);
            return StepPhase::Failed {
                error_type: ErrorType::CoordinationError,
                message,
            };
        }
        StepPhase::Validating
    }

    async fn validate(&self, step: &Step, work: &mut Attempt, state: &ExecutionState) -> StepPhase {
        match self.resolver.resolve(&work.action, &work.params, state).await {
            Ok(params) => {
                if params != work.params {
                    work.notes.push("missing parameters resolved".to_string());
                }
                work.params = params;
            }
            Err(failure) => {
                let ask = if failure.must_ask_user.is_empty() {
                    &failure.missing
                } else {
                    &failure.must_ask_user
                };
                work.question = self
                    .questions
                    .generate_missing_data_question(&work.working_step(step), state, ask)
                    .await;
                return StepPhase::Failed {
                    error_type: ErrorType::ValidationError,
                    message: failure.message,
                };
            }
        }

        self.precheck(work)
    }

    /// 调用前的最终守卫：占位符 / "null" / 不合格标识符不进入 invoking
    fn precheck(&self, work: &Attempt) -> StepPhase {
        match self.guard.check_invocation(&work.params) {
            Ok(()) => StepPhase::Invoking,
            Err(e) => {
                tracing::warn!("Step parameters for {} rejected before invocation: {}", work.action, e);
                StepPhase::Failed {
                    error_type: e.error_type(),
                    message: e.to_string(),
                }
            }
        }
    }

    async fn invoke(&self, work: &mut Attempt) -> StepPhase {
        work.attempts += 1;
        let args = Value::Object(work.params.clone());
        send_event(
            &self.event_tx,
            ExecutionEvent::ToolCall {
                tool: work.action.clone(),
                args: args.clone(),
                attempt: work.attempts,
            },
        );
        match self.tools.invoke(&work.action, args).await {
            Ok(value) => StepPhase::Succeeded(value),
            Err(e) => {
                tracing::warn!(
                    "Tool {} failed (attempt {}/{}): {}",
                    work.action,
                    work.attempts,
                    self.max_attempts,
                    e
                );
                send_event(
                    &self.event_tx,
                    ExecutionEvent::ToolFailure {
                        tool: work.action.clone(),
                        reason: e.message(),
                        attempt: work.attempts,
                    },
                );
                StepPhase::Recovering(e)
            }
        }
    }

    async fn recover(
        &self,
        step: &Step,
        work: &mut Attempt,
        state: &mut ExecutionState,
        error: ToolError,
    ) -> StepPhase {
        let working = work.working_step(step);
        let decision = match self
            .error_handler
            .handle_error(
                &error.message(),
                ErrorType::ToolError,
                &working,
                &work.params,
                state,
                work.attempts,
            )
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!("Error handler failed for step {}: {}", step.id, e);
                return StepPhase::Failed {
                    error_type: ErrorType::ToolError,
                    message: error.to_string(),
                };
            }
        };
        send_event(
            &self.event_tx,
            ExecutionEvent::Recovery {
                decision: decision.label().to_string(),
                detail: decision.reason().to_string(),
            },
        );

        match decision {
            ErrorDecision::Retry { max_retries, .. } => {
                let limit = max_retries
                    .unwrap_or(self.max_attempts)
                    .min(self.max_attempts);
                if work.attempts < limit {
                    StepPhase::Retrying
                } else {
                    StepPhase::Failed {
                        error_type: ErrorType::ToolError,
                        message: format!("{} (gave up after {} attempts)", error, work.attempts),
                    }
                }
            }
            ErrorDecision::Adapt { reason, adaptation } => {
                if work.attempts >= self.max_attempts {
                    return StepPhase::Failed {
                        error_type: ErrorType::ToolError,
                        message: format!("{} (no attempts left to adapt)", error),
                    };
                }
                tracing::info!(
                    "Adapting step {}: {} -> {} ({})",
                    step.id,
                    work.action,
                    adaptation.adapted_action,
                    reason
                );
                state.adaptations.push(AdaptationRecord {
                    step_id: step.id.clone(),
                    from_action: work.action.clone(),
                    to_action: adaptation.adapted_action.clone(),
                    reason: reason.clone(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
                work.notes.push(format!(
                    "adapted {} -> {}: {}",
                    work.action, adaptation.adapted_action, reason
                ));
                work.action = adaptation.adapted_action;
                let adapted: Map<String, Value> = adaptation
                    .adapted_parameters
                    .into_iter()
                    .filter(|(k, v)| self.guard.admits(k, v))
                    .collect();
                if !adapted.is_empty() {
                    work.params = adapted;
                }
                if self.recoordinate_on_adapt {
                    StepPhase::Coordinating
                } else {
                    self.precheck(work)
                }
            }
            ErrorDecision::AskUser { .. } => {
                match self
                    .questions
                    .generate_error_question(&error.message(), ErrorType::ToolError, &working, state)
                    .await
                {
                    Some(question) => StepPhase::AwaitingUser { question, error },
                    None => StepPhase::Failed {
                        error_type: ErrorType::ToolError,
                        message: error.to_string(),
                    },
                }
            }
            ErrorDecision::Skip { reason } => StepPhase::Skipped { reason, error },
        }
    }

    fn finish(
        &self,
        step: &Step,
        mut work: Attempt,
        state: &mut ExecutionState,
        terminal: StepPhase,
        start: Instant,
    ) -> StepOutcome {
        let mut question = work.question.take();
        let (status, result, error, error_type) = match terminal {
            StepPhase::Succeeded(value) => (StepStatus::Succeeded, Some(value), None, None),
            StepPhase::Skipped { reason, error } => (
                StepStatus::Skipped,
                None,
                Some(format!("skipped: {reason} (last error: {error})")),
                Some(ErrorType::ToolError),
            ),
            StepPhase::AwaitingUser { question: q, error } => {
                question = Some(q);
                (
                    StepStatus::AwaitingUser,
                    None,
                    Some(error.to_string()),
                    Some(ErrorType::ToolError),
                )
            }
            StepPhase::Failed {
                error_type,
                message,
            } => (StepStatus::Failed, None, Some(message), Some(error_type)),
            StepPhase::Coordinating
            | StepPhase::Validating
            | StepPhase::Invoking
            | StepPhase::Retrying
            | StepPhase::Recovering(_) => (
                StepStatus::Failed,
                None,
                Some("step stopped in a non-terminal phase".to_string()),
                Some(ErrorType::ToolError),
            ),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let success = status == StepStatus::Succeeded;
        let result = ExecutionResult {
            step_id: step.id.clone(),
            step_order: step.order,
            success,
            status,
            result,
            error,
            error_type,
            duration_ms,
            retries: work.attempts,
            timestamp: chrono::Utc::now().timestamp_millis(),
            tool_called: work.action.clone(),
            parameters_used: work.params.clone(),
        };
        state.record(result.clone(), &work.action);

        if let Some(q) = &question {
            send_event(
                &self.event_tx,
                ExecutionEvent::Question {
                    question: q.question.clone(),
                },
            );
            state.questions_asked.push(q.clone());
        }

        let changed = work.action != step.action || work.params != step.parameters;
        let plan_update = changed.then(|| PlanUpdate {
            step_id: step.id.clone(),
            step_order: step.order,
            timestamp: chrono::Utc::now().timestamp_millis(),
            original_parameters: step.parameters.clone(),
            updated_parameters: work.params.clone(),
            reason: if work.notes.is_empty() {
                "parameters rewritten".to_string()
            } else {
                work.notes.join("; ")
            },
            updated_action: (work.action != step.action).then(|| work.action.clone()),
        });
        let revision = changed.then(|| work.working_step(step));

        tracing::info!(
            step = %step.id,
            status = ?status,
            attempts = work.attempts,
            duration_ms,
            "step finished"
        );
        send_event(
            &self.event_tx,
            ExecutionEvent::StepFinished {
                step_id: step.id.clone(),
                status,
                duration_ms,
            },
        );

        StepOutcome {
            result,
            plan_update,
            revision,
            question,
        }
    }
}
