//! Question Generator：步骤无法在无人介入下继续时，生成结构化追问
//!
//! context 始终记录失败了什么、尝试过什么、建议怎么做；Oracle 失败时使用模板问题。

use schemars::JsonSchema;
use serde::Deserialize;

use crate::core::ErrorType;
use crate::engine::{
    ExecutionState, FollowUpQuestion, QuestionCategory, QuestionContext, QuestionPriority, Step,
};
use crate::oracle::{ReasoningOracle, Validate};

const QUESTION_SYSTEM: &str = "You are a question writer for a tool-executing agent that needs help \
from its user. Write ONE short, specific question the user can answer directly. Mention the concrete \
value or choice needed; do not mention internal tool names unless necessary.";

/// Oracle 起草的问题
#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct QuestionDraft {
    question: String,
    #[serde(default)]
    category: Option<QuestionCategory>,
    #[serde(default)]
    priority: Option<QuestionPriority>,
    #[serde(default)]
    suggestion: Option<String>,
}

impl Validate for QuestionDraft {
    fn validate(&self) -> Result<(), String> {
        if self.question.trim().is_empty() {
            return Err("empty question".to_string());
        }
        Ok(())
    }
}

pub struct QuestionGenerator {
    oracle: ReasoningOracle,
}

impl QuestionGenerator {
    pub fn new(oracle: ReasoningOracle) -> Self {
        Self { oracle }
    }

    /// 针对执行错误生成追问；错误为空时返回 None
    pub async fn generate_error_question(
        &self,
        error: &str,
        error_type: ErrorType,
        step: &Step,
        state: &ExecutionState,
    ) -> Option<FollowUpQuestion> {
        let error = error.trim();
        if error.is_empty() {
            return None;
        }

        let attempted = format!(
            "called {} with {}",
            step.action,
            serde_json::Value::Object(step.parameters.clone())
        );
        let user = format!(
            "Goal: {}\nUser query: {}\nStep {} ({}): {}\nWhat was attempted: {}\nError ({}): {}",
            state.plan.goal,
            state.request.user_query,
            step.order,
            step.action,
            step.description,
            attempted,
            error_type,
            error
        );

        let (category, priority, fallback_question, fallback_suggestion) = match error_type {
            ErrorType::ValidationError => (
                QuestionCategory::MissingData,
                QuestionPriority::High,
                format!("Step {} ({}) is missing information: {}. Can you provide it?", step.order, step.action, error),
                "Provide the missing values so the step can be retried.".to_string(),
            ),
            ErrorType::CoordinationError => (
                QuestionCategory::Clarification,
                QuestionPriority::High,
                format!(
                    "I could not determine the inputs for step {} ({}): {}. Which item did you mean?",
                    step.order, step.action, error
                ),
                "Name the specific item, or adjust the request so earlier steps return results.".to_string(),
            ),
            ErrorType::ToolError => (
                QuestionCategory::ErrorRecovery,
                QuestionPriority::Medium,
                format!(
                    "Step {} ({}) failed: {}. How would you like to proceed?",
                    step.order, step.action, error
                ),
                "Retry later, correct the parameters, or skip this step.".to_string(),
            ),
        };

        let draft = self.draft(&user).await;
        let context = QuestionContext {
            step_id: step.id.clone(),
            action: step.action.clone(),
            what_failed: error.to_string(),
            what_was_attempted: attempted,
            suggestion: draft
                .as_ref()
                .and_then(|d| d.suggestion.clone())
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(fallback_suggestion),
            missing_params: Vec::new(),
        };
        Some(build(draft, fallback_question, category, priority, context))
    }

    /// 针对缺失参数生成追问；没有缺失参数时返回 None
    pub async fn generate_missing_data_question(
        &self,
        step: &Step,
        state: &ExecutionState,
        missing_params: &[String],
    ) -> Option<FollowUpQuestion> {
        if missing_params.is_empty() {
            return None;
        }
        let missing = missing_params.join(", ");
        let user = format!(
            "Goal: {}\nUser query: {}\nStep {} ({}): {}\nMissing values: {}\nProvided: {}",
            state.plan.goal,
            state.request.user_query,
            step.order,
            step.action,
            step.description,
            missing,
            serde_json::Value::Object(step.parameters.clone())
        );

        let draft = self.draft(&user).await;
        let context = QuestionContext {
            step_id: step.id.clone(),
            action: step.action.clone(),
            what_failed: format!("required parameters not available: {missing}"),
            what_was_attempted: format!(
                "resolved parameters from previous results and the tool registry for {}",
                step.action
            ),
            suggestion: draft
                .as_ref()
                .and_then(|d| d.suggestion.clone())
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| format!("Provide values for: {missing}")),
            missing_params: missing_params.to_vec(),
        };
        let fallback = format!(
            "To continue with step {} ({}), please provide: {}.",
            step.order, step.action, missing
        );
        Some(build(
            draft,
            fallback,
            QuestionCategory::MissingData,
            QuestionPriority::High,
            context,
        ))
    }

    async fn draft(&self, user: &str) -> Option<QuestionDraft> {
        match self.oracle.decide::<QuestionDraft>(QUESTION_SYSTEM, user).await {
            Ok(draft) => Some(draft),
            Err(e) => {
                tracing::warn!("Question oracle failed, using template: {}", e);
                None
            }
        }
    }
}

fn build(
    draft: Option<QuestionDraft>,
    fallback: String,
    category: QuestionCategory,
    priority: QuestionPriority,
    context: QuestionContext,
) -> FollowUpQuestion {
    let (question, category, priority) = match draft {
        Some(d) => (
            d.question.trim().to_string(),
            d.category.unwrap_or(category),
            d.priority.unwrap_or(priority),
        ),
        None => (fallback, category, priority),
    };
    FollowUpQuestion {
        id: uuid::Uuid::new_v4().to_string(),
        question,
        category,
        priority,
        context,
    }
}
