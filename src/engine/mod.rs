//! 计划步骤执行引擎
//!
//! - **types**: Plan / Step / ExecutionState 等数据模型
//! - **guards**: 占位符与标识符守卫
//! - **coordinator**: 从前序结果协调参数
//! - **resolver**: 按注册表 schema 校验并补全参数
//! - **error_handler**: 工具失败后的恢复决策
//! - **question**: 面向用户的结构化追问
//! - **validator**: 计划进度评估
//! - **step_executor**: 单步状态机
//! - **runner**: 按序执行整份计划的外层循环

pub mod coordinator;
pub mod error_handler;
pub mod events;
pub mod guards;
pub mod question;
pub mod resolver;
pub mod runner;
pub mod step_executor;
pub mod types;
pub mod validator;

pub use coordinator::{CoordinationOutcome, CoordinationResult, Coordinator};
pub use error_handler::{Adaptation, ErrorDecision, ErrorHandler};
pub use events::ExecutionEvent;
pub use guards::ParameterGuard;
pub use question::QuestionGenerator;
pub use resolver::{ParameterResolver, ValidationFailure};
pub use runner::{PlanRunner, RunOutcome, RunReport};
pub use step_executor::{StepExecutor, StepOutcome};
pub use types::{
    AdaptationRecord, ExecutionResult, ExecutionState, FollowUpQuestion, PartialResult, Plan,
    PlanUpdate, QuestionCategory, QuestionContext, QuestionPriority, RequestContext, Step, StepId,
    StepStatus,
};
pub use validator::{PlanValidationResult, PlanValidator};
