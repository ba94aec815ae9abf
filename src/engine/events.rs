//! 执行过程事件：供时间线 / SSE 等前端展示协调、调用、恢复与进度

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::engine::StepStatus;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    StepStarted {
        step_id: String,
        order: u32,
        action: String,
    },
    /// 参数协调完成（updated 表示参数被改写）
    Coordinated { step_id: String, updated: bool },
    ToolCall {
        tool: String,
        args: serde_json::Value,
        attempt: u32,
    },
    ToolFailure {
        tool: String,
        reason: String,
        attempt: u32,
    },
    /// 错误恢复决策（retry / adapt / ask-user / skip）
    Recovery { decision: String, detail: String },
    Question { question: String },
    StepFinished {
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
    },
    ProgressValidated {
        progress: f64,
        should_continue: bool,
    },
}

pub(crate) fn send_event(tx: &Option<UnboundedSender<ExecutionEvent>>, ev: ExecutionEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
