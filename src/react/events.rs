//! ReAct 过程事件：推送给终端 / Web 前端展示进度

use serde::Serialize;

use crate::core::Phase;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 第几轮迭代
    StepUpdate { iteration: u32, max_iterations: u32, phase: Phase },
    /// 正在调用推理引擎
    Thinking,
    /// 推理引擎的思考内容（预览）
    ThinkingContent { text: String },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        success: bool,
        preview: String,
    },
    /// 策略拒绝
    PolicyDenied { tool: String, reason: String },
    PhaseChanged { from: Phase, to: Phase },
    ApprovalRequested {
        from: Phase,
        to: Phase,
        reason: String,
    },
    /// 错误恢复动作
    Recovery { action: String, detail: String },
    Completed { summary: String },
    Error { text: String },
}
