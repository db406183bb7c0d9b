//! Agent 错误类型与恢复动作
//!
//! 循环内部错误（AgentError）由 RecoveryEngine 映射为 RecoveryAction：重试提示、记录后继续或终止。
//! 对外边界错误（OrchestratorError）同步返回给调用方，不进入循环。

use thiserror::Error;

use crate::core::Phase;
use crate::session::StoreError;

/// ReAct 循环内部错误；除 Llm / Store 外都在循环内被吸收为失败的轨迹步骤
#[derive(Error, Debug)]
pub enum AgentError {
    /// 工具不允许在当前阶段运行（策略拒绝，可自我纠正）
    #[error("{0}")]
    PolicyDenied(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecutionFailed { tool: String, message: String },

    #[error("Tool timeout: {tool} after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("Tool {tool} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        tool: String,
        attempts: u32,
        last_error: String,
    },

    /// 推理引擎输出无法解析为 Decision
    #[error("Decision parse error: {0}")]
    DecisionParse(String),

    #[error("Invalid phase transition {from} -> {to}: {reason}")]
    InvalidTransition { from: Phase, to: Phase, reason: String },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示注入同一轮，让推理引擎重新输出（仅一次）
    RetryWithPrompt(String),
    /// 记录为失败步骤并进入下一轮，错误对下一次推理可见
    RecordAndContinue,
    /// 终止本次调用，错误写入 Response.error
    Abort,
}

/// 对外暴露面的错误：审批协议违例、请求校验失败、存储失败
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("session is awaiting approval for {from} -> {to}; resolve it with approve, modify or abort")]
    AwaitingApproval { from: Phase, to: Phase },

    #[error("no phase transition is awaiting approval for this session")]
    NoPendingApproval,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// 是否属于审批协议违例（HTTP 层映射为 409）
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            OrchestratorError::AwaitingApproval { .. } | OrchestratorError::NoPendingApproval
        )
    }
}
