//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 ReAct 循环决定是重新提示、记录后继续还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::DecisionParse(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous output could not be parsed as a decision: {raw}. \
                 Respond with exactly one JSON object matching the decision schema, \
                 with no prose or markdown around it. `action` must be one of \
                 use_tool, transition_phase, complete; use_tool requires `tool_name`, \
                 transition_phase requires `phase_transition`."
            )),
            AgentError::PolicyDenied(_)
            | AgentError::UnknownTool(_)
            | AgentError::ToolExecutionFailed { .. }
            | AgentError::ToolTimeout { .. }
            | AgentError::RetriesExhausted { .. }
            | AgentError::InvalidTransition { .. } => RecoveryAction::RecordAndContinue,
            AgentError::Llm(_) | AgentError::Store(_) | AgentError::Config(_) => {
                RecoveryAction::Abort
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Phase;

    #[test]
    fn test_recovery_decision_parse_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::DecisionParse("expected value at line 1".to_string());
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("JSON"));
                assert!(msg.contains("expected value"));
            }
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_policy_denied() {
        let engine = RecoveryEngine::new();
        let err = AgentError::PolicyDenied("tool exploit_console not allowed".to_string());
        assert_eq!(engine.handle(&err), RecoveryAction::RecordAndContinue);
    }

    #[test]
    fn test_recovery_tool_timeout() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ToolTimeout {
            tool: "port_scan".to_string(),
            secs: 5,
        };
        assert_eq!(engine.handle(&err), RecoveryAction::RecordAndContinue);
    }

    #[test]
    fn test_recovery_invalid_transition() {
        let engine = RecoveryEngine::new();
        let err = AgentError::InvalidTransition {
            from: Phase::Informational,
            to: Phase::PostExploitation,
            reason: "skip".to_string(),
        };
        assert_eq!(engine.handle(&err), RecoveryAction::RecordAndContinue);
    }

    #[test]
    fn test_recovery_llm_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Llm("connection refused".to_string());
        assert_eq!(engine.handle(&err), RecoveryAction::Abort);
    }
}
