//! 决策应用
//!
//! apply_decision 把一个 Decision 作用到 AgentState 上：先合并待办与情报，再按动作分流。
//! 非工具动作在这里直接记录本轮轨迹步骤（在阶段变化之前记录，保证步骤阶段等于记录时的阶段）；
//! 工具动作返回 Dispatch，由循环调度后调用 record_tool_outcome 记录。

use chrono::Utc;
use serde_json::Value;

use crate::core::{
    classify_transition, AgentError, AgentState, ApprovalGate, ExecutionStep, Phase, StepKind, TransitionKind,
};
use crate::memory::Message;
use crate::react::{Decision, DecisionAction};
use crate::tools::ToolOutcome;

/// 决策作用后的效果，循环据此决定下一步
#[derive(Debug, Clone, PartialEq)]
pub enum StepEffect {
    /// 需要调度工具
    Dispatch { tool: String, args: Value },
    /// 向后迁移，立即生效
    PhaseChanged { from: Phase, to: Phase },
    /// 向前迁移已提出，等待审批
    AwaitingApproval { from: Phase, to: Phase, reason: String },
    /// 迁移请求被拒绝，本轮记为失败步骤
    TransitionRejected { error: String },
    Completed { summary: String },
}

fn base_step(state: &AgentState, decision: &Decision, kind: StepKind) -> ExecutionStep {
    ExecutionStep::new(state.iteration, state.phase, kind, decision.thought.clone())
        .with_reasoning(decision.reasoning.clone())
}

pub fn apply_decision(state: &mut AgentState, gate: &ApprovalGate, decision: &Decision) -> StepEffect {
    state.todo_list.merge(&decision.todo_updates, Utc::now());
    if let Some(intel) = &decision.intel {
        state.target_intel.merge(intel);
    }

    match &decision.action {
        DecisionAction::UseTool { name, args } => StepEffect::Dispatch {
            tool: name.clone(),
            args: args.clone(),
        },
        DecisionAction::TransitionPhase(proposal) => {
            let from = state.phase;
            let to = proposal.to_phase;
            let step = base_step(state, decision, StepKind::Transition);
            let summary = format!("{from} -> {to}: {}", proposal.reason);
            state.conversation.push(Message::assistant(format!(
                "{}\nRequesting phase transition {summary}",
                decision.thought
            )));

            match classify_transition(from, to) {
                Ok(TransitionKind::Immediate) => {
                    state.record_step(step.with_output(format!("phase changed {summary}")));
                    state.commit_phase(to, Utc::now());
                    tracing::info!(session = %state.key, from = %from, to = %to, "phase changed");
                    StepEffect::PhaseChanged { from, to }
                }
                Ok(TransitionKind::RequiresApproval) => {
                    state.record_step(step.with_output(format!("approval requested {summary}")));
                    match gate.propose(state, proposal) {
                        Ok(()) => StepEffect::AwaitingApproval {
                            from,
                            to,
                            reason: proposal.reason.clone(),
                        },
                        Err(e) => reject(state, e),
                    }
                }
                Err(e) => {
                    state.record_step(step.failed(e.to_string()));
                    reject(state, e)
                }
            }
        }
        DecisionAction::Complete { summary } => {
            state.record_step(base_step(state, decision, StepKind::Completion).with_output(summary.clone()));
            state.conversation.push(Message::assistant(summary.clone()));
            state.complete(summary.clone());
            StepEffect::Completed {
                summary: summary.clone(),
            }
        }
    }
}

fn reject(state: &mut AgentState, err: AgentError) -> StepEffect {
    let error = err.to_string();
    state
        .conversation
        .push(Message::user(format!("Transition rejected: {error}")));
    tracing::warn!(session = %state.key, "{error}");
    StepEffect::TransitionRejected { error }
}

/// 记录一次工具调度的结果：轨迹步骤、情报合并、对话中的观察
pub fn record_tool_outcome(state: &mut AgentState, decision: &Decision, args: Value, outcome: &ToolOutcome) {
    let mut step = base_step(state, decision, StepKind::Tool).with_tool(outcome.tool.clone(), args.clone());
    if let Some(out) = &outcome.output {
        step = step.with_output(out.clone());
    }
    if !outcome.success {
        step = step.failed(outcome.error.clone().unwrap_or_else(|| "tool failed".into()));
    }
    state.record_step(step);

    if let Some(intel) = &outcome.intel {
        state.target_intel.merge(intel);
    }
    state.conversation.push(Message::assistant(format!(
        "{}\nAction: {} {}",
        decision.thought, outcome.tool, args
    )));
    state.conversation.push(Message::user(format!(
        "Observation from {}: {}",
        outcome.tool,
        outcome.observation()
    )));
}

/// 记录一轮失败（解析失败 / 推理引擎失败），错误对下一次推理可见
pub fn record_failure(state: &mut AgentState, kind: StepKind, err: &AgentError) {
    let step = ExecutionStep::new(state.iteration, state.phase, kind, "").failed(err.to_string());
    state.record_step(step);
    if kind == StepKind::ParseFailure {
        state.conversation.push(Message::user(format!(
            "Your previous reply could not be used: {err}. Reply with one JSON object in the required format."
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TargetIntel, TodoUpdate, TransitionProposal};
    use crate::session::SessionKey;

    fn state() -> AgentState {
        let mut s = AgentState::new(SessionKey::new("u", "p", "s"), 10);
        s.accept_question("pwn 10.0.0.5");
        s.begin_iteration();
        s
    }

    fn decision(action: DecisionAction) -> Decision {
        Decision {
            thought: "thinking".into(),
            reasoning: String::new(),
            action,
            todo_updates: vec![TodoUpdate {
                description: "find CVE".into(),
                ..Default::default()
            }],
            intel: Some(TargetIntel {
                ports: vec![443],
                ..Default::default()
            }),
        }
    }

    fn transition(to: Phase) -> DecisionAction {
        DecisionAction::TransitionPhase(TransitionProposal {
            to_phase: to,
            reason: "confirmed".into(),
            planned_actions: vec![],
            risks: vec![],
        })
    }

    #[test]
    fn test_use_tool_defers_recording() {
        let mut s = state();
        let d = decision(DecisionAction::UseTool {
            name: "query_graph".into(),
            args: serde_json::json!({}),
        });
        let effect = apply_decision(&mut s, &ApprovalGate::new(), &d);
        assert!(matches!(effect, StepEffect::Dispatch { .. }));
        assert!(s.execution_trace.is_empty());
        assert_eq!(s.todo_list.len(), 1);
        assert_eq!(s.target_intel.ports, vec![443]);
    }

    #[test]
    fn test_forward_transition_proposes() {
        let mut s = state();
        let effect = apply_decision(&mut s, &ApprovalGate::new(), &decision(transition(Phase::Exploitation)));
        assert!(matches!(effect, StepEffect::AwaitingApproval { to: Phase::Exploitation, .. }));
        assert!(s.awaiting_approval);
        assert_eq!(s.phase, Phase::Informational);
        assert_eq!(s.execution_trace.len(), 1);
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn test_backward_transition_records_old_phase() {
        let mut s = state();
        s.commit_phase(Phase::Exploitation, Utc::now());
        let effect = apply_decision(&mut s, &ApprovalGate::new(), &decision(transition(Phase::Informational)));
        assert_eq!(
            effect,
            StepEffect::PhaseChanged {
                from: Phase::Exploitation,
                to: Phase::Informational
            }
        );
        assert_eq!(s.phase, Phase::Informational);
        assert_eq!(s.execution_trace.last().unwrap().phase, Phase::Exploitation);
        assert!(!s.awaiting_approval);
    }

    #[test]
    fn test_skip_transition_rejected_without_phase_change() {
        let mut s = state();
        let effect = apply_decision(&mut s, &ApprovalGate::new(), &decision(transition(Phase::PostExploitation)));
        assert!(matches!(effect, StepEffect::TransitionRejected { .. }));
        assert_eq!(s.phase, Phase::Informational);
        assert!(!s.awaiting_approval);
        assert!(!s.execution_trace.last().unwrap().success);
    }

    #[test]
    fn test_complete_sets_flag() {
        let mut s = state();
        let effect = apply_decision(
            &mut s,
            &ApprovalGate::new(),
            &decision(DecisionAction::Complete {
                summary: "port 443 runs Apache 2.4.49".into(),
            }),
        );
        assert!(matches!(effect, StepEffect::Completed { .. }));
        assert!(s.task_complete);
        assert_eq!(s.completion_reason.as_deref(), Some("port 443 runs Apache 2.4.49"));
    }

    #[test]
    fn test_record_tool_outcome_failure() {
        let mut s = state();
        let d = decision(DecisionAction::UseTool {
            name: "exploit_console".into(),
            args: serde_json::json!({"command": "sessions -l"}),
        });
        let outcome = ToolOutcome {
            tool: "exploit_console".into(),
            success: false,
            output: None,
            error: Some("tool exploit_console not allowed in phase informational".into()),
            attempts: 0,
            truncated: false,
            denied: true,
            intel: None,
        };
        record_tool_outcome(&mut s, &d, serde_json::json!({"command": "sessions -l"}), &outcome);
        let step = s.execution_trace.last().unwrap();
        assert!(!step.success);
        assert_eq!(step.tool_name.as_deref(), Some("exploit_console"));
        assert!(s.conversation.messages().last().unwrap().content.contains("not allowed"));
    }
}
