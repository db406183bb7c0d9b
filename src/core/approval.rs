//! 审批门
//!
//! 覆盖在 AgentState 上的状态机：idle → proposed → {approved, modified, aborted}。
//! propose 只记录提案并置 awaiting_approval，随后由调用方持久化并结束本次调用；
//! resolve 在之后的独立调用中携带决定恢复执行。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::{classify_transition, AgentError, AgentState, OrchestratorError, Phase, TransitionKind};
use crate::memory::Message;

/// 推理引擎提出的阶段迁移
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TransitionProposal {
    pub to_phase: Phase,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub planned_actions: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

/// 等待审批的迁移提案
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingTransition {
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub reason: String,
    pub planned_actions: Vec<String>,
    pub risks: Vec<String>,
    pub proposed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Modify,
    Abort,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Modify => "modify",
            ApprovalDecision::Abort => "abort",
        })
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" => Ok(ApprovalDecision::Approve),
            "modify" => Ok(ApprovalDecision::Modify),
            "abort" => Ok(ApprovalDecision::Abort),
            other => Err(format!("unknown approval decision: {other}")),
        }
    }
}

/// resolve 的结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// 迁移已提交，循环在新阶段继续
    Approved { from: Phase, to: Phase },
    /// 迁移丢弃，循环在原阶段继续
    Modified { phase: Phase },
    /// 迁移丢弃，任务结束
    Aborted,
}

impl ApprovalOutcome {
    pub fn resumes_loop(&self) -> bool {
        !matches!(self, ApprovalOutcome::Aborted)
    }
}

pub const ABORTED_BY_USER: &str = "aborted by user";

/// 审批门：无自身状态，所有状态都在 AgentState 上
#[derive(Debug, Default)]
pub struct ApprovalGate;

impl ApprovalGate {
    pub fn new() -> Self {
        Self
    }

    /// 记录向前迁移提案；只接受需要审批的迁移
    pub fn propose(&self, state: &mut AgentState, proposal: &TransitionProposal) -> Result<(), AgentError> {
        let from = state.phase;
        match classify_transition(from, proposal.to_phase)? {
            TransitionKind::RequiresApproval => {}
            TransitionKind::Immediate => {
                return Err(AgentError::InvalidTransition {
                    from,
                    to: proposal.to_phase,
                    reason: "backward transitions do not need approval".into(),
                })
            }
        }
        state.pending_transition = Some(PendingTransition {
            from_phase: from,
            to_phase: proposal.to_phase,
            reason: proposal.reason.clone(),
            planned_actions: proposal.planned_actions.clone(),
            risks: proposal.risks.clone(),
            proposed_at: Utc::now(),
        });
        state.awaiting_approval = true;
        state.touch();
        tracing::info!(
            session = %state.key,
            from = %from,
            to = %proposal.to_phase,
            "phase transition proposed, awaiting approval"
        );
        Ok(())
    }

    /// 处理审批决定；未在等待审批时拒绝且不修改状态
    pub fn resolve(
        &self,
        state: &mut AgentState,
        decision: ApprovalDecision,
        modification: Option<&str>,
    ) -> Result<ApprovalOutcome, OrchestratorError> {
        if !state.awaiting_approval {
            return Err(OrchestratorError::NoPendingApproval);
        }
        let pending = state
            .pending_transition
            .take()
            .ok_or(OrchestratorError::NoPendingApproval)?;
        state.awaiting_approval = false;

        let outcome = match decision {
            ApprovalDecision::Approve => {
                state.commit_phase(pending.to_phase, Utc::now());
                state.conversation.push(Message::system(format!(
                    "The user approved the transition from {} to {}. You are now in the {} phase; \
                     do not request this transition again.",
                    pending.from_phase, pending.to_phase, pending.to_phase
                )));
                ApprovalOutcome::Approved {
                    from: pending.from_phase,
                    to: pending.to_phase,
                }
            }
            ApprovalDecision::Modify => {
                let feedback = modification
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .unwrap_or("Do not change phase yet.");
                state.conversation.push(Message::user(format!(
                    "I did not approve the transition to {}. Stay in the {} phase. My guidance: {}",
                    pending.to_phase, pending.from_phase, feedback
                )));
                ApprovalOutcome::Modified {
                    phase: pending.from_phase,
                }
            }
            ApprovalDecision::Abort => {
                state.conversation.push(Message::user(format!(
                    "I rejected the transition to {} and aborted the task.",
                    pending.to_phase
                )));
                state.complete(ABORTED_BY_USER);
                ApprovalOutcome::Aborted
            }
        };
        state.touch();
        tracing::info!(session = %state.key, decision = %decision, "approval resolved");
        Ok(outcome)
    }
}
