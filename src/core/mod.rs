//! 核心编排层：阶段状态机、审批门、会话状态与各记录器、错误与恢复、对外编排面

pub mod approval;
pub mod builder;
pub mod error;
pub mod intel;
pub mod orchestrator;
pub mod phase;
pub mod recovery;
pub mod state;
pub mod todo;
pub mod trace;

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalOutcome, PendingTransition, TransitionProposal, ABORTED_BY_USER,
};
pub use builder::OrchestratorBuilder;
pub use error::{AgentError, OrchestratorError, RecoveryAction};
pub use intel::{Credential, TargetIntel, TargetType};
pub use orchestrator::{Orchestrator, Response};
pub use phase::{classify_transition, Phase, PhaseHistoryEntry, TransitionKind};
pub use recovery::RecoveryEngine;
pub use state::AgentState;
pub use todo::{Priority, TodoItem, TodoList, TodoStatus, TodoUpdate};
pub use trace::{ExecutionStep, ExecutionTrace, StepKind, StepSummary};
