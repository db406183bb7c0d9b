//! 会话状态：AgentState
//!
//! 每个 (tenant, project, session) 三元组持有一个 AgentState。循环控制器、审批门、
//! 各记录器都通过它读写；持久化只是围绕它的一对 load/save。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::approval::PendingTransition;
use crate::core::{ExecutionStep, ExecutionTrace, Phase, PhaseHistoryEntry, TargetIntel, TodoList};
use crate::memory::{Conversation, Message};
use crate::session::SessionKey;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub key: SessionKey,
    pub conversation: Conversation,
    /// 首个问题，作为整个会话的目标
    pub objective: String,

    pub iteration: u32,
    pub max_iterations: u32,

    pub phase: Phase,
    pub phase_history: Vec<PhaseHistoryEntry>,
    pub pending_transition: Option<PendingTransition>,
    pub awaiting_approval: bool,

    pub todo_list: TodoList,
    pub execution_trace: ExecutionTrace,
    pub target_intel: TargetIntel,

    pub task_complete: bool,
    pub completion_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(key: SessionKey, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            key,
            conversation: Conversation::new(),
            objective: String::new(),
            iteration: 0,
            max_iterations,
            phase: Phase::Informational,
            phase_history: vec![PhaseHistoryEntry::open(Phase::Informational, now)],
            pending_transition: None,
            awaiting_approval: false,
            todo_list: TodoList::new(),
            execution_trace: ExecutionTrace::new(),
            target_intel: TargetIntel::default(),
            task_complete: false,
            completion_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 接收一个新问题：首个问题成为目标；已完成的会话重新打开
    pub fn accept_question(&mut self, question: &str) {
        if self.objective.is_empty() {
            self.objective = question.to_string();
        }
        if self.task_complete {
            self.task_complete = false;
            self.completion_reason = None;
        }
        self.conversation.push(Message::user(question));
        self.touch();
    }

    pub fn budget_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    /// 开始新一轮迭代，返回本轮序号
    pub fn begin_iteration(&mut self) -> u32 {
        debug_assert!(self.iteration < self.max_iterations);
        self.iteration += 1;
        self.iteration
    }

    /// 以当前阶段记录本轮的轨迹步骤
    pub fn record_step(&mut self, mut step: ExecutionStep) {
        step.iteration = self.iteration;
        step.phase = self.phase;
        self.execution_trace.record(step);
        self.touch();
    }

    /// 提交阶段迁移：关闭当前历史条目并打开新条目
    pub fn commit_phase(&mut self, to: Phase, at: DateTime<Utc>) {
        if let Some(open) = self.phase_history.iter_mut().rev().find(|e| e.is_open()) {
            open.exited_at = Some(at);
        }
        self.phase_history.push(PhaseHistoryEntry::open(to, at));
        self.phase = to;
        self.touch();
    }

    pub fn complete(&mut self, reason: impl Into<String>) {
        self.task_complete = true;
        self.completion_reason = Some(reason.into());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 校验不变量；违例时返回描述
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.pending_transition.is_some() != self.awaiting_approval {
            return Err("pending_transition must be set iff awaiting_approval".into());
        }
        if self.iteration > self.max_iterations {
            return Err(format!(
                "iteration {} exceeds max_iterations {}",
                self.iteration, self.max_iterations
            ));
        }
        if self.execution_trace.len() as u32 > self.iteration {
            return Err("more trace steps than iterations".into());
        }
        let open: Vec<_> = self.phase_history.iter().filter(|e| e.is_open()).collect();
        match open.as_slice() {
            [only] if only.phase == self.phase => {}
            _ => return Err("exactly one open phase_history entry matching phase".into()),
        }
        for pair in self.phase_history.windows(2) {
            match pair[0].exited_at {
                Some(exit) if exit >= pair[0].entered_at && pair[1].entered_at >= exit => {}
                _ => return Err("phase_history entries overlap or are out of order".into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StepKind;

    fn state() -> AgentState {
        AgentState::new(SessionKey::new("u1", "p1", "s1"), 5)
    }

    #[test]
    fn test_fresh_state() {
        let s = state();
        assert_eq!(s.phase, Phase::Informational);
        assert_eq!(s.phase_history.len(), 1);
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn test_commit_phase_closes_history() {
        let mut s = state();
        s.commit_phase(Phase::Exploitation, Utc::now());
        assert_eq!(s.phase, Phase::Exploitation);
        assert!(s.phase_history[0].exited_at.is_some());
        assert!(s.phase_history[1].is_open());
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn test_record_step_stamps_phase_and_iteration() {
        let mut s = state();
        s.begin_iteration();
        s.record_step(ExecutionStep::new(0, Phase::PostExploitation, StepKind::Tool, "t"));
        let step = s.execution_trace.last().unwrap();
        assert_eq!(step.iteration, 1);
        assert_eq!(step.phase, Phase::Informational);
    }

    #[test]
    fn test_accept_question_reopens() {
        let mut s = state();
        s.accept_question("first");
        s.complete("done");
        s.accept_question("second");
        assert_eq!(s.objective, "first");
        assert!(!s.task_complete);
        assert!(s.completion_reason.is_none());
        assert_eq!(s.conversation.len(), 2);
    }

    #[test]
    fn test_invariant_violation_detected() {
        let mut s = state();
        s.awaiting_approval = true;
        assert!(s.check_invariants().is_err());
    }
}
