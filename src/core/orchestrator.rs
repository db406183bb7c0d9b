//! 编排器：对外暴露的请求 / 响应面
//!
//! submit / resolve_approval 在同一会话键上串行执行（每键一把互斥锁），不同会话完全独立。
//! 审批协议违例（等待审批时提交新问题、未等待时提交审批决定）在进入循环前同步拒绝，状态不变。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{
    AgentState, ApprovalDecision, ApprovalOutcome, OrchestratorError, PendingTransition, Phase, StepSummary,
    TargetIntel, TodoItem,
};
use crate::react::{LoopController, LoopOutcome, ReactEvent, StopReason};
use crate::session::{SessionKey, SessionLocks, SessionStore};

/// 每次 submit / resolve_approval 返回的快照
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub tenant_id: String,
    pub project_id: String,
    pub session_id: String,
    pub answer: String,
    pub last_tool: Option<String>,
    pub last_tool_output: Option<String>,
    pub phase: Phase,
    pub iteration: u32,
    pub max_iterations: u32,
    pub task_complete: bool,
    pub completion_reason: Option<String>,
    pub todo_list: Vec<TodoItem>,
    pub execution_trace_summary: Vec<StepSummary>,
    pub target_intel: TargetIntel,
    pub awaiting_approval: bool,
    pub pending_transition: Option<PendingTransition>,
    pub error: Option<String>,
}

impl Response {
    pub fn from_state(state: &AgentState, answer: String, error: Option<String>, trace_steps: usize) -> Self {
        let last = state.execution_trace.last_tool();
        Self {
            tenant_id: state.key.tenant_id.clone(),
            project_id: state.key.project_id.clone(),
            session_id: state.key.session_id.clone(),
            answer,
            last_tool: last.and_then(|s| s.tool_name.clone()),
            last_tool_output: last.and_then(|s| s.tool_output.clone().or_else(|| s.error.clone())),
            phase: state.phase,
            iteration: state.iteration,
            max_iterations: state.max_iterations,
            task_complete: state.task_complete,
            completion_reason: state.completion_reason.clone(),
            todo_list: state.todo_list.items().to_vec(),
            execution_trace_summary: state.execution_trace.summarize(trace_steps),
            target_intel: state.target_intel.clone(),
            awaiting_approval: state.awaiting_approval,
            pending_transition: state.pending_transition.clone(),
            error,
        }
    }
}

pub struct Orchestrator {
    controller: LoopController,
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    max_iterations: u32,
    trace_summary_steps: usize,
    events: Option<UnboundedSender<ReactEvent>>,
}

impl Orchestrator {
    pub fn new(
        controller: LoopController,
        store: Arc<dyn SessionStore>,
        max_iterations: u32,
        trace_summary_steps: usize,
    ) -> Self {
        Self {
            controller,
            store,
            locks: SessionLocks::new(),
            max_iterations,
            trace_summary_steps,
            events: None,
        }
    }

    /// 设置进度事件通道（终端前端实时渲染）
    pub fn with_events(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    fn respond(&self, state: &AgentState, outcome: LoopOutcome) -> Response {
        if outcome.stop == StopReason::StoreFailure {
            tracing::error!(session = %state.key, "response built from unsaved state");
        }
        Response::from_state(state, outcome.answer, outcome.error, self.trace_summary_steps)
    }

    /// 提交问题：新会话以此为目标，已有会话继续；等待审批时拒绝
    pub async fn submit(&self, key: &SessionKey, question: &str) -> Result<Response, OrchestratorError> {
        key.validate().map_err(OrchestratorError::InvalidRequest)?;
        let question = question.trim();
        if question.is_empty() {
            return Err(OrchestratorError::InvalidRequest("question must not be empty".into()));
        }

        let _guard = self.locks.acquire(key).await;
        let mut state = self.store.load_or_default(key, self.max_iterations).await?;
        if let Some(p) = state.pending_transition.as_ref().filter(|_| state.awaiting_approval) {
            tracing::warn!(session = %key, "question rejected while awaiting approval");
            return Err(OrchestratorError::AwaitingApproval {
                from: p.from_phase,
                to: p.to_phase,
            });
        }

        tracing::info!(session = %key, chars = question.len(), "question submitted");
        state.accept_question(question);
        let outcome = self.controller.run(&mut state, self.store.as_ref(), self.events.as_ref()).await;
        Ok(self.respond(&state, outcome))
    }

    /// 处理审批决定；approve / modify 后循环继续，abort 结束任务
    pub async fn resolve_approval(
        &self,
        key: &SessionKey,
        decision: ApprovalDecision,
        modification: Option<&str>,
    ) -> Result<Response, OrchestratorError> {
        key.validate().map_err(OrchestratorError::InvalidRequest)?;

        let _guard = self.locks.acquire(key).await;
        let mut state = self
            .store
            .load(key)
            .await?
            .ok_or(OrchestratorError::NoPendingApproval)?;
        let outcome = self.controller.gate().resolve(&mut state, decision, modification)?;
        self.store.save(key, &state).await?;

        let result = if outcome.resumes_loop() {
            if let ApprovalOutcome::Approved { from, to } = outcome {
                if let Some(tx) = &self.events {
                    let _ = tx.send(ReactEvent::PhaseChanged { from, to });
                }
            }
            self.controller.run(&mut state, self.store.as_ref(), self.events.as_ref()).await
        } else {
            LoopOutcome {
                answer: state.completion_reason.clone().unwrap_or_default(),
                error: None,
                stop: StopReason::Completed,
            }
        };
        Ok(self.respond(&state, result))
    }

    /// 丢弃会话并返回一个新的会话键；旧键不会被原地复用
    pub async fn reset(&self, key: &SessionKey) -> Result<SessionKey, OrchestratorError> {
        key.validate().map_err(OrchestratorError::InvalidRequest)?;
        let existed = {
            let _guard = self.locks.acquire(key).await;
            self.store.reset(key).await?
        };
        self.locks.forget(key);
        let fresh = SessionKey::fresh(key.tenant_id.clone(), key.project_id.clone());
        tracing::info!(old = %key, new = %fresh, existed, "session reset");
        Ok(fresh)
    }

    /// 当前会话快照（不推进循环）
    pub async fn snapshot(&self, key: &SessionKey) -> Result<Option<Response>, OrchestratorError> {
        let state = self.store.load(key).await?;
        Ok(state.map(|s| {
            let answer = match (&s.completion_reason, s.awaiting_approval) {
                (_, true) => crate::react::approval_prompt(&s),
                (Some(reason), false) => reason.clone(),
                (None, false) => String::new(),
            };
            Response::from_state(&s, answer, None, self.trace_summary_steps)
        }))
    }

    pub async fn list_sessions(&self, tenant_id: &str, project_id: &str) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.store.list_sessions(tenant_id, project_id).await?)
    }

    pub async fn session_count(&self) -> Result<usize, OrchestratorError> {
        Ok(self.store.count().await?)
    }
}
