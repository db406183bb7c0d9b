//! ReAct 主循环（Loop Controller）
//!
//! Think -> Route -> [Act | Propose | Complete]，直到任务完成、出现待审批的迁移或迭代预算耗尽。
//! 每轮 iteration 恰好加一、轨迹恰好追加一步；每轮结束后写检查点。
//! 可选 event_tx：向终端 / Web 前端推送 StepUpdate / ToolCall / Observation 等事件。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::core::{AgentError, AgentState, ApprovalGate, RecoveryAction, RecoveryEngine, StepKind};
use crate::react::step::{apply_decision, record_failure, record_tool_outcome, StepEffect};
use crate::react::{ContextBuilder, Decision, ReactEvent, ReasoningContext, ReasoningEngine};
use crate::session::SessionStore;
use crate::tools::ToolDispatcher;

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 思考内容展示最大字符数
const THINKING_PREVIEW_CHARS: usize = 800;

/// 本次调用为何停止
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    AwaitingApproval,
    BudgetExhausted,
    /// 推理引擎传输失败
    EngineFailure,
    /// 检查点写入失败
    StoreFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub answer: String,
    pub error: Option<String>,
    pub stop: StopReason,
}

fn send_event(tx: Option<&UnboundedSender<ReactEvent>>, ev: ReactEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(ev);
    }
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 审批提示文本
pub fn approval_prompt(state: &AgentState) -> String {
    match &state.pending_transition {
        Some(p) => {
            let mut text = format!(
                "Approval required: transition from {} to {}.\nReason: {}",
                p.from_phase, p.to_phase, p.reason
            );
            if !p.planned_actions.is_empty() {
                text.push_str(&format!("\nPlanned actions:\n- {}", p.planned_actions.join("\n- ")));
            }
            if !p.risks.is_empty() {
                text.push_str(&format!("\nRisks:\n- {}", p.risks.join("\n- ")));
            }
            text.push_str("\nReply with approve, modify (with guidance) or abort.");
            text
        }
        None => String::new(),
    }
}

fn budget_summary(state: &AgentState) -> String {
    format!(
        "Iteration budget exhausted after {} iterations; the objective may be only partially complete.\n\n\
         Todo list:\n{}\n\nKnown target information:\n{}",
        state.iteration,
        state.todo_list.render(),
        state.target_intel.render()
    )
}

pub struct LoopController {
    engine: Arc<dyn ReasoningEngine>,
    dispatcher: Arc<ToolDispatcher>,
    context: ContextBuilder,
    gate: ApprovalGate,
    recovery: RecoveryEngine,
}

impl LoopController {
    pub fn new(engine: Arc<dyn ReasoningEngine>, dispatcher: Arc<ToolDispatcher>, context: ContextBuilder) -> Self {
        Self {
            engine,
            dispatcher,
            context,
            gate: ApprovalGate::new(),
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    /// 推理一次；解析失败时带纠正提示在同一轮重试一次
    async fn decide(&self, ctx: &ReasoningContext) -> Result<Decision, AgentError> {
        match self.engine.decide(ctx).await {
            Err(e) => match self.recovery.handle(&e) {
                RecoveryAction::RetryWithPrompt(hint) => {
                    tracing::warn!("decision parse failed, re-prompting once: {e}");
                    self.engine.decide(&ctx.clone().with_hint(hint)).await
                }
                _ => Err(e),
            },
            ok => ok,
        }
    }

    async fn checkpoint(&self, state: &AgentState, store: &dyn SessionStore) -> Result<(), String> {
        store.save(&state.key, state).await.map_err(|e| {
            tracing::error!(session = %state.key, "checkpoint failed: {e}");
            e.to_string()
        })
    }

    /// 运行循环直到停止条件；state 在每轮后写入 store
    pub async fn run(
        &self,
        state: &mut AgentState,
        store: &dyn SessionStore,
        event_tx: Option<&UnboundedSender<ReactEvent>>,
    ) -> LoopOutcome {
        loop {
            if state.task_complete {
                let answer = state.completion_reason.clone().unwrap_or_default();
                send_event(event_tx, ReactEvent::Completed { summary: answer.clone() });
                return self.finish(state, store, answer, None, StopReason::Completed).await;
            }
            if state.awaiting_approval {
                return self
                    .finish(state, store, approval_prompt(state), None, StopReason::AwaitingApproval)
                    .await;
            }
            if state.budget_exhausted() {
                let summary = budget_summary(state);
                tracing::warn!(session = %state.key, iteration = state.iteration, "iteration budget exhausted");
                state.complete(format!(
                    "iteration budget exhausted ({}/{})",
                    state.iteration, state.max_iterations
                ));
                send_event(event_tx, ReactEvent::Completed { summary: summary.clone() });
                return self.finish(state, store, summary, None, StopReason::BudgetExhausted).await;
            }

            let iteration = state.begin_iteration();
            tracing::info!(
                session = %state.key,
                iteration,
                phase = %state.phase,
                "react iteration"
            );
            send_event(
                event_tx,
                ReactEvent::StepUpdate {
                    iteration,
                    max_iterations: state.max_iterations,
                    phase: state.phase,
                },
            );

            let ctx = self
                .context
                .build(state, &self.dispatcher.tools_for_phase(state.phase));
            send_event(event_tx, ReactEvent::Thinking);
            let decision = match self.decide(&ctx).await {
                Ok(d) => d,
                Err(e) => match self.recovery.handle(&e) {
                    RecoveryAction::Abort => {
                        record_failure(state, StepKind::EngineFailure, &e);
                        send_event(event_tx, ReactEvent::Error { text: e.to_string() });
                        let answer = format!("The reasoning engine failed: {e}");
                        return self
                            .finish(state, store, answer, Some(e.to_string()), StopReason::EngineFailure)
                            .await;
                    }
                    action => {
                        record_failure(state, StepKind::ParseFailure, &e);
                        send_event(
                            event_tx,
                            ReactEvent::Recovery {
                                action: format!("{action:?}"),
                                detail: e.to_string(),
                            },
                        );
                        if let Err(err) = self.checkpoint(state, store).await {
                            return self.store_failure(state, err);
                        }
                        continue;
                    }
                },
            };
            send_event(
                event_tx,
                ReactEvent::ThinkingContent {
                    text: preview(&decision.thought, THINKING_PREVIEW_CHARS),
                },
            );

            match apply_decision(state, &self.gate, &decision) {
                StepEffect::Dispatch { tool, args } => {
                    send_event(
                        event_tx,
                        ReactEvent::ToolCall {
                            tool: tool.clone(),
                            args: args.clone(),
                        },
                    );
                    let outcome = self
                        .dispatcher
                        .dispatch(&tool, args.clone(), state.phase, &state.key)
                        .await;
                    if outcome.denied {
                        send_event(
                            event_tx,
                            ReactEvent::PolicyDenied {
                                tool: tool.clone(),
                                reason: outcome.error.clone().unwrap_or_default(),
                            },
                        );
                    }
                    send_event(
                        event_tx,
                        ReactEvent::Observation {
                            tool: tool.clone(),
                            success: outcome.success,
                            preview: preview(&outcome.observation(), OBSERVATION_PREVIEW_CHARS),
                        },
                    );
                    record_tool_outcome(state, &decision, args, &outcome);
                }
                StepEffect::PhaseChanged { from, to } => {
                    send_event(event_tx, ReactEvent::PhaseChanged { from, to });
                }
                StepEffect::AwaitingApproval { from, to, reason } => {
                    send_event(event_tx, ReactEvent::ApprovalRequested { from, to, reason });
                }
                StepEffect::TransitionRejected { error } => {
                    send_event(event_tx, ReactEvent::Error { text: error });
                }
                StepEffect::Completed { .. } => {}
            }

            if let Err(err) = self.checkpoint(state, store).await {
                return self.store_failure(state, err);
            }
        }
    }

    async fn finish(
        &self,
        state: &AgentState,
        store: &dyn SessionStore,
        answer: String,
        error: Option<String>,
        stop: StopReason,
    ) -> LoopOutcome {
        if let Err(err) = self.checkpoint(state, store).await {
            return self.store_failure(state, err);
        }
        LoopOutcome { answer, error, stop }
    }

    fn store_failure(&self, state: &AgentState, err: String) -> LoopOutcome {
        LoopOutcome {
            answer: format!("Session state could not be saved at iteration {}.", state.iteration),
            error: Some(err),
            stop: StopReason::StoreFailure,
        }
    }
}
