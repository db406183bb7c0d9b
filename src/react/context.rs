//! 推理上下文组装
//!
//! 每轮从 AgentState 组装一次：基础提示词 + 当前阶段与可用工具 + 目标与进度 +
//! 轨迹尾部 + 待办清单 + 目标情报 + 决策格式 Schema；消息部分是对话窗口。

use serde_json::Value;

use crate::core::{AgentState, Phase};
use crate::react::ReasoningContext;
use crate::tools::decision_schema_json;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous penetration testing assistant working in a \
reason-act-observe loop. Each turn you think about what is known, pick exactly one action, and update \
your todo list. The reconnaissance graph is your primary source of truth: query it before running \
any scan, and use network probes only to verify or refresh what the graph says. Never act outside \
the current phase: if a tool you need is not listed below, request a phase transition instead. \
Forward phase transitions are reviewed by a human operator before they take effect.";

fn phase_guidance(phase: Phase) -> &'static str {
    match phase {
        Phase::Informational => {
            "Gather intelligence and confirm vulnerabilities. When a vulnerability is confirmed and \
             the user wants it exploited, request a transition to exploitation."
        }
        Phase::Exploitation => {
            "Exploit the confirmed vulnerability with the exploitation console. Do not request this \
             phase again. Once a session is open, you may request post_exploitation."
        }
        Phase::PostExploitation => {
            "Interact with open sessions: enumerate the host, collect evidence, and report. \
             Retreat to an earlier phase if the session is lost."
        }
    }
}

/// 上下文组装器；参数来自 [agent] 配置
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    base_prompt: String,
    trace_steps: usize,
    conversation_window: usize,
    schema: String,
}

impl ContextBuilder {
    pub fn new(base_prompt: impl Into<String>, trace_steps: usize, conversation_window: usize) -> Self {
        Self {
            base_prompt: base_prompt.into(),
            trace_steps,
            conversation_window,
            schema: decision_schema_json(),
        }
    }

    /// tools：当前阶段可用工具的 (name, description, parameters_schema)
    pub fn build(&self, state: &AgentState, tools: &[(String, String, Value)]) -> ReasoningContext {
        let tool_lines = if tools.is_empty() {
            "No tools are available in this phase.".to_string()
        } else {
            tools
                .iter()
                .map(|(name, desc, schema)| format!("- {name}: {desc}\n  args schema: {schema}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let trace = if state.execution_trace.is_empty() {
            "No steps yet.".to_string()
        } else {
            state.execution_trace.render_tail(self.trace_steps)
        };

        let system = format!(
            "{base}\n\n\
             ## Current phase: {phase}\n{guidance}\n\n\
             ## Available tools\n{tools}\n\n\
             ## Objective\n{objective}\n\n\
             ## Progress\nIteration {iteration}/{max}\n\n\
             ## Recent steps\n{trace}\n\n\
             ## Todo list\n{todo}\n\n\
             ## Known target information\n{intel}\n\n\
             ## Response format\n\
             Reply with exactly one JSON object matching this schema. Always include the full \
             updated todo list.\n{schema}",
            base = self.base_prompt,
            phase = state.phase,
            guidance = phase_guidance(state.phase),
            tools = tool_lines,
            objective = if state.objective.is_empty() { "(none)" } else { state.objective.as_str() },
            iteration = state.iteration,
            max = state.max_iterations,
            trace = trace,
            todo = state.todo_list.render(),
            intel = state.target_intel.render(),
            schema = self.schema,
        );

        ReasoningContext {
            system,
            messages: state.conversation.window(self.conversation_window),
        }
    }
}
