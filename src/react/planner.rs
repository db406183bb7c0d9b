//! Planner：推理引擎与决策解析
//!
//! 推理引擎视为纯函数 context → Decision。LLM 的回复必须是一个 JSON 对象（可包在 ```json 代码块中），
//! parse_decision 取出最外层 `{...}`，反序列化为 RawDecision，再校验为类型化的 Decision：
//! use_tool 缺 tool_name、transition_phase 缺 phase_transition 都是解析失败。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, TargetIntel, TodoUpdate, TransitionProposal};
use crate::llm::LlmClient;
use crate::memory::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    UseTool,
    TransitionPhase,
    Complete,
}

/// 推理引擎输出的 JSON 结构（用于解析与 Schema 生成）
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct RawDecision {
    /// 对当前局面的思考
    #[serde(default)]
    pub thought: String,
    /// 选择该动作的理由
    #[serde(default)]
    pub reasoning: String,
    pub action: ActionKind,
    /// action = use_tool 时必填
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_args: Option<Value>,
    /// action = transition_phase 时必填
    #[serde(default)]
    pub phase_transition: Option<TransitionProposal>,
    /// action = complete 时的最终总结
    #[serde(default)]
    pub completion_reason: Option<String>,
    /// 完整的更新后待办清单
    #[serde(default)]
    pub updated_todo_list: Vec<TodoUpdate>,
    /// 本步新发现的目标情报（只写新增部分）
    #[serde(default)]
    pub target_intel: Option<TargetIntel>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecisionAction {
    UseTool { name: String, args: Value },
    TransitionPhase(TransitionProposal),
    Complete { summary: String },
}

/// 校验后的决策
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub thought: String,
    pub reasoning: String,
    pub action: DecisionAction,
    pub todo_updates: Vec<TodoUpdate>,
    pub intel: Option<TargetIntel>,
}

impl TryFrom<RawDecision> for Decision {
    type Error = AgentError;

    fn try_from(raw: RawDecision) -> Result<Self, Self::Error> {
        let action = match raw.action {
            ActionKind::UseTool => {
                let name = raw
                    .tool_name
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| AgentError::DecisionParse("action use_tool requires tool_name".into()))?;
                let args = match raw.tool_args {
                    Some(Value::Null) | None => Value::Object(Default::default()),
                    Some(v) => v,
                };
                DecisionAction::UseTool { name, args }
            }
            ActionKind::TransitionPhase => DecisionAction::TransitionPhase(raw.phase_transition.ok_or_else(|| {
                AgentError::DecisionParse("action transition_phase requires phase_transition".into())
            })?),
            ActionKind::Complete => DecisionAction::Complete {
                summary: raw
                    .completion_reason
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| raw.thought.clone()),
            },
        };
        Ok(Decision {
            thought: raw.thought,
            reasoning: raw.reasoning,
            action,
            todo_updates: raw.updated_todo_list,
            intel: raw.target_intel.filter(|i| !i.is_empty()),
        })
    }
}

/// 从文本中取出 JSON 对象：优先 ```json 代码块，否则最外层花括号
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let scope = match trimmed.find("```json") {
        Some(start) => {
            let rest = &trimmed[start + 7..];
            rest.find("```").map(|end| &rest[..end]).unwrap_or(rest)
        }
        None => trimmed,
    };
    let start = scope.find('{')?;
    let end = scope.rfind('}')?;
    (end > start).then(|| &scope[start..=end])
}

pub fn parse_decision(output: &str) -> Result<Decision, AgentError> {
    let json = extract_json_block(output)
        .ok_or_else(|| AgentError::DecisionParse("no JSON object found in reply".into()))?;
    let raw: RawDecision =
        serde_json::from_str(json).map_err(|e| AgentError::DecisionParse(e.to_string()))?;
    Decision::try_from(raw)
}

/// 一次推理调用的输入
#[derive(Clone, Debug, Default)]
pub struct ReasoningContext {
    pub system: String,
    pub messages: Vec<Message>,
}

impl ReasoningContext {
    /// 追加一条纠正提示（解析失败后的同轮重试）
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.messages.push(Message::user(hint));
        self
    }
}

/// 推理引擎：context → Decision；解析失败返回 DecisionParse，传输失败返回 Llm
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn decide(&self, ctx: &ReasoningContext) -> Result<Decision, AgentError>;
}

/// 基于 LLM 的推理引擎
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}

#[async_trait]
impl ReasoningEngine for Planner {
    async fn decide(&self, ctx: &ReasoningContext) -> Result<Decision, AgentError> {
        let mut full = Vec::with_capacity(ctx.messages.len() + 1);
        full.push(Message::system(ctx.system.clone()));
        full.extend(ctx.messages.iter().cloned());
        let reply = self.llm.complete(&full).await.map_err(AgentError::Llm)?;
        tracing::debug!(chars = reply.len(), "reasoning reply");
        parse_decision(&reply)
    }
}
