//! 认知层：推理引擎与决策解析、上下文组装、决策应用、ReAct 主循环

pub mod context;
pub mod events;
pub mod loop_;
pub mod planner;
pub mod step;

pub use context::{ContextBuilder, DEFAULT_SYSTEM_PROMPT};
pub use events::ReactEvent;
pub use loop_::{approval_prompt, LoopController, LoopOutcome, StopReason};
pub use planner::{
    extract_json_block, parse_decision, ActionKind, Decision, DecisionAction, Planner, RawDecision,
    ReasoningContext, ReasoningEngine,
};
pub use step::{apply_decision, StepEffect};
