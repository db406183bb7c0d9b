//! 执行轨迹记录
//!
//! 每一轮迭代恰好追加一个 ExecutionStep；只追加、不改写，按 iteration 全序。
//! 供 prompt 渲染的「最近 N 步」是读取时计算的投影。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Phase;

/// 单步的种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Tool,
    Transition,
    Completion,
    ParseFailure,
    EngineFailure,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_id: String,
    pub iteration: u32,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub kind: StepKind,
    pub thought: String,
    pub reasoning: String,
    pub tool_name: Option<String>,
    pub tool_args: Option<serde_json::Value>,
    pub tool_output: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl ExecutionStep {
    pub fn new(iteration: u32, phase: Phase, kind: StepKind, thought: impl Into<String>) -> Self {
        Self {
            step_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            iteration,
            phase,
            timestamp: Utc::now(),
            kind,
            thought: thought.into(),
            reasoning: String::new(),
            tool_name: None,
            tool_args: None,
            tool_output: None,
            success: true,
            error: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, args: serde_json::Value) -> Self {
        self.tool_name = Some(name.into());
        self.tool_args = Some(args);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.tool_output = Some(output.into());
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Response 中携带的步骤摘要
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub iteration: u32,
    pub phase: Phase,
    pub kind: StepKind,
    pub thought: String,
    pub tool_name: Option<String>,
    pub success: bool,
    pub output_summary: String,
}

/// 只追加的执行轨迹
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    steps: Vec<ExecutionStep>,
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一步；iteration 必须严格大于上一步
    pub fn record(&mut self, step: ExecutionStep) {
        debug_assert!(
            self.steps.last().map_or(true, |last| last.iteration < step.iteration),
            "execution trace must be ordered by iteration"
        );
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&ExecutionStep> {
        self.steps.last()
    }

    pub fn tail(&self, n: usize) -> &[ExecutionStep] {
        &self.steps[self.steps.len().saturating_sub(n)..]
    }

    /// 最近一次工具调用（名称与输出）
    pub fn last_tool(&self) -> Option<&ExecutionStep> {
        self.steps.iter().rev().find(|s| s.tool_name.is_some())
    }

    /// 渲染最近 n 步，供推理上下文使用
    pub fn render_tail(&self, n: usize) -> String {
        if self.steps.is_empty() {
            return "No steps executed yet.".to_string();
        }
        let mut lines = Vec::new();
        for step in self.tail(n) {
            let status = if step.success { "OK" } else { "FAILED" };
            lines.push(format!("Step {} [{}] - {}", step.iteration, step.phase, status));
            lines.push(format!("  Thought: {}", clip(&step.thought, 100)));
            if let Some(tool) = &step.tool_name {
                lines.push(format!("  Tool: {tool}"));
            }
            if let Some(err) = &step.error {
                lines.push(format!("  Error: {}", clip(err, 300)));
            } else if let Some(out) = &step.tool_output {
                lines.push(format!("  Result: {}", clip(out, 300)));
            }
        }
        lines.join("\n")
    }

    pub fn summarize(&self, n: usize) -> Vec<StepSummary> {
        self.tail(n)
            .iter()
            .map(|s| StepSummary {
                iteration: s.iteration,
                phase: s.phase,
                kind: s.kind,
                thought: clip(&s.thought, 200),
                tool_name: s.tool_name.clone(),
                success: s.success,
                output_summary: clip(
                    s.error.as_deref().or(s.tool_output.as_deref()).unwrap_or(""),
                    200,
                ),
            })
            .collect()
    }
}
