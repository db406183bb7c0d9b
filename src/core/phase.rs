//! 阶段状态机
//!
//! 三阶段生命周期：informational（初始）→ exploitation → post_exploitation。
//! 向前推进必须经审批门（ApprovalGate）；向后退回立即生效；跳过 exploitation 直接进入
//! post_exploitation 是校验错误，不修改任何状态。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 生命周期阶段：决定哪些工具可被调用
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Informational,
    Exploitation,
    PostExploitation,
}

impl Phase {
    pub const ALL: [Phase; 3] = [
        Phase::Informational,
        Phase::Exploitation,
        Phase::PostExploitation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Informational => "informational",
            Phase::Exploitation => "exploitation",
            Phase::PostExploitation => "post_exploitation",
        }
    }

    /// 阶段序号，越大权限越高
    fn rank(&self) -> u8 {
        match self {
            Phase::Informational => 0,
            Phase::Exploitation => 1,
            Phase::PostExploitation => 2,
        }
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Informational
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "informational" => Ok(Phase::Informational),
            "exploitation" => Ok(Phase::Exploitation),
            "post_exploitation" | "post-exploitation" => Ok(Phase::PostExploitation),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// 合法迁移的种类
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionKind {
    /// 退回低权限阶段：同一次调用内立即生效
    Immediate,
    /// 进入高权限阶段：必须经审批门
    RequiresApproval,
}

/// 按迁移矩阵判定 from → to 是否合法；非法请求返回 InvalidTransition，调用方不得修改状态
pub fn classify_transition(from: Phase, to: Phase) -> Result<TransitionKind, AgentError> {
    if from == to {
        return Err(AgentError::InvalidTransition {
            from,
            to,
            reason: format!("already in {to} phase"),
        });
    }
    match to.rank() as i8 - from.rank() as i8 {
        d if d < 0 => Ok(TransitionKind::Immediate),
        1 => Ok(TransitionKind::RequiresApproval),
        _ => Err(AgentError::InvalidTransition {
            from,
            to,
            reason: format!("{to} must be reached through exploitation"),
        }),
    }
}

/// 阶段历史条目；exited_at 为 None 表示当前活跃阶段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl PhaseHistoryEntry {
    pub fn open(phase: Phase, at: DateTime<Utc>) -> Self {
        Self {
            phase,
            entered_at: at,
            exited_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }
}
