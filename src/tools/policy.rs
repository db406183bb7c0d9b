//! 工具阶段策略
//!
//! 静态映射：工具名 → 允许运行的阶段集合。启动时从配置校验生成，运行期只读；
//! 新增工具只需改配置，不触及阶段状态机。

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::core::{AgentError, Phase};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyConfigError {
    #[error("tool {tool}: unknown phase {phase:?}")]
    UnknownPhase { tool: String, phase: String },

    #[error("tool {0} has an empty phase list")]
    EmptyPhases(String),

    #[error("registered tool {0} has no phase mapping")]
    Unmapped(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolPhasePolicy {
    map: BTreeMap<String, BTreeSet<Phase>>,
}

impl ToolPhasePolicy {
    pub fn from_config(raw: &BTreeMap<String, Vec<String>>) -> Result<Self, PolicyConfigError> {
        let mut map = BTreeMap::new();
        for (tool, phases) in raw {
            if phases.is_empty() {
                return Err(PolicyConfigError::EmptyPhases(tool.clone()));
            }
            let mut set = BTreeSet::new();
            for p in phases {
                let phase = p.parse::<Phase>().map_err(|_| PolicyConfigError::UnknownPhase {
                    tool: tool.clone(),
                    phase: p.clone(),
                })?;
                set.insert(phase);
            }
            map.insert(tool.clone(), set);
        }
        Ok(Self { map })
    }

    pub fn allow(mut self, tool: impl Into<String>, phases: &[Phase]) -> Self {
        self.map.insert(tool.into(), phases.iter().copied().collect());
        self
    }

    /// 每个已注册工具都必须有映射
    pub fn ensure_covers(&self, registered: &[String]) -> Result<(), PolicyConfigError> {
        match registered.iter().find(|t| !self.map.contains_key(*t)) {
            Some(t) => Err(PolicyConfigError::Unmapped(t.clone())),
            None => Ok(()),
        }
    }

    pub fn is_allowed(&self, tool: &str, phase: Phase) -> bool {
        self.map.get(tool).is_some_and(|set| set.contains(&phase))
    }

    pub fn allowed_phases(&self, tool: &str) -> Option<&BTreeSet<Phase>> {
        self.map.get(tool)
    }

    pub fn tools_for_phase(&self, phase: Phase) -> Vec<&str> {
        self.map
            .iter()
            .filter(|(_, set)| set.contains(&phase))
            .map(|(t, _)| t.as_str())
            .collect()
    }

    /// 校验一次调用；拒绝信息会进入轨迹并对下一次推理可见
    pub fn check(&self, tool: &str, phase: Phase) -> Result<(), AgentError> {
        let Some(set) = self.map.get(tool) else {
            return Err(AgentError::UnknownTool(format!(
                "{tool}; tools available in phase {phase}: {}",
                self.tools_for_phase(phase).join(", ")
            )));
        };
        if set.contains(&phase) {
            return Ok(());
        }
        let required: Vec<&str> = set.iter().map(Phase::as_str).collect();
        Err(AgentError::PolicyDenied(format!(
            "tool {tool} not allowed in phase {phase}, requires one of {{{}}}",
            required.join(", ")
        )))
    }
}
