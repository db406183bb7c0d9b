//! 决策格式 JSON Schema（schemars 自动生成）
//!
//! 拼入 system prompt，减少推理引擎输出格式错误。

use schemars::schema_for;

use crate::react::RawDecision;

/// 返回决策 JSON 的 Schema 字符串
pub fn decision_schema_json() -> String {
    let schema = schema_for!(RawDecision);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_decision_fields() {
        let s = decision_schema_json();
        for field in ["thought", "action", "tool_name", "phase_transition", "updated_todo_list", "target_intel"] {
            assert!(s.contains(field), "missing {field}");
        }
        assert!(s.contains("transition_phase"));
    }
}
