//! 工具注册表
//!
//! 所有适配器实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找，
//! ToolDispatcher 在调用前做阶段校验、调用时加超时与重试。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::TargetIntel;
use crate::session::SessionKey;

/// 单次调用的上下文：会话作用域与重试信息
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// 调用所属会话；查询类适配器据此限定租户范围
    pub key: SessionKey,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
    /// 上一次尝试的错误，可重试的适配器据此重新生成请求
    pub previous_error: Option<String>,
}

impl ToolContext {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            attempt: 1,
            previous_error: None,
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于决策 JSON 中的 "tool_name" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 失败后是否由调度器重试（仅查询翻译类适配器）
    fn retryable(&self) -> bool {
        false
    }

    /// 从本工具的原始输出中提取结构化情报
    fn extract_intel(&self, _output: &str) -> Option<TargetIntel> {
        None
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String>;
}

/// 工具注册表：按名称有序存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
