//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

use crate::config::LlmSection;

/// 按 [llm] 段创建客户端
pub fn create_llm_client(section: &LlmSection) -> Result<Arc<dyn LlmClient>, String> {
    match section.provider.as_str() {
        "mock" => Ok(Arc::new(MockLlmClient)),
        "openai" => {
            tracing::info!(model = %section.model, "using OpenAI-compatible LLM");
            Ok(Arc::new(OpenAiClient::new(
                section.base_url.as_deref(),
                &section.model,
                section.api_key.as_deref(),
                Duration::from_secs(section.timeouts.request),
            )))
        }
        other => Err(format!("unknown llm provider: {other}")),
    }
}
