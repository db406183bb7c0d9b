//! 编排器构建器：从 AppConfig 组装出可用的 Orchestrator
//!
//! 终端与 Web 前端共用同一套组装逻辑；测试可替换推理引擎、存储、工具与外部后端。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::AppConfig;
use crate::core::Orchestrator;
use crate::llm::{create_llm_client, LlmClient};
use crate::react::{ContextBuilder, LoopController, Planner, ReasoningEngine, DEFAULT_SYSTEM_PROMPT};
use crate::session::{create_session_store, SessionStore};
use crate::tools::{
    ConsoleBackend, ConsoleTool, DispatchSettings, GraphBackend, GraphQueryTool, HttpProbeTool, Neo4jHttpBackend,
    PortScanTool, ProcessConsole, RetryPolicy, Tool, ToolDispatcher, ToolPhasePolicy, ToolRegistry,
};

pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    engine: Option<Arc<dyn ReasoningEngine>>,
    store: Option<Arc<dyn SessionStore>>,
    graph_backend: Option<Arc<dyn GraphBackend>>,
    console_backend: Option<Arc<dyn ConsoleBackend>>,
    extra_tools: Vec<Arc<dyn Tool>>,
    default_tools: bool,
    system_prompt: Option<String>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            engine: None,
            store: None,
            graph_backend: None,
            console_backend: None,
            extra_tools: Vec::new(),
            default_tools: true,
            system_prompt: None,
        }
    }

    /// 指定 LLM（推理引擎与图查询翻译共用）；未指定时按 [llm] 段创建
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 直接替换推理引擎
    pub fn with_engine(mut self, engine: Arc<dyn ReasoningEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_graph_backend(mut self, backend: Arc<dyn GraphBackend>) -> Self {
        self.graph_backend = Some(backend);
        self
    }

    pub fn with_console_backend(mut self, backend: Arc<dyn ConsoleBackend>) -> Self {
        self.console_backend = Some(backend);
        self
    }

    /// 追加工具（同名覆盖默认工具）；必须在 [tools.phases] 中有映射
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    /// 不注册四个默认适配器
    pub fn without_default_tools(mut self) -> Self {
        self.default_tools = false;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    fn resolve_system_prompt(&self) -> anyhow::Result<String> {
        if let Some(p) = &self.system_prompt {
            return Ok(p.clone());
        }
        match &self.config.agent.system_prompt_path {
            Some(path) => read_prompt(path),
            None => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    fn build_registry(&self, llm: &Arc<dyn LlmClient>) -> anyhow::Result<ToolRegistry> {
        let mut tools = ToolRegistry::new();
        if self.default_tools {
            let tools_cfg = &self.config.tools;
            let graph = self
                .graph_backend
                .clone()
                .unwrap_or_else(|| Arc::new(Neo4jHttpBackend::new(&tools_cfg.graph_query)) as Arc<dyn GraphBackend>);
            let console = self
                .console_backend
                .clone()
                .unwrap_or_else(|| Arc::new(ProcessConsole::new(&tools_cfg.console)) as Arc<dyn ConsoleBackend>);
            tools.register(GraphQueryTool::new(llm.clone(), graph));
            tools.register(HttpProbeTool::new(&tools_cfg.http).map_err(anyhow::Error::msg)?);
            tools.register(PortScanTool::new(&tools_cfg.port_scan));
            tools.register(ConsoleTool::new(console));
        }
        for tool in &self.extra_tools {
            tools.register_arc(tool.clone());
        }
        Ok(tools)
    }

    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let cfg = &self.config;
        let llm = match &self.llm {
            Some(llm) => llm.clone(),
            None => create_llm_client(&cfg.llm).map_err(anyhow::Error::msg)?,
        };
        let engine = self
            .engine
            .clone()
            .unwrap_or_else(|| Arc::new(Planner::new(llm.clone())) as Arc<dyn ReasoningEngine>);

        let registry = self.build_registry(&llm)?;
        let policy = ToolPhasePolicy::from_config(&cfg.tools.phases).context("invalid [tools.phases]")?;
        let settings = DispatchSettings {
            timeout: Duration::from_secs(cfg.tools.tool_timeout_secs),
            max_output_chars: cfg.agent.tool_output_max_chars,
            retry: RetryPolicy {
                max_retries: cfg.tools.graph_query.max_retries,
                backoff: Duration::from_millis(cfg.tools.graph_query.backoff_ms),
            },
        };
        let tool_names = registry.tool_names();
        let dispatcher = ToolDispatcher::new(registry, policy, settings).context("tool phase policy")?;

        let context = ContextBuilder::new(
            self.resolve_system_prompt()?,
            cfg.agent.trace_context_steps,
            cfg.agent.conversation_window,
        );
        let store = match &self.store {
            Some(s) => s.clone(),
            None => create_session_store(&cfg.session).context("open session store")?,
        };

        tracing::info!(
            tools = ?tool_names,
            max_iterations = cfg.agent.max_iterations,
            "orchestrator ready"
        );
        let controller = LoopController::new(engine, Arc::new(dispatcher), context);
        Ok(Orchestrator::new(
            controller,
            store,
            cfg.agent.max_iterations,
            cfg.agent.trace_summary_steps,
        ))
    }
}

fn read_prompt(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("read system prompt {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::session::MemorySessionStore;

    #[test]
    fn test_build_with_defaults() {
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(Arc::new(ScriptedLlmClient::default()))
            .with_store(Arc::new(MemorySessionStore::new()))
            .build();
        assert!(orch.is_ok());
    }

    #[test]
    fn test_unmapped_tool_is_startup_error() {
        let mut cfg = AppConfig::default();
        cfg.tools.phases.remove("exploit_console");
        let orch = OrchestratorBuilder::new(cfg)
            .with_llm(Arc::new(ScriptedLlmClient::default()))
            .with_store(Arc::new(MemorySessionStore::new()))
            .build();
        assert!(orch.is_err());
    }

    #[test]
    fn test_bad_phase_name_is_startup_error() {
        let mut cfg = AppConfig::default();
        cfg.tools
            .phases
            .insert("port_scan".into(), vec!["recon".into()]);
        let orch = OrchestratorBuilder::new(cfg)
            .with_llm(Arc::new(ScriptedLlmClient::default()))
            .with_store(Arc::new(MemorySessionStore::new()))
            .build();
        assert!(orch.is_err());
    }

    #[test]
    fn test_missing_prompt_file_is_error() {
        let mut cfg = AppConfig::default();
        cfg.agent.system_prompt_path = Some("/nonexistent/prompt.md".into());
        let orch = OrchestratorBuilder::new(cfg)
            .with_llm(Arc::new(ScriptedLlmClient::default()))
            .with_store(Arc::new(MemorySessionStore::new()))
            .build();
        assert!(orch.is_err());
    }
}
