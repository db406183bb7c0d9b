//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REDAGENT__*` 覆盖（双下划线表示嵌套，如 `REDAGENT__AGENT__MAX_ITERATIONS=10`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub session: SessionSection,
    pub web: WebSection,
}

/// [app] 段：终端前端使用的默认租户与项目
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub tenant_id: String,
    pub project_id: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            tenant_id: "local".to_string(),
            project_id: "default".to_string(),
        }
    }
}

/// [llm] 段：推理引擎后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4.1".to_string(),
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次推理请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [agent] 段：循环上限与上下文窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: u32,
    /// 工具输出写入轨迹与上下文前的最大字符数
    pub tool_output_max_chars: usize,
    /// 推理上下文中展示的轨迹尾部步数
    pub trace_context_steps: usize,
    /// Response 中携带的轨迹摘要步数
    pub trace_summary_steps: usize,
    /// 推理上下文中的对话消息条数
    pub conversation_window: usize,
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            tool_output_max_chars: 8000,
            trace_context_steps: 5,
            trace_summary_steps: 10,
            conversation_window: 40,
            system_prompt_path: None,
        }
    }
}

/// [tools] 段：超时、各适配器参数、阶段映射
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub graph_query: GraphQuerySection,
    pub http: HttpSection,
    pub port_scan: PortScanSection,
    pub console: ConsoleSection,
    /// 工具名 → 允许运行的阶段名
    pub phases: BTreeMap<String, Vec<String>>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 120,
            graph_query: GraphQuerySection::default(),
            http: HttpSection::default(),
            port_scan: PortScanSection::default(),
            console: ConsoleSection::default(),
            phases: default_tool_phases(),
        }
    }
}

fn default_tool_phases() -> BTreeMap<String, Vec<String>> {
    let all = || {
        vec![
            "informational".to_string(),
            "exploitation".to_string(),
            "post_exploitation".to_string(),
        ]
    };
    BTreeMap::from([
        ("query_graph".to_string(), all()),
        ("http_request".to_string(), all()),
        ("port_scan".to_string(), all()),
        (
            "exploit_console".to_string(),
            vec!["exploitation".to_string(), "post_exploitation".to_string()],
        ),
    ])
}

/// [tools.graph_query] 段：Neo4j HTTP 端点与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphQuerySection {
    pub max_retries: u32,
    /// 首次重试前等待（毫秒），之后每次翻倍
    pub backoff_ms: u64,
    pub uri: String,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
}

impl Default for GraphQuerySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
            uri: "http://localhost:7474".to_string(),
            database: "neo4j".to_string(),
            username: "neo4j".to_string(),
            password: None,
        }
    }
}

/// [tools.http] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: u64,
    /// 是否接受无效证书（靶机常见自签名证书）
    pub accept_invalid_certs: bool,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            accept_invalid_certs: true,
        }
    }
}

/// [tools.port_scan] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortScanSection {
    pub binary: String,
}

impl Default for PortScanSection {
    fn default() -> Self {
        Self {
            binary: "naabu".to_string(),
        }
    }
}

/// [tools.console] 段：常驻利用控制台进程
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleSection {
    pub binary: String,
    pub args: Vec<String>,
    /// 启动横幅静默多久视为输出完毕（毫秒）
    pub idle_ms: u64,
    /// 回显结束标记的命令，`{marker}` 替换为每条命令唯一的标记
    pub marker_command: String,
    /// 等待结束标记的上限（秒），应小于 tools.tool_timeout_secs
    pub command_timeout_secs: u64,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        Self {
            binary: "msfconsole".to_string(),
            args: vec!["-q".to_string()],
            idle_ms: 3000,
            marker_command: "echo {marker}".to_string(),
            command_timeout_secs: 110,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [session] 段：检查点存储
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub backend: SessionBackend,
    pub sqlite_path: PathBuf,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Memory,
            sqlite_path: PathBuf::from("data/sessions.db"),
        }
    }
}

/// [web] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub bind: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8090".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 REDAGENT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 REDAGENT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REDAGENT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
