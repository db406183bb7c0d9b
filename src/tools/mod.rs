//! 工具层：适配器、注册表、阶段策略与调度器

pub mod console;
pub mod executor;
pub mod graph_query;
pub mod http_probe;
pub mod policy;
pub mod port_scan;
pub mod registry;
pub mod schema;

pub use console::{ConsoleBackend, ConsoleTool, ProcessConsole};
pub use executor::{truncate_output, DispatchSettings, RetryPolicy, ToolDispatcher, ToolOutcome};
pub use graph_query::{inject_tenant_filter, GraphBackend, GraphQueryTool, Neo4jHttpBackend};
pub use http_probe::HttpProbeTool;
pub use policy::{PolicyConfigError, ToolPhasePolicy};
pub use port_scan::PortScanTool;
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use schema::decision_schema_json;
