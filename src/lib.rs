//! RedAgent - Rust 渗透测试智能体编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 阶段状态机、审批门、待办 / 轨迹 / 情报、错误与恢复、编排器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话内对话记录
//! - **observability**: 日志初始化
//! - **react**: 推理引擎、决策应用与 ReAct 主循环
//! - **session**: 会话键、每键锁与检查点存储（内存 / SQLite）
//! - **tools**: 工具注册表、阶段策略、调度器与四个适配器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod session;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, Response};
