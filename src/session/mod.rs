//! 会话存储：按 (tenant, project, session) 保存 AgentState 检查点
//!
//! - **store**: SessionStore 接口与内存实现
//! - **sqlite**: SQLite 实现，审批挂起点可跨进程重启恢复
//! - **lock**: 每键互斥，串行化同一会话的读-改-写

pub mod key;
pub mod lock;
pub mod sqlite;
pub mod store;

pub use key::SessionKey;
pub use lock::SessionLocks;
pub use sqlite::SqliteSessionStore;
pub use store::{create_session_store, MemorySessionStore, SessionStore, StoreError};
