//! 会话存储抽象层
//!
//! load / save / reset 三个操作，按键原子：读者要么看到完整的旧状态，要么看到完整的新状态。
//! 内存实现存放克隆值；SQLite 实现把整个 AgentState 作为一个 JSON 文档写入单行。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::{SessionKey, SqliteSessionStore};
use crate::config::{SessionBackend, SessionSection};
use crate::core::AgentState;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("State serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store task failed: {0}")]
    Task(String),
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取检查点；不存在时返回 None
    async fn load(&self, key: &SessionKey) -> Result<Option<AgentState>, StoreError>;

    /// 整体写入检查点
    async fn save(&self, key: &SessionKey, state: &AgentState) -> Result<(), StoreError>;

    /// 丢弃检查点；返回是否存在
    async fn reset(&self, key: &SessionKey) -> Result<bool, StoreError>;

    /// 某 tenant/project 下的所有 session_id
    async fn list_sessions(&self, tenant_id: &str, project_id: &str) -> Result<Vec<String>, StoreError>;

    /// 会话总数
    async fn count(&self) -> Result<usize, StoreError>;

    /// 读取检查点，不存在时返回全新状态
    async fn load_or_default(&self, key: &SessionKey, max_iterations: u32) -> Result<AgentState, StoreError> {
        Ok(self
            .load(key)
            .await?
            .unwrap_or_else(|| AgentState::new(key.clone(), max_iterations)))
    }
}

/// 内存会话存储（进程生命周期内有效）
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, AgentState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<AgentState>, StoreError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn save(&self, key: &SessionKey, state: &AgentState) -> Result<(), StoreError> {
        self.sessions.write().await.insert(key.clone(), state.clone());
        Ok(())
    }

    async fn reset(&self, key: &SessionKey) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(key).is_some())
    }

    async fn list_sessions(&self, tenant_id: &str, project_id: &str) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .await
            .keys()
            .filter(|k| k.tenant_id == tenant_id && k.project_id == project_id)
            .map(|k| k.session_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.sessions.read().await.len())
    }
}

/// 按配置创建会话存储
pub fn create_session_store(section: &SessionSection) -> Result<Arc<dyn SessionStore>, StoreError> {
    match section.backend {
        SessionBackend::Sqlite => {
            let store = SqliteSessionStore::open(&section.sqlite_path)?;
            tracing::info!("Using SQLite session store: {:?}", section.sqlite_path);
            Ok(Arc::new(store))
        }
        SessionBackend::Memory => {
            tracing::info!("Using in-memory session store");
            Ok(Arc::new(MemorySessionStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_isolation() {
        let store = MemorySessionStore::new();
        let a = SessionKey::new("u1", "p1", "a");
        let b = SessionKey::new("u2", "p1", "a");

        assert!(store.load(&a).await.unwrap().is_none());
        let mut state = store.load_or_default(&a, 7).await.unwrap();
        assert_eq!(state.max_iterations, 7);
        state.accept_question("scan 10.0.0.5");
        store.save(&a, &state).await.unwrap();

        assert_eq!(store.load(&a).await.unwrap().unwrap(), state);
        assert!(store.load(&b).await.unwrap().is_none());
        assert_eq!(store.list_sessions("u1", "p1").await.unwrap(), vec!["a".to_string()]);
        assert!(store.list_sessions("u2", "p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_reset() {
        let store = MemorySessionStore::new();
        let key = SessionKey::new("u", "p", "s");
        store.save(&key, &AgentState::new(key.clone(), 3)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.reset(&key).await.unwrap());
        assert!(!store.reset(&key).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
