//! SQLite 会话存储
//!
//! 每个会话键一行，AgentState 序列化为 JSON 整体写入；单条 UPSERT 保证按键原子。
//! 审批挂起点因此可以跨进程重启恢复。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{SessionKey, SessionStore, StoreError};
use crate::core::AgentState;

pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// 打开（或创建）数据库文件并初始化表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Task(e.to_string()))?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agent_sessions (
                tenant_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, project_id, session_id)
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池上执行一次数据库操作
    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| StoreError::Task(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<AgentState>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT state FROM agent_sessions
                     WHERE tenant_id = ?1 AND project_id = ?2 AND session_id = ?3",
                    params![key.tenant_id, key.project_id, key.session_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn save(&self, key: &SessionKey, state: &AgentState) -> Result<(), StoreError> {
        let key = key.clone();
        let doc = serde_json::to_string(state)?;
        let updated_at = state.updated_at.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agent_sessions (tenant_id, project_id, session_id, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (tenant_id, project_id, session_id)
                 DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
                params![key.tenant_id, key.project_id, key.session_id, doc, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn reset(&self, key: &SessionKey) -> Result<bool, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM agent_sessions
                 WHERE tenant_id = ?1 AND project_id = ?2 AND session_id = ?3",
                params![key.tenant_id, key.project_id, key.session_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn list_sessions(&self, tenant_id: &str, project_id: &str) -> Result<Vec<String>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id FROM agent_sessions
                 WHERE tenant_id = ?1 AND project_id = ?2 ORDER BY session_id",
            )?;
            let ids = stmt
                .query_map(params![tenant_id, project_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM agent_sessions", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}
