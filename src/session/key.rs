//! 会话键

use std::fmt;

use serde::{Deserialize, Serialize};

/// 会话的唯一标识三元组
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub tenant_id: String,
    pub project_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            session_id: session_id.into(),
        }
    }

    /// 为同一 tenant/project 生成新的会话键（reset 后使用）
    pub fn fresh(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self::new(tenant_id, project_id, uuid::Uuid::new_v4().to_string())
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("tenant_id", &self.tenant_id),
            ("project_id", &self.project_id),
            ("session_id", &self.session_id),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{name} is required"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant_id, self.project_id, self.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_validate() {
        let key = SessionKey::new("u1", "p1", "s1");
        assert_eq!(key.to_string(), "u1:p1:s1");
        assert!(key.validate().is_ok());
        assert!(SessionKey::new("u1", " ", "s1").validate().unwrap_err().contains("project_id"));
    }

    #[test]
    fn test_fresh_mints_new_session() {
        let a = SessionKey::fresh("u1", "p1");
        let b = SessionKey::fresh("u1", "p1");
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.tenant_id, b.tenant_id);
    }
}
