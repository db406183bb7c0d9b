//! 目标情报聚合
//!
//! 只合并不删除：列表字段按并集去重（保持首次出现顺序），标量字段仅在新值非空时覆盖。
//! 某次观察中缺失的字段表示「本步未提及」，而不是「撤回」。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Ip,
    Hostname,
    Domain,
    Url,
}

impl TargetType {
    /// 按主机字符串判断类型：IP 字面量、带点的域名、其余为主机名
    pub fn of_host(host: &str) -> Self {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<std::net::IpAddr>().is_ok() {
            TargetType::Ip
        } else if bare.contains('.') {
            TargetType::Domain
        } else {
            TargetType::Hostname
        }
    }
}

/// 发现的凭据
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Credential {
    pub username: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

/// 目标情报；同一类型也用作「部分更新」（空列表 / None 表示未提及）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TargetIntel {
    #[serde(default)]
    pub primary_target: Option<String>,
    #[serde(default)]
    pub target_type: Option<TargetType>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub vulnerabilities: Vec<String>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
    /// 利用控制台中打开的会话 ID
    #[serde(default)]
    pub sessions: Vec<u32>,
}

fn union<T: PartialEq + Clone>(into: &mut Vec<T>, incoming: &[T]) {
    for item in incoming {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

/// 字符串列表去重时忽略首尾空白，丢弃空串
fn union_str(into: &mut Vec<String>, incoming: &[String]) {
    for item in incoming {
        let item = item.trim();
        if !item.is_empty() && !into.iter().any(|s| s == item) {
            into.push(item.to_string());
        }
    }
}

impl TargetIntel {
    pub fn is_empty(&self) -> bool {
        self == &TargetIntel::default()
    }

    /// 合并一次部分观察
    pub fn merge(&mut self, incoming: &TargetIntel) {
        if let Some(t) = incoming.primary_target.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            self.primary_target = Some(t.to_string());
        }
        if incoming.target_type.is_some() {
            self.target_type = incoming.target_type;
        }
        union(&mut self.ports, &incoming.ports);
        union_str(&mut self.services, &incoming.services);
        union_str(&mut self.technologies, &incoming.technologies);
        union_str(&mut self.vulnerabilities, &incoming.vulnerabilities);
        union(&mut self.credentials, &incoming.credentials);
        union(&mut self.sessions, &incoming.sessions);
    }

    /// 纯函数版本：merge(existing, incoming) -> merged
    pub fn merged(existing: &TargetIntel, incoming: &TargetIntel) -> TargetIntel {
        let mut out = existing.clone();
        out.merge(incoming);
        out
    }

    /// 渲染进 prompt 的情报摘要
    pub fn render(&self) -> String {
        if self.is_empty() {
            return "No target intelligence gathered yet.".to_string();
        }
        let mut lines = Vec::new();
        if let Some(t) = &self.primary_target {
            match self.target_type {
                Some(kind) => lines.push(format!("Primary target: {t} ({kind:?})")),
                None => lines.push(format!("Primary target: {t}")),
            }
        }
        if !self.ports.is_empty() {
            let ports: Vec<String> = self.ports.iter().map(u16::to_string).collect();
            lines.push(format!("Ports: {}", ports.join(", ")));
        }
        if !self.services.is_empty() {
            lines.push(format!("Services: {}", self.services.join(", ")));
        }
        if !self.technologies.is_empty() {
            lines.push(format!("Technologies: {}", self.technologies.join(", ")));
        }
        if !self.vulnerabilities.is_empty() {
            lines.push(format!("Vulnerabilities: {}", self.vulnerabilities.join(", ")));
        }
        if !self.credentials.is_empty() {
            lines.push(format!("Credentials: {} found", self.credentials.len()));
        }
        if !self.sessions.is_empty() {
            let ids: Vec<String> = self.sessions.iter().map(u32::to_string).collect();
            lines.push(format!("Active sessions: {}", ids.join(", ")));
        }
        lines.join("\n")
    }
}
