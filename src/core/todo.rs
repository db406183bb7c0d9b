//! 待办清单管理
//!
//! 推理引擎每轮返回更新后的待办清单，这里按 id（其次按描述）合并进已有清单：
//! id 跨轮稳定；已完成的条目不会被改回其它状态；未在本轮提及的条目保留。

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub description: String,
    pub status: TodoStatus,
    pub priority: Priority,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 推理引擎给出的单条待办（id 可缺省，表示新建或按描述匹配）
///
/// priority 缺省时保留已有条目的优先级，新建条目取 Medium。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TodoUpdate {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub status: TodoStatus,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// 待办清单：按 id 唯一，保持插入顺序
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    items: Vec<TodoItem>,
}

fn normalize(description: &str) -> String {
    description.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl TodoList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TodoItem> {
        self.items.iter().find(|t| t.id == id)
    }

    /// 合并一轮更新；返回新增条目数
    pub fn merge(&mut self, updates: &[TodoUpdate], now: DateTime<Utc>) -> usize {
        let mut created = 0;
        for update in updates {
            if update.description.trim().is_empty() && update.id.is_none() {
                continue;
            }
            let idx = update
                .id
                .as_deref()
                .and_then(|id| self.items.iter().position(|t| t.id == id))
                .or_else(|| {
                    let key = normalize(&update.description);
                    self.items.iter().position(|t| normalize(&t.description) == key)
                });
            match idx {
                Some(i) => apply_update(&mut self.items[i], update, now),
                None => {
                    let id = update
                        .id
                        .clone()
                        .filter(|id| !id.trim().is_empty())
                        .unwrap_or_else(short_id);
                    let completed_at = (update.status == TodoStatus::Completed).then_some(now);
                    self.items.push(TodoItem {
                        id,
                        description: update.description.trim().to_string(),
                        status: update.status,
                        priority: update.priority.unwrap_or_default(),
                        notes: update.notes.clone(),
                        created_at: now,
                        completed_at,
                    });
                    created += 1;
                }
            }
        }
        created
    }

    /// 渲染进 prompt 的清单文本
    pub fn render(&self) -> String {
        if self.items.is_empty() {
            return "No tasks defined yet.".to_string();
        }
        let mut lines = Vec::with_capacity(self.items.len());
        for (i, t) in self.items.iter().enumerate() {
            let icon = match t.status {
                TodoStatus::Pending => "[ ]",
                TodoStatus::InProgress => "[~]",
                TodoStatus::Completed => "[x]",
                TodoStatus::Blocked => "[!]",
            };
            let marker = match t.priority {
                Priority::High => "!!!",
                Priority::Medium => "!!",
                Priority::Low => "!",
            };
            lines.push(format!("{}. {} {} ({}) {}", i + 1, icon, marker, t.id, t.description));
            if let Some(notes) = t.notes.as_deref().filter(|n| !n.is_empty()) {
                lines.push(format!("   Notes: {notes}"));
            }
        }
        lines.join("\n")
    }
}

fn apply_update(item: &mut TodoItem, update: &TodoUpdate, now: DateTime<Utc>) {
    if !update.description.trim().is_empty() {
        item.description = update.description.trim().to_string();
    }
    if let Some(priority) = update.priority {
        item.priority = priority;
    }
    if update.notes.is_some() {
        item.notes = update.notes.clone();
    }
    // completed 为终态
    if item.status == TodoStatus::Completed {
        return;
    }
    item.status = update.status;
    if update.status == TodoStatus::Completed {
        item.completed_at = Some(now);
    }
}
