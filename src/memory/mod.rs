//! 记忆层：只追加的对话日志与读取时的上下文窗口

pub mod conversation;

pub use conversation::{Conversation, Message, Role};
