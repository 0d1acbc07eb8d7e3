use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a chat-completion payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Renders a message list the way the input log shows it: numbered entries
/// with upper-cased roles between separator rules.
pub fn format_message_log(messages: &[Message], stage: usize, rule_width: usize) -> String {
    let heavy = "=".repeat(rule_width);
    let light = "-".repeat(rule_width);
    let mut out = String::new();
    out.push_str(&format!("\n{heavy}\n"));
    out.push_str(&format!(
        "第 {} 轮输入 (共 {} 条消息)\n",
        stage + 1,
        messages.len()
    ));
    out.push_str(&format!("{heavy}\n\n"));
    for (idx, message) in messages.iter().enumerate() {
        out.push_str(&format!(
            "[消息 {}] 角色: {}\n",
            idx + 1,
            message.role.as_str().to_uppercase()
        ));
        out.push_str(&format!("{light}\n{}\n{light}\n\n", message.content));
    }
    out
}
