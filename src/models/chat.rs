use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };

use crate::models::entities::UserEntity;

/// Maximum length of an auto-generated conversation name before truncation.
pub const AUTO_NAME_LEN: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// A named, ordered thread of messages between a user and the agent.
/// Field names follow the backend wire format.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Assigned by the backend on first upsert.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub user: UserEntity,
}

impl Conversation {
    pub fn new(name: impl Into<String>, user: UserEntity) -> Self {
        Self {
            id: None,
            name: name.into(),
            messages: Vec::new(),
            folder_id: None,
            user,
        }
    }

    /// Auto-name for a conversation receiving its first exchange: the first
    /// 30 characters of the user content, with an ellipsis when truncated.
    pub fn auto_name(content: &str) -> String {
        if content.chars().count() > AUTO_NAME_LEN {
            let truncated: String = content.chars().take(AUTO_NAME_LEN).collect();
            format!("{}...", truncated)
        } else {
            content.to_string()
        }
    }
}

/// Locally cached sidebar folder.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub kind: String,
}

impl Folder {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// UI preferences persisted in the local cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub theme: String,
    pub show_chatbar: bool,
    pub show_promptbar: bool,
    #[serde(default)]
    pub plugin_keys: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            show_chatbar: true,
            show_promptbar: true,
            plugin_keys: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_name_truncates_long_content() {
        let content = "Explain quantum entanglement in simple terms please";
        assert_eq!(
            Conversation::auto_name(content),
            "Explain quantum entanglement i..."
        );
    }

    #[test]
    fn auto_name_keeps_short_content() {
        assert_eq!(Conversation::auto_name("Hello there"), "Hello there");
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn conversation_deserializes_without_messages() {
        let json = r#"{"id":7,"name":"Support","folderId":null,"user":{"id":1}}"#;
        let conversation: Conversation = serde_json::from_str(json).unwrap();
        assert_eq!(conversation.id, Some(7));
        assert!(conversation.messages.is_empty());
    }
}
