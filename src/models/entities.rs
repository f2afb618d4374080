use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };

use crate::models::chat::{Conversation, Message, Role};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl UserEntity {
    pub fn with_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }
}

/// Backend record pairing a user's submitted content with the agent's
/// eventual reply. One entity converts to zero, one, or two `Message`s.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageEntity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_date_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserEntity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_transaction_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_unread: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_date_time: Option<DateTime<Utc>>,
}

impl ChatMessageEntity {
    /// Entity for persisting a freshly submitted user message.
    pub fn for_send(content: &str, conversation: &Conversation, user_id: i64) -> Self {
        Self {
            user_content: Some(content.to_string()),
            conversation: Some(conversation.clone()),
            user: Some(UserEntity::with_id(user_id)),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingCycleEntity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    pub tokens_total: f64,
    pub rate: f64,
}

/// Convert persisted entities to UI messages: user side first, then agent
/// side, both stamped with the entity's creation time.
pub fn messages_from_entities(entities: &[ChatMessageEntity]) -> Vec<Message> {
    let mut messages = Vec::new();
    for entity in entities {
        if let Some(content) = entity.user_content.as_ref().filter(|c| !c.is_empty()) {
            messages.push(Message {
                role: Role::User,
                content: content.clone(),
                timestamp: entity.created,
            });
        }
        if let Some(content) = entity.agent_content.as_ref().filter(|c| !c.is_empty()) {
            messages.push(Message {
                role: Role::Assistant,
                content: content.clone(),
                timestamp: entity.created,
            });
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(user: Option<&str>, agent: Option<&str>) -> ChatMessageEntity {
        ChatMessageEntity {
            created: Some(Utc::now()),
            user_content: user.map(str::to_string),
            agent_content: agent.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn entity_with_both_sides_yields_user_then_assistant() {
        let e = entity(Some("question"), Some("answer"));
        let messages = messages_from_entities(std::slice::from_ref(&e));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "question");
        assert_eq!(messages[0].timestamp, e.created);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "answer");
        assert_eq!(messages[1].timestamp, e.created);
    }

    #[test]
    fn entity_with_only_user_side_yields_one_message() {
        let messages = messages_from_entities(&[entity(Some("question"), None)]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn empty_entities_yield_no_messages() {
        assert!(messages_from_entities(&[]).is_empty());
        assert!(messages_from_entities(&[entity(None, None)]).is_empty());
    }

    #[test]
    fn entity_round_trips_camel_case() {
        let json = r#"{"id":3,"userContent":"hi","userUnread":true,"agentContent":"hello"}"#;
        let e: ChatMessageEntity = serde_json::from_str(json).unwrap();
        assert_eq!(e.user_unread, Some(true));
        let out = serde_json::to_string(&e).unwrap();
        assert!(out.contains("\"userContent\":\"hi\""));
        assert!(out.contains("\"agentContent\":\"hello\""));
    }
}
