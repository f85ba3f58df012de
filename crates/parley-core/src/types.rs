use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name given to conversations created without one.
pub const DEFAULT_CONVERSATION_NAME: &str = "New Chat";

/// Free-form per-conversation context, merged field by field.
pub type UserContext = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Messages
// =============================================================================

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Only ever produced by prompt assembly; never stored in a session log.
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored conversation message. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Role-tagged text as sent to the generation service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Message> for PromptMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Everything a session log holds for one conversation key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub user_context: UserContext,
    /// Time of the last append or context merge, if any.
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

// =============================================================================
// Conversation directory
// =============================================================================

/// One entry in the conversation list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub last_message_preview: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSummary {
    /// Build a fresh summary. A missing id gets a random UUID, a missing
    /// name gets [`DEFAULT_CONVERSATION_NAME`].
    pub fn new(id: Option<String>, name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: name.unwrap_or_else(|| DEFAULT_CONVERSATION_NAME.to_string()),
            last_message_preview: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to a [`ConversationSummary`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
}

impl SummaryUpdate {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn preview(preview: impl Into<String>) -> Self {
        Self {
            last_message_preview: Some(preview.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
        let role: Role = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(role, Role::System);
    }

    #[test]
    fn test_summary_defaults() {
        let summary = ConversationSummary::new(None, None);
        assert_eq!(summary.name, DEFAULT_CONVERSATION_NAME);
        assert!(summary.last_message_preview.is_empty());
        assert!(Uuid::parse_str(&summary.id).is_ok());
        assert_eq!(summary.created_at, summary.updated_at);
    }

    #[test]
    fn test_summary_keeps_supplied_id_and_name() {
        let summary = ConversationSummary::new(Some("abc".into()), Some("Trip".into()));
        assert_eq!(summary.id, "abc");
        assert_eq!(summary.name, "Trip");
    }

    #[test]
    fn test_summary_uses_camel_case_on_the_wire() {
        let summary = ConversationSummary::new(Some("s1".into()), None);
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("lastMessagePreview").is_some());
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn test_prompt_message_from_message() {
        let msg = Message::now(Role::Assistant, "hello");
        let prompt = PromptMessage::from(&msg);
        assert_eq!(prompt, PromptMessage::new(Role::Assistant, "hello"));
    }

    #[test]
    fn test_summary_update_builders() {
        assert_eq!(SummaryUpdate::rename("X").name.as_deref(), Some("X"));
        assert!(SummaryUpdate::rename("X").last_message_preview.is_none());
        assert_eq!(
            SummaryUpdate::preview("hi").last_message_preview.as_deref(),
            Some("hi")
        );
    }
}
