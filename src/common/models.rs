use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attachment metadata as returned by the upload endpoint. The socket
/// channels only ever carry this metadata, never file bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

/// One reaction record. Uniqueness is per `(emoji, user_id)` on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: String,
}

/// Group-scoped message. The server is the sole source of truth; the client
/// holds a working copy keyed by `id`, ordered by `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub group_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

/// Direct message: structurally a [`ChatMessage`] scoped to a conversation
/// instead of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Conversation between users. Created lazily server-side on the first
/// direct-message attempt and never deleted by the client. The structure is
/// N-participant capable even though the UI only drives 1:1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub unread_count: u64,
}

/// Item pushed on the notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub kind: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}
