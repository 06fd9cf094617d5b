//! Typed emit/listen surface for the three socket channels. Frames are JSON
//! objects tagged `{"event": ..., "data": ...}` with camelCase names, matching
//! what the backend pushes to room subscribers.

use serde::{Deserialize, Serialize};

use crate::common::models::{Attachment, ChatMessage, DirectMessage, Notification, Reaction};

/// Client-originated events on the `/messages` channel.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum GroupClientEvent {
    SendMessage {
        content: String,
        group_id: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    EditMessage {
        message_id: String,
        group_id: String,
        content: String,
    },
    DeleteMessage {
        message_id: String,
        group_id: String,
    },
    Typing {
        group_id: String,
        is_typing: bool,
    },
    AddReaction {
        message_id: String,
        group_id: String,
        emoji: String,
    },
    RemoveReaction {
        message_id: String,
        group_id: String,
        emoji: String,
    },
}

/// Server pushes on the `/messages` channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum GroupServerEvent {
    NewMessage(ChatMessage),
    MessageEdited(ChatMessage),
    MessageDeleted { message_id: String },
    UserTyping { user_id: String, is_typing: bool },
    ReactionAdded { message_id: String, reaction: Reaction },
    ReactionRemoved {
        message_id: String,
        emoji: String,
        user_id: String,
    },
}

/// Client-originated events on the `/conversations` channel.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ConversationClientEvent {
    JoinConversation {
        conversation_id: String,
    },
    LeaveConversation {
        conversation_id: String,
    },
    SendDirectMessage {
        content: String,
        conversation_id: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    EditDirectMessage {
        message_id: String,
        conversation_id: String,
        content: String,
    },
    DeleteDirectMessage {
        message_id: String,
        conversation_id: String,
    },
    AddDirectReaction {
        message_id: String,
        conversation_id: String,
        emoji: String,
    },
    RemoveDirectReaction {
        message_id: String,
        conversation_id: String,
        emoji: String,
    },
    MarkConversationAsRead {
        conversation_id: String,
    },
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
}

/// Server pushes on the `/conversations` channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ConversationServerEvent {
    NewDirectMessage(DirectMessage),
    DirectMessageEdited(DirectMessage),
    DirectMessageDeleted {
        message_id: String,
    },
    ConversationTyping {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    DirectReactionAdded {
        message_id: String,
        reaction: Reaction,
    },
    DirectReactionRemoved {
        message_id: String,
        emoji: String,
        user_id: String,
    },
}

/// Server pushes on the `/notifications` channel. Push-only: the client
/// never emits here.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum NotificationServerEvent {
    Notification(Notification),
    UnreadCount { count: u64 },
}

/// Room subscription frames for the group channel. The conversation channel
/// uses its own joinConversation/leaveConversation verbs instead.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RoomControl {
    JoinRoom { room_id: String },
    LeaveRoom { room_id: String },
}
