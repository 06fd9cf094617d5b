//! Per-group message list synchronizer: one consistent chronologically
//! ordered list combining a one-shot history load with the unbounded stream
//! of live deltas pushed on the group channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use log::{debug, info};

use crate::client::services::events::{GroupClientEvent, GroupServerEvent};
use crate::client::services::presence::TypingRegistry;
use crate::client::services::reconcile::{
    self, ReactionSummary, SyncMessage,
};
use crate::client::services::rest::ApiClient;
use crate::client::services::transport::{ChannelHandle, TransportError};
use crate::common::mentions;
use crate::common::models::{Attachment, ChatMessage};

/// Lifecycle of one mounted group view. Local state is never persisted
/// across views: the next mount re-fetches history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Loading,
    Live,
    Unmounted,
}

pub struct GroupChatSync {
    group_id: String,
    current_user_id: String,
    channel: ChannelHandle,
    phase: SyncPhase,
    messages: Vec<ChatMessage>,
    typing: TypingRegistry,
    typing_active: Arc<AtomicBool>,
    typing_generation: Arc<AtomicU64>,
    typing_expiry: Duration,
}

impl GroupChatSync {
    pub fn new(
        group_id: &str,
        current_user_id: &str,
        channel: ChannelHandle,
        typing_expiry: Duration,
    ) -> Self {
        Self {
            group_id: group_id.to_string(),
            current_user_id: current_user_id.to_string(),
            channel,
            phase: SyncPhase::Loading,
            messages: Vec::new(),
            typing: TypingRegistry::new(typing_expiry),
            typing_active: Arc::new(AtomicBool::new(false)),
            typing_generation: Arc::new(AtomicU64::new(0)),
            typing_expiry,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// One-shot history fetch, then join the room and go live.
    pub async fn load_history(&mut self, api: &ApiClient) -> Result<()> {
        let path = format!("/groups/{}/messages", self.group_id);
        let resp = api.get_json(&path).await?;
        if !resp.is_success() {
            anyhow::bail!("history fetch for group {} failed: {}", self.group_id, resp.status);
        }
        let history: Vec<ChatMessage> = serde_json::from_value(resp.body)?;
        self.ingest_history(history)?;
        Ok(())
    }

    pub fn ingest_history(&mut self, mut history: Vec<ChatMessage>) -> Result<(), TransportError> {
        history.sort_by_key(|m| m.created_at);
        self.messages = history;
        self.channel.join_room(&self.group_id)?;
        self.phase = SyncPhase::Live;
        info!(
            "[SYNC] group {} live with {} messages",
            self.group_id,
            self.messages.len()
        );
        Ok(())
    }

    /// Apply one push event. Events for other rooms are dropped silently;
    /// edits and deletes for unknown ids are no-ops.
    pub fn apply(&mut self, event: GroupServerEvent) {
        match event {
            GroupServerEvent::NewMessage(message) => {
                if message.group_id != self.group_id {
                    debug!(
                        "[SYNC] dropped cross-room message {} (room {})",
                        message.id, message.group_id
                    );
                    return;
                }
                // The sender does not locally append on send; this push is
                // the single source of every appearance.
                self.messages.push(message);
            }
            GroupServerEvent::MessageEdited(message) => {
                if message.group_id != self.group_id {
                    return;
                }
                reconcile::apply_edit(&mut self.messages, &message.id, &message.content);
            }
            GroupServerEvent::MessageDeleted { message_id } => {
                reconcile::apply_delete(&mut self.messages, &message_id);
            }
            GroupServerEvent::UserTyping { user_id, is_typing } => {
                self.typing.apply(&user_id, is_typing);
            }
            GroupServerEvent::ReactionAdded {
                message_id,
                reaction,
            } => {
                reconcile::apply_reaction_added(&mut self.messages, &message_id, reaction);
            }
            GroupServerEvent::ReactionRemoved {
                message_id,
                emoji,
                user_id,
            } => {
                reconcile::apply_reaction_removed(&mut self.messages, &message_id, &emoji, &user_id);
            }
        }
    }

    /// Emit a message. Embedded `@[name](id)` spans are scanned into the
    /// `mentions` list; the raw text goes out untouched. No local append:
    /// the server push is the confirmation.
    pub fn send_message(
        &self,
        content: &str,
        reply_to_id: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<(), TransportError> {
        let mentions = mentions::extract_mention_ids(content);
        self.channel.emit(&GroupClientEvent::SendMessage {
            content: content.to_string(),
            group_id: self.group_id.clone(),
            mentions,
            reply_to_id,
            attachments,
        })?;
        self.stop_typing(true);
        Ok(())
    }

    pub fn edit_message(&self, message_id: &str, content: &str) -> Result<(), TransportError> {
        self.channel.emit(&GroupClientEvent::EditMessage {
            message_id: message_id.to_string(),
            group_id: self.group_id.clone(),
            content: content.to_string(),
        })
    }

    pub fn delete_message(&self, message_id: &str) -> Result<(), TransportError> {
        self.channel.emit(&GroupClientEvent::DeleteMessage {
            message_id: message_id.to_string(),
            group_id: self.group_id.clone(),
        })
    }

    /// Client-driven toggle: emits the distinct add or remove verb depending
    /// on whether the current user already reacted with this emoji. The
    /// local list only changes when the corresponding push arrives.
    pub fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<(), TransportError> {
        let already = reconcile::message_has_reaction(
            &self.messages,
            message_id,
            emoji,
            &self.current_user_id,
        );
        if already {
            self.channel.emit(&GroupClientEvent::RemoveReaction {
                message_id: message_id.to_string(),
                group_id: self.group_id.clone(),
                emoji: emoji.to_string(),
            })
        } else {
            self.channel.emit(&GroupClientEvent::AddReaction {
                message_id: message_id.to_string(),
                group_id: self.group_id.clone(),
                emoji: emoji.to_string(),
            })
        }
    }

    /// Register a local keystroke. The first keystroke emits typing:true;
    /// a spawned expiry task emits typing:false exactly once if no further
    /// keystroke arrives within the expiry window.
    pub fn keystroke(&self) {
        let generation = self.typing_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.typing_active.swap(true, Ordering::SeqCst) {
            let _ = self.channel.emit(&GroupClientEvent::Typing {
                group_id: self.group_id.clone(),
                is_typing: true,
            });
        }

        let active = Arc::clone(&self.typing_active);
        let generations = Arc::clone(&self.typing_generation);
        let channel = self.channel.clone();
        let group_id = self.group_id.clone();
        let expiry = self.typing_expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            // only the task of the last keystroke may fire, and only once
            if generations.load(Ordering::SeqCst) == generation
                && active.swap(false, Ordering::SeqCst)
            {
                let _ = channel.emit(&GroupClientEvent::Typing {
                    group_id,
                    is_typing: false,
                });
            }
        });
    }

    fn stop_typing(&self, emit: bool) {
        self.typing_generation.fetch_add(1, Ordering::SeqCst);
        if self.typing_active.swap(false, Ordering::SeqCst) && emit {
            let _ = self.channel.emit(&GroupClientEvent::Typing {
                group_id: self.group_id.clone(),
                is_typing: false,
            });
        }
    }

    /// Users currently typing in this room, expired entries pruned.
    pub fn typing_users(&mut self) -> Vec<String> {
        self.typing.current()
    }

    pub fn sections(&self) -> Vec<(NaiveDate, &[ChatMessage])> {
        reconcile::day_sections(&self.messages)
    }

    pub fn reaction_summary(&self, message_id: &str) -> Vec<ReactionSummary> {
        self.messages
            .iter()
            .find(|m| m.id() == message_id)
            .map(|m| reconcile::summarize_reactions(&m.reactions, &self.current_user_id))
            .unwrap_or_default()
    }

    /// Leave the room, detach and discard local state. Must run on every
    /// unmount path, including error unmounts.
    pub fn unmount(&mut self) {
        if self.phase == SyncPhase::Unmounted {
            return;
        }
        self.stop_typing(false);
        let _ = self.channel.leave_room(&self.group_id);
        self.messages.clear();
        self.typing.clear();
        self.phase = SyncPhase::Unmounted;
        info!("[SYNC] group {} unmounted", self.group_id);
    }
}
