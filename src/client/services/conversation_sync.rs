//! Per-conversation synchronizer: the direct-message analogue of the group
//! synchronizer, with reaction toggling, read-receipt emission and
//! own-echo-filtered typing presence on top.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use log::{debug, info};

use crate::client::services::events::{ConversationClientEvent, ConversationServerEvent};
use crate::client::services::presence::TypingRegistry;
use crate::client::services::reconcile::{self, ReactionSummary, SyncMessage};
use crate::client::services::rest::ApiClient;
use crate::client::services::transport::{ChannelHandle, TransportError};
use crate::common::mentions;
use crate::common::models::{Attachment, DirectMessage};

pub use crate::client::services::group_sync::SyncPhase;

pub struct ConversationSync {
    conversation_id: String,
    current_user_id: String,
    channel: ChannelHandle,
    phase: SyncPhase,
    messages: Vec<DirectMessage>,
    typing: TypingRegistry,
    typing_active: Arc<AtomicBool>,
    typing_generation: Arc<AtomicU64>,
    typing_expiry: Duration,
}

impl ConversationSync {
    pub fn new(
        conversation_id: &str,
        current_user_id: &str,
        channel: ChannelHandle,
        typing_expiry: Duration,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
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

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[DirectMessage] {
        &self.messages
    }

    pub async fn load_history(&mut self, api: &ApiClient) -> Result<()> {
        let path = format!("/conversations/{}/messages", self.conversation_id);
        let resp = api.get_json(&path).await?;
        if !resp.is_success() {
            anyhow::bail!(
                "history fetch for conversation {} failed: {}",
                self.conversation_id,
                resp.status
            );
        }
        let history: Vec<DirectMessage> = serde_json::from_value(resp.body)?;
        self.ingest_history(history)?;
        Ok(())
    }

    /// Join the conversation room, go live and immediately report the
    /// conversation as read. Unread counts stay server-driven.
    pub fn ingest_history(
        &mut self,
        mut history: Vec<DirectMessage>,
    ) -> Result<(), TransportError> {
        history.sort_by_key(|m| m.created_at);
        self.messages = history;
        self.channel.join_room(&self.conversation_id)?;
        self.phase = SyncPhase::Live;
        self.mark_read();
        info!(
            "[SYNC] conversation {} live with {} messages",
            self.conversation_id,
            self.messages.len()
        );
        Ok(())
    }

    pub fn mark_read(&self) {
        let _ = self.channel.emit(&ConversationClientEvent::MarkConversationAsRead {
            conversation_id: self.conversation_id.clone(),
        });
    }

    /// Apply one push event. Mismatched conversation ids are dropped, absent
    /// message ids are no-ops, and the current user's own typing echo is
    /// filtered out.
    pub fn apply(&mut self, event: ConversationServerEvent) {
        match event {
            ConversationServerEvent::NewDirectMessage(message) => {
                if message.conversation_id != self.conversation_id {
                    debug!(
                        "[SYNC] dropped cross-conversation message {} (conversation {})",
                        message.id, message.conversation_id
                    );
                    return;
                }
                self.messages.push(message);
                // every push received while mounted re-reports read state
                if self.phase == SyncPhase::Live {
                    self.mark_read();
                }
            }
            ConversationServerEvent::DirectMessageEdited(message) => {
                if message.conversation_id != self.conversation_id {
                    return;
                }
                reconcile::apply_edit(&mut self.messages, &message.id, &message.content);
            }
            ConversationServerEvent::DirectMessageDeleted { message_id } => {
                reconcile::apply_delete(&mut self.messages, &message_id);
            }
            ConversationServerEvent::ConversationTyping {
                conversation_id,
                user_id,
                is_typing,
            } => {
                if conversation_id != self.conversation_id || user_id == self.current_user_id {
                    return;
                }
                self.typing.apply(&user_id, is_typing);
            }
            ConversationServerEvent::DirectReactionAdded {
                message_id,
                reaction,
            } => {
                reconcile::apply_reaction_added(&mut self.messages, &message_id, reaction);
            }
            ConversationServerEvent::DirectReactionRemoved {
                message_id,
                emoji,
                user_id,
            } => {
                reconcile::apply_reaction_removed(&mut self.messages, &message_id, &emoji, &user_id);
            }
        }
    }

    /// Emit a direct message. Attachments were already uploaded out-of-band;
    /// only their metadata rides on the socket.
    pub fn send_message(
        &self,
        content: &str,
        reply_to_id: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<(), TransportError> {
        let mentions = mentions::extract_mention_ids(content);
        self.channel.emit(&ConversationClientEvent::SendDirectMessage {
            content: content.to_string(),
            conversation_id: self.conversation_id.clone(),
            mentions,
            reply_to_id,
            attachments,
        })?;
        self.stop_typing(true);
        Ok(())
    }

    pub fn edit_message(&self, message_id: &str, content: &str) -> Result<(), TransportError> {
        self.channel.emit(&ConversationClientEvent::EditDirectMessage {
            message_id: message_id.to_string(),
            conversation_id: self.conversation_id.clone(),
            content: content.to_string(),
        })
    }

    pub fn delete_message(&self, message_id: &str) -> Result<(), TransportError> {
        self.channel.emit(&ConversationClientEvent::DeleteDirectMessage {
            message_id: message_id.to_string(),
            conversation_id: self.conversation_id.clone(),
        })
    }

    /// Client-driven toggle over two distinct idempotent wire verbs; never a
    /// combined "toggle" event.
    pub fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<(), TransportError> {
        let already = reconcile::message_has_reaction(
            &self.messages,
            message_id,
            emoji,
            &self.current_user_id,
        );
        if already {
            self.channel.emit(&ConversationClientEvent::RemoveDirectReaction {
                message_id: message_id.to_string(),
                conversation_id: self.conversation_id.clone(),
                emoji: emoji.to_string(),
            })
        } else {
            self.channel.emit(&ConversationClientEvent::AddDirectReaction {
                message_id: message_id.to_string(),
                conversation_id: self.conversation_id.clone(),
                emoji: emoji.to_string(),
            })
        }
    }

    pub fn keystroke(&self) {
        let generation = self.typing_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.typing_active.swap(true, Ordering::SeqCst) {
            let _ = self.channel.emit(&ConversationClientEvent::Typing {
                conversation_id: self.conversation_id.clone(),
                is_typing: true,
            });
        }

        let active = Arc::clone(&self.typing_active);
        let generations = Arc::clone(&self.typing_generation);
        let channel = self.channel.clone();
        let conversation_id = self.conversation_id.clone();
        let expiry = self.typing_expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if generations.load(Ordering::SeqCst) == generation
                && active.swap(false, Ordering::SeqCst)
            {
                let _ = channel.emit(&ConversationClientEvent::Typing {
                    conversation_id,
                    is_typing: false,
                });
            }
        });
    }

    fn stop_typing(&self, emit: bool) {
        self.typing_generation.fetch_add(1, Ordering::SeqCst);
        if self.typing_active.swap(false, Ordering::SeqCst) && emit {
            let _ = self.channel.emit(&ConversationClientEvent::Typing {
                conversation_id: self.conversation_id.clone(),
                is_typing: false,
            });
        }
    }

    pub fn typing_users(&mut self) -> Vec<String> {
        self.typing.current()
    }

    pub fn sections(&self) -> Vec<(NaiveDate, &[DirectMessage])> {
        reconcile::day_sections(&self.messages)
    }

    pub fn reaction_summary(&self, message_id: &str) -> Vec<ReactionSummary> {
        self.messages
            .iter()
            .find(|m| m.id() == message_id)
            .map(|m| reconcile::summarize_reactions(&m.reactions, &self.current_user_id))
            .unwrap_or_default()
    }

    pub fn unmount(&mut self) {
        if self.phase == SyncPhase::Unmounted {
            return;
        }
        self.stop_typing(false);
        let _ = self.channel.leave_room(&self.conversation_id);
        self.messages.clear();
        self.typing.clear();
        self.phase = SyncPhase::Unmounted;
        info!("[SYNC] conversation {} unmounted", self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::services::transport::ChannelKind;
    use crate::common::models::Reaction;
    use chrono::Utc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn push_message(id: &str, conversation_id: &str, content: &str) -> DirectMessage {
        DirectMessage {
            id: id.to_string(),
            content: content.to_string(),
            author_id: "u2".to_string(),
            conversation_id: conversation_id.to_string(),
            created_at: Utc::now(),
            updated_at: None,
            is_edited: false,
            mentions: vec![],
            reply_to_id: None,
            attachments: vec![],
            reactions: vec![],
        }
    }

    fn live_sync() -> (ConversationSync, UnboundedReceiver<String>) {
        let (handle, rx) = ChannelHandle::detached(ChannelKind::Conversations);
        let mut sync = ConversationSync::new("c1", "u1", handle, Duration::from_secs(2));
        sync.ingest_history(vec![]).unwrap();
        (sync, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn mount_joins_and_marks_read_immediately() {
        let (_sync, mut rx) = live_sync();
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["event"], "joinConversation");
        assert_eq!(frames[1]["event"], "markConversationAsRead");
        assert_eq!(frames[1]["data"]["conversationId"], "c1");
    }

    #[tokio::test]
    async fn every_incoming_push_remarks_read() {
        let (mut sync, mut rx) = live_sync();
        drain(&mut rx);

        sync.apply(ConversationServerEvent::NewDirectMessage(push_message(
            "m1", "c1", "hi",
        )));
        sync.apply(ConversationServerEvent::NewDirectMessage(push_message(
            "m2", "c1", "there",
        )));
        let frames = drain(&mut rx);
        let reads = frames
            .iter()
            .filter(|f| f["event"] == "markConversationAsRead")
            .count();
        assert_eq!(reads, 2);
        assert_eq!(sync.messages().len(), 2);
    }

    #[tokio::test]
    async fn cross_conversation_pushes_are_dropped() {
        let (mut sync, mut rx) = live_sync();
        drain(&mut rx);

        sync.apply(ConversationServerEvent::NewDirectMessage(push_message(
            "m1", "other", "leak",
        )));
        assert!(sync.messages().is_empty());
        // no read receipt for a dropped push
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn own_typing_echo_is_filtered() {
        let (mut sync, _rx) = live_sync();
        sync.apply(ConversationServerEvent::ConversationTyping {
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            is_typing: true,
        });
        sync.apply(ConversationServerEvent::ConversationTyping {
            conversation_id: "c1".to_string(),
            user_id: "u2".to_string(),
            is_typing: true,
        });
        assert_eq!(sync.typing_users(), vec!["u2".to_string()]);
    }

    #[tokio::test]
    async fn racing_reaction_adds_leave_a_single_record() {
        let (mut sync, mut rx) = live_sync();
        sync.apply(ConversationServerEvent::NewDirectMessage(push_message(
            "m1", "c1", "hi",
        )));
        drain(&mut rx);

        let reaction = Reaction {
            emoji: "👍".to_string(),
            user_id: "u1".to_string(),
        };
        sync.apply(ConversationServerEvent::DirectReactionAdded {
            message_id: "m1".to_string(),
            reaction: reaction.clone(),
        });
        sync.apply(ConversationServerEvent::DirectReactionAdded {
            message_id: "m1".to_string(),
            reaction,
        });
        assert_eq!(sync.messages()[0].reactions.len(), 1);

        let summary = sync.reaction_summary("m1");
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].count, 1);
        assert!(summary[0].reacted);

        // with the reaction present, the toggle emits the remove verb
        sync.toggle_reaction("m1", "👍").unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["event"], "removeDirectReaction");
    }

    #[tokio::test]
    async fn attachments_ride_as_metadata_on_send() {
        let (sync, mut rx) = live_sync();
        drain(&mut rx);

        let attachment = Attachment {
            file_name: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: 1024,
            url: "https://files.example/report.pdf".to_string(),
        };
        sync.send_message("see attached", None, vec![attachment])
            .unwrap();

        let frames = drain(&mut rx);
        let send = frames
            .iter()
            .find(|f| f["event"] == "sendDirectMessage")
            .expect("sendDirectMessage frame");
        assert_eq!(send["data"]["attachments"][0]["fileName"], "report.pdf");
        assert_eq!(send["data"]["attachments"][0]["size"], 1024);
    }
}
