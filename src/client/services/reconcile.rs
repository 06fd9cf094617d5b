//! Reconciliation helpers shared by the group and conversation
//! synchronizers: merging live deltas into the locally held ordered list.
//! Everything is keyed by message id, never by position, and an absent id is
//! always a no-op.

use chrono::{DateTime, Local, NaiveDate, Utc};

use crate::common::models::{ChatMessage, DirectMessage, Reaction};

/// Seam between the two message shapes so the list operations are written
/// once.
pub trait SyncMessage {
    fn id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn set_content(&mut self, content: String);
    fn reactions(&self) -> &[Reaction];
    fn reactions_mut(&mut self) -> &mut Vec<Reaction>;
}

impl SyncMessage for ChatMessage {
    fn id(&self) -> &str {
        &self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn set_content(&mut self, content: String) {
        self.content = content;
    }
    fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }
    fn reactions_mut(&mut self) -> &mut Vec<Reaction> {
        &mut self.reactions
    }
}

impl SyncMessage for DirectMessage {
    fn id(&self) -> &str {
        &self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn set_content(&mut self, content: String) {
        self.content = content;
    }
    fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }
    fn reactions_mut(&mut self) -> &mut Vec<Reaction> {
        &mut self.reactions
    }
}

/// Replace the content of the message with this id. Only the content field
/// changes; everything else stays as loaded.
pub fn apply_edit<M: SyncMessage>(messages: &mut [M], message_id: &str, content: &str) -> bool {
    match messages.iter_mut().find(|m| m.id() == message_id) {
        Some(message) => {
            message.set_content(content.to_string());
            true
        }
        None => false,
    }
}

pub fn apply_delete<M: SyncMessage>(messages: &mut Vec<M>, message_id: &str) -> bool {
    let before = messages.len();
    messages.retain(|m| m.id() != message_id);
    messages.len() != before
}

/// Add a reaction record, keeping `(emoji, user_id)` unique per message even
/// if the same push is applied twice.
pub fn apply_reaction_added<M: SyncMessage>(
    messages: &mut [M],
    message_id: &str,
    reaction: Reaction,
) -> bool {
    let Some(message) = messages.iter_mut().find(|m| m.id() == message_id) else {
        return false;
    };
    let reactions = message.reactions_mut();
    if reactions
        .iter()
        .any(|r| r.emoji == reaction.emoji && r.user_id == reaction.user_id)
    {
        return false;
    }
    reactions.push(reaction);
    true
}

pub fn apply_reaction_removed<M: SyncMessage>(
    messages: &mut [M],
    message_id: &str,
    emoji: &str,
    user_id: &str,
) -> bool {
    let Some(message) = messages.iter_mut().find(|m| m.id() == message_id) else {
        return false;
    };
    let reactions = message.reactions_mut();
    let before = reactions.len();
    reactions.retain(|r| !(r.emoji == emoji && r.user_id == user_id));
    reactions.len() != before
}

pub fn message_has_reaction<M: SyncMessage>(
    messages: &[M],
    message_id: &str,
    emoji: &str,
    user_id: &str,
) -> bool {
    messages
        .iter()
        .find(|m| m.id() == message_id)
        .map(|m| {
            m.reactions()
                .iter()
                .any(|r| r.emoji == emoji && r.user_id == user_id)
        })
        .unwrap_or(false)
}

/// Display grouping of a flat reaction list: per emoji, a count plus whether
/// the current user participated.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: usize,
    pub reacted: bool,
}

pub fn summarize_reactions(reactions: &[Reaction], current_user: &str) -> Vec<ReactionSummary> {
    let mut summary: Vec<ReactionSummary> = Vec::new();
    for reaction in reactions {
        match summary.iter_mut().find(|s| s.emoji == reaction.emoji) {
            Some(entry) => {
                entry.count += 1;
                entry.reacted |= reaction.user_id == current_user;
            }
            None => summary.push(ReactionSummary {
                emoji: reaction.emoji.clone(),
                count: 1,
                reacted: reaction.user_id == current_user,
            }),
        }
    }
    summary
}

/// Consecutive messages grouped by local calendar day, for date-separator
/// rendering. Within a day the arrival order is preserved.
pub fn day_sections<M: SyncMessage>(messages: &[M]) -> Vec<(NaiveDate, &[M])> {
    let local_day =
        |message: &M| message.created_at().with_timezone(&Local).date_naive();
    let mut sections: Vec<(NaiveDate, &[M])> = Vec::new();
    let mut start = 0;
    for i in 1..=messages.len() {
        let boundary = i == messages.len() || local_day(&messages[i - 1]) != local_day(&messages[i]);
        if boundary {
            sections.push((local_day(&messages[start]), &messages[start..i]));
            start = i;
        }
    }
    sections
}
