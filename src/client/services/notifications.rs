use log::debug;

use crate::client::services::events::NotificationServerEvent;
use crate::common::models::Notification;

/// Feed fed by the push-only notification channel: new items plus the
/// authoritative unread counter. The client never computes unread counts
/// itself.
#[derive(Debug, Default)]
pub struct NotificationFeed {
    items: Vec<Notification>,
    unread_count: u64,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: NotificationServerEvent) {
        match event {
            NotificationServerEvent::Notification(notification) => {
                debug!("[NOTIFY] new {} notification", notification.kind);
                self.items.insert(0, notification);
            }
            NotificationServerEvent::UnreadCount { count } => {
                self.unread_count = count;
            }
        }
    }

    /// Newest first.
    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread_count(&self) -> u64 {
        self.unread_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn pushes_accumulate_and_counter_is_authoritative() {
        let mut feed = NotificationFeed::new();
        feed.apply(NotificationServerEvent::Notification(Notification {
            id: "n1".to_string(),
            kind: "mention".to_string(),
            body: "Ana mentioned you".to_string(),
            created_at: Utc::now(),
        }));
        feed.apply(NotificationServerEvent::Notification(Notification {
            id: "n2".to_string(),
            kind: "task".to_string(),
            body: "Task assigned".to_string(),
            created_at: Utc::now(),
        }));
        feed.apply(NotificationServerEvent::UnreadCount { count: 5 });

        assert_eq!(feed.items()[0].id, "n2");
        assert_eq!(feed.items().len(), 2);
        // the counter comes from the server, not from items.len()
        assert_eq!(feed.unread_count(), 5);
    }
}
