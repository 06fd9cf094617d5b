use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Ephemeral per-room set of users currently typing. Entries are added on a
/// typing:true signal and dropped on typing:false or after `ttl` with no
/// refresh. Never persisted.
#[derive(Debug)]
pub struct TypingRegistry {
    ttl: Duration,
    entries: HashMap<String, Instant>,
}

impl TypingRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn apply(&mut self, user_id: &str, is_typing: bool) {
        if is_typing {
            self.entries.insert(user_id.to_string(), Instant::now());
        } else {
            self.entries.remove(user_id);
        }
    }

    /// Users typing right now, expired entries pruned, sorted for stable
    /// rendering.
    pub fn current(&mut self) -> Vec<String> {
        let ttl = self.ttl;
        self.entries.retain(|_, seen| seen.elapsed() < ttl);
        let mut users: Vec<String> = self.entries.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn is_typing(&mut self, user_id: &str) -> bool {
        self.current().iter().any(|u| u == user_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_stop_signals_drive_the_set() {
        let mut registry = TypingRegistry::new(Duration::from_secs(2));
        registry.apply("u1", true);
        registry.apply("u2", true);
        assert_eq!(registry.current(), vec!["u1".to_string(), "u2".to_string()]);

        registry.apply("u1", false);
        assert_eq!(registry.current(), vec!["u2".to_string()]);
    }

    #[test]
    fn entries_expire_without_refresh() {
        let mut registry = TypingRegistry::new(Duration::from_millis(20));
        registry.apply("u1", true);
        assert!(registry.is_typing("u1"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!registry.is_typing("u1"));
        assert!(registry.current().is_empty());
    }

    #[test]
    fn refresh_extends_the_deadline() {
        let mut registry = TypingRegistry::new(Duration::from_millis(50));
        registry.apply("u1", true);
        std::thread::sleep(Duration::from_millis(30));
        registry.apply("u1", true);
        std::thread::sleep(Duration::from_millis(30));
        assert!(registry.is_typing("u1"));
    }
}
