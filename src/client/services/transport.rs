//! Socket channel manager: up to three independent authenticated channels
//! (group messages, notifications, direct conversations), each a single
//! physical connection owned by the [`ChannelRegistry`]. The registry is an
//! explicit object injected by the application root, so the "one active
//! connection per channel kind" invariant does not rely on shared globals.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

use crate::client::config::ClientConfig;
use crate::client::services::events::{
    ConversationClientEvent, ConversationServerEvent, GroupServerEvent, NotificationServerEvent,
    RoomControl,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Messages,
    Notifications,
    Conversations,
}

impl ChannelKind {
    pub fn namespace(&self) -> &'static str {
        match self {
            ChannelKind::Messages => "/messages",
            ChannelKind::Notifications => "/notifications",
            ChannelKind::Conversations => "/conversations",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportError {
    ConnectionFailed(String),
    AuthenticationFailed(String),
    SendFailed(String),
    Disconnected,
    InvalidFrame(String),
    Timeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            TransportError::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            TransportError::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            TransportError::Disconnected => write!(f, "Channel disconnected"),
            TransportError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            TransportError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

// Handshake frames. The bearer token rides in the first frame after the
// socket opens, never in the URL.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthMessage {
    message_type: String, // "auth"
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    #[allow(dead_code)]
    message_type: String, // "authResponse"
    success: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// An inbound push, already parsed for the channel it arrived on.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Group(GroupServerEvent),
    Conversation(ConversationServerEvent),
    Notification(NotificationServerEvent),
}

/// Cheap clonable sending side of one channel connection. Room membership is
/// layered on top of the physical connection: a client can be connected
/// without being subscribed to any room.
#[derive(Clone)]
pub struct ChannelHandle {
    kind: ChannelKind,
    connection_id: String,
    outgoing: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    joined_rooms: Arc<Mutex<HashSet<String>>>,
}

impl ChannelHandle {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Serialize and queue one event frame for delivery.
    pub fn emit<T: Serialize>(&self, event: &T) -> Result<(), TransportError> {
        let frame = serde_json::to_string(event)
            .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        self.outgoing
            .send(frame)
            .map_err(|_| TransportError::SendFailed("channel writer ended".to_string()))
    }

    pub fn join_room(&self, room_id: &str) -> Result<(), TransportError> {
        match self.kind {
            ChannelKind::Messages => self.emit(&RoomControl::JoinRoom {
                room_id: room_id.to_string(),
            })?,
            ChannelKind::Conversations => self.emit(&ConversationClientEvent::JoinConversation {
                conversation_id: room_id.to_string(),
            })?,
            ChannelKind::Notifications => {
                return Err(TransportError::SendFailed(
                    "notification channel has no rooms".to_string(),
                ))
            }
        }
        if let Ok(mut rooms) = self.joined_rooms.lock() {
            rooms.insert(room_id.to_string());
        }
        Ok(())
    }

    pub fn leave_room(&self, room_id: &str) -> Result<(), TransportError> {
        match self.kind {
            ChannelKind::Messages => self.emit(&RoomControl::LeaveRoom {
                room_id: room_id.to_string(),
            })?,
            ChannelKind::Conversations => self.emit(&ConversationClientEvent::LeaveConversation {
                conversation_id: room_id.to_string(),
            })?,
            ChannelKind::Notifications => {
                return Err(TransportError::SendFailed(
                    "notification channel has no rooms".to_string(),
                ))
            }
        }
        if let Ok(mut rooms) = self.joined_rooms.lock() {
            rooms.remove(room_id);
        }
        Ok(())
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.joined_rooms
            .lock()
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Handle wired to a bare frame pipe, for exercising emit paths without
    /// a live socket.
    #[cfg(test)]
    pub(crate) fn detached(kind: ChannelKind) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle {
            kind,
            connection_id: Uuid::new_v4().to_string(),
            outgoing: tx,
            connected: Arc::new(AtomicBool::new(true)),
            joined_rooms: Arc::new(Mutex::new(HashSet::new())),
        };
        (handle, rx)
    }
}

struct ChannelConnection {
    handle: ChannelHandle,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

/// Owns the physical connections, one per [`ChannelKind`].
pub struct ChannelRegistry {
    socket_base_url: String,
    api_base_url: String,
    http: reqwest::Client,
    poll_interval: Duration,
    max_retry_attempts: u32,
    retry_delay: Duration,
    channels: HashMap<ChannelKind, ChannelConnection>,
}

impl ChannelRegistry {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            socket_base_url: config.socket_base_url.clone(),
            api_base_url: config.api_base_url.clone(),
            http: reqwest::Client::new(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_retry_attempts: 5,
            retry_delay: Duration::from_secs(2),
            channels: HashMap::new(),
        }
    }

    pub fn set_retry_policy(&mut self, max_attempts: u32, delay: Duration) {
        self.max_retry_attempts = max_attempts;
        self.retry_delay = delay;
    }

    /// Idempotent connect: an already-open connection for `kind` is returned
    /// unchanged. Otherwise the websocket transport is attempted with
    /// backoff, degrading to HTTP long-polling when it cannot be
    /// established.
    pub async fn connect(
        &mut self,
        kind: ChannelKind,
        token: &str,
    ) -> Result<ChannelHandle, TransportError> {
        if let Some(existing) = self.channels.get(&kind) {
            if existing.handle.is_connected() {
                info!(
                    "[WS:CLIENT] {} already connected, reusing connection {}",
                    kind.namespace(),
                    existing.handle.connection_id()
                );
                return Ok(existing.handle.clone());
            }
            // Stale entry: dispose of the old handle entirely before opening
            // a fresh connection.
            self.channels.remove(&kind);
        }

        let ws_url = format!(
            "{}{}",
            self.socket_base_url.trim_end_matches('/'),
            kind.namespace()
        );
        Url::parse(&ws_url).map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let connection_id = Uuid::new_v4().to_string();

        let outgoing = match self
            .connect_ws_with_retry(&ws_url, kind, token, event_tx.clone(), &connected, &connection_id)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                warn!(
                    "[WS:CLIENT] {} websocket unavailable ({}), falling back to polling",
                    kind.namespace(),
                    e
                );
                self.start_polling(kind, token, event_tx, &connected, &connection_id)
            }
        };

        let handle = ChannelHandle {
            kind,
            connection_id,
            outgoing,
            connected,
            joined_rooms: Arc::new(Mutex::new(HashSet::new())),
        };
        self.channels.insert(
            kind,
            ChannelConnection {
                handle: handle.clone(),
                events: Some(event_rx),
            },
        );
        Ok(handle)
    }

    /// Take the inbound event stream for a channel. Can be called once per
    /// connection; the single consumer that owns the view holds the
    /// receiver.
    pub fn take_events(&mut self, kind: ChannelKind) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.channels.get_mut(&kind).and_then(|c| c.events.take())
    }

    /// Tear down the channel and clear the slot so a later connect creates a
    /// fresh connection.
    pub fn disconnect(&mut self, kind: ChannelKind) {
        if let Some(connection) = self.channels.remove(&kind) {
            connection.handle.connected.store(false, Ordering::SeqCst);
            info!(
                "[WS:CLIENT] {} disconnected (connection {})",
                kind.namespace(),
                connection.handle.connection_id()
            );
        }
    }

    pub fn is_connected(&self, kind: ChannelKind) -> bool {
        self.channels
            .get(&kind)
            .map(|c| c.handle.is_connected())
            .unwrap_or(false)
    }

    async fn connect_ws_with_retry(
        &self,
        ws_url: &str,
        kind: ChannelKind,
        token: &str,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
        connected: &Arc<AtomicBool>,
        connection_id: &str,
    ) -> Result<mpsc::UnboundedSender<String>, TransportError> {
        let mut delay = self.retry_delay;
        for attempt in 1..=self.max_retry_attempts {
            match open_socket(ws_url, kind, token, event_tx.clone(), connected, connection_id).await
            {
                Ok(tx) => {
                    info!(
                        "[WS:CLIENT] {} connected (connection {})",
                        kind.namespace(),
                        connection_id
                    );
                    return Ok(tx);
                }
                Err(e) => {
                    warn!(
                        "[WS:CLIENT] {} connect attempt {} failed: {}",
                        kind.namespace(),
                        attempt,
                        e
                    );
                    if attempt < self.max_retry_attempts {
                        tokio::time::sleep(delay).await;
                        // Exponential backoff
                        delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Err(TransportError::ConnectionFailed(
            "max retry attempts exceeded".to_string(),
        ))
    }

    // HTTP long-poll fallback: reads batches of frames from the poll
    // endpoint and posts outgoing frames back, feeding the same event pipe
    // as the websocket path.
    fn start_polling(
        &self,
        kind: ChannelKind,
        token: &str,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
        connected: &Arc<AtomicBool>,
        connection_id: &str,
    ) -> mpsc::UnboundedSender<String> {
        let poll_url = format!(
            "{}/poll{}",
            self.api_base_url.trim_end_matches('/'),
            kind.namespace()
        );
        connected.store(true, Ordering::SeqCst);

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let emit_url = format!("{}/emit", poll_url);
        let http = self.http.clone();
        let emit_token = token.to_string();
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let result = http
                    .post(&emit_url)
                    .bearer_auth(&emit_token)
                    .header("content-type", "application/json")
                    .body(frame)
                    .send()
                    .await;
                if let Err(e) = result {
                    warn!("[POLL] emit failed: {}", e);
                }
            }
        });

        let http = self.http.clone();
        let poll_token = token.to_string();
        let interval = self.poll_interval;
        let flag = connected.clone();
        let conn_id = connection_id.to_string();
        tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            loop {
                if event_tx.is_closed() {
                    break;
                }
                match http.get(&poll_url).bearer_auth(&poll_token).send().await {
                    Ok(resp) => match resp.json::<Vec<serde_json::Value>>().await {
                        Ok(frames) => {
                            consecutive_failures = 0;
                            for frame in frames {
                                match parse_frame(kind, &frame.to_string()) {
                                    Ok(event) => {
                                        if event_tx.send(event).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!("[POLL] {} unknown frame skipped: {}", poll_url, e)
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!("[POLL] {} bad response: {}", poll_url, e);
                        }
                    },
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            "[POLL] {} unreachable (attempt {}): {}",
                            poll_url, consecutive_failures, e
                        );
                    }
                }
                // Exponential backoff on repeated failure, capped at a minute
                let sleep_for = if consecutive_failures == 0 {
                    interval
                } else {
                    let backoff = interval
                        .as_secs()
                        .saturating_mul(2u64.saturating_pow(consecutive_failures.min(16)));
                    Duration::from_secs(backoff.min(60))
                };
                tokio::time::sleep(sleep_for).await;
            }
            flag.store(false, Ordering::SeqCst);
            info!("[POLL] loop ended (connection {})", conn_id);
        });

        outgoing_tx
    }
}

async fn open_socket(
    ws_url: &str,
    kind: ChannelKind,
    token: &str,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    connected: &Arc<AtomicBool>,
    connection_id: &str,
) -> Result<mpsc::UnboundedSender<String>, TransportError> {
    let (ws_stream, _) = connect_async(ws_url)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let auth = AuthMessage {
        message_type: "auth".to_string(),
        token: token.to_string(),
    };
    let auth_json = serde_json::to_string(&auth)
        .map_err(|e| TransportError::AuthenticationFailed(e.to_string()))?;
    ws_sender
        .send(Message::Text(auth_json))
        .await
        .map_err(|e| TransportError::AuthenticationFailed(format!("failed to send auth: {}", e)))?;

    let auth_timeout =
        tokio::time::timeout(Duration::from_secs(10), ws_receiver.next()).await;
    let response = match auth_timeout {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<AuthResponse>(&text)
            .map_err(|e| TransportError::AuthenticationFailed(format!("invalid auth response: {}", e)))?,
        Ok(Some(Ok(Message::Close(_)))) => {
            return Err(TransportError::AuthenticationFailed(
                "server closed connection during auth".to_string(),
            ))
        }
        Ok(Some(Ok(_))) => {
            return Err(TransportError::AuthenticationFailed(
                "unexpected message type during auth".to_string(),
            ))
        }
        Ok(Some(Err(e))) => {
            return Err(TransportError::AuthenticationFailed(format!(
                "websocket error during auth: {}",
                e
            )))
        }
        Ok(None) => {
            return Err(TransportError::AuthenticationFailed(
                "connection closed during auth".to_string(),
            ))
        }
        Err(_) => return Err(TransportError::Timeout),
    };

    if !response.success {
        let reason = response
            .error
            .unwrap_or_else(|| "unknown authentication error".to_string());
        return Err(TransportError::AuthenticationFailed(reason));
    }
    info!(
        "[WS:CLIENT] {} authenticated as {:?} (connection {})",
        kind.namespace(),
        response.user_id,
        connection_id
    );
    connected.store(true, Ordering::SeqCst);

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    let writer_flag = connected.clone();
    tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                warn!("[WS:CLIENT] send failed: {}", e);
                break;
            }
        }
        writer_flag.store(false, Ordering::SeqCst);
    });

    let reader_flag = connected.clone();
    let conn_id = connection_id.to_string();
    tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => match parse_frame(kind, &text) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            // receiver dropped: nothing is consuming this channel anymore
                            break;
                        }
                    }
                    Err(e) => warn!(
                        "[WS:CLIENT] {} unknown frame skipped: {}",
                        kind.namespace(),
                        e
                    ),
                },
                Ok(Message::Close(_)) => {
                    info!("[WS:CLIENT] {} closed by server", kind.namespace());
                    break;
                }
                Ok(_) => {
                    // ignore binary, ping, pong
                }
                Err(e) => {
                    warn!("[WS:CLIENT] {} websocket error: {}", kind.namespace(), e);
                    break;
                }
            }
        }
        reader_flag.store(false, Ordering::SeqCst);
        info!(
            "[WS:CLIENT] {} read loop ended (connection {})",
            kind.namespace(),
            conn_id
        );
    });

    Ok(outgoing_tx)
}

fn parse_frame(kind: ChannelKind, text: &str) -> Result<ServerEvent, String> {
    match kind {
        ChannelKind::Messages => serde_json::from_str::<GroupServerEvent>(text)
            .map(ServerEvent::Group)
            .map_err(|e| e.to_string()),
        ChannelKind::Conversations => serde_json::from_str::<ConversationServerEvent>(text)
            .map(ServerEvent::Conversation)
            .map_err(|e| e.to_string()),
        ChannelKind::Notifications => serde_json::from_str::<NotificationServerEvent>(text)
            .map(ServerEvent::Notification)
            .map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::services::events::GroupClientEvent;

    fn test_config() -> ClientConfig {
        ClientConfig {
            api_base_url: "http://127.0.0.1:1/api".to_string(),
            socket_base_url: "ws://127.0.0.1:1".to_string(),
            offline_db_path: "sqlite::memory:".to_string(),
            static_cache_version: "v1".to_string(),
            typing_expiry_ms: 2000,
            poll_interval_secs: 60,
            keyring_fallback: false,
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent_per_kind() {
        let mut registry = ChannelRegistry::new(&test_config());
        registry.set_retry_policy(1, Duration::from_millis(10));

        // Port 1 refuses connections, so this degrades to the polling
        // fallback; the registry still owns exactly one connection.
        let first = registry
            .connect(ChannelKind::Messages, "token")
            .await
            .unwrap();
        let second = registry
            .connect(ChannelKind::Messages, "token")
            .await
            .unwrap();
        assert_eq!(first.connection_id(), second.connection_id());
        assert!(registry.is_connected(ChannelKind::Messages));
    }

    #[tokio::test]
    async fn disconnect_clears_the_slot() {
        let mut registry = ChannelRegistry::new(&test_config());
        registry.set_retry_policy(1, Duration::from_millis(10));

        let first = registry
            .connect(ChannelKind::Messages, "token")
            .await
            .unwrap();
        registry.disconnect(ChannelKind::Messages);
        assert!(!registry.is_connected(ChannelKind::Messages));

        let second = registry
            .connect(ChannelKind::Messages, "token")
            .await
            .unwrap();
        assert_ne!(first.connection_id(), second.connection_id());
    }

    #[tokio::test]
    async fn emit_serializes_tagged_frames() {
        let (handle, mut rx) = ChannelHandle::detached(ChannelKind::Messages);
        handle
            .emit(&GroupClientEvent::Typing {
                group_id: "g1".to_string(),
                is_typing: true,
            })
            .unwrap();
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "typing");
        assert_eq!(value["data"]["groupId"], "g1");
        assert_eq!(value["data"]["isTyping"], true);
    }

    #[tokio::test]
    async fn join_room_tracks_membership_and_emits_subscription() {
        let (handle, mut rx) = ChannelHandle::detached(ChannelKind::Conversations);
        handle.join_room("c9").unwrap();
        assert_eq!(handle.joined_rooms(), vec!["c9".to_string()]);

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "joinConversation");
        assert_eq!(value["data"]["conversationId"], "c9");

        handle.leave_room("c9").unwrap();
        assert!(handle.joined_rooms().is_empty());
    }

    #[tokio::test]
    async fn notification_channel_refuses_rooms() {
        let (handle, _rx) = ChannelHandle::detached(ChannelKind::Notifications);
        assert!(handle.join_room("anything").is_err());
    }
}
