//! REST gateway with offline interception. Mutations that fail at the
//! network boundary are persisted for FIFO replay and acknowledged with a
//! synthetic "queued" response; reads degrade to the last-known-good cached
//! copy. HTTP-level rejections (authorization, validation) pass through
//! untouched; only transport failures are swallowed into the queue.

use std::collections::HashMap;

use anyhow::Result;
use log::{error, info, warn};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use url::Url;

use crate::client::config::ClientConfig;
use crate::client::services::offline::{OfflineStore, QueuedRequest, ReplayReport};
use crate::common::models::{Attachment, Conversation};

/// Page-to-worker control surface: trigger a replay pass or activate a newly
/// installed static-cache version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    SyncOffline,
    SkipWaiting,
}

impl ControlMessage {
    /// Accepts both raw forms the page sends: the bare `SYNC_OFFLINE` string
    /// and the structured `{"type":"SKIP_WAITING"}` object.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "SYNC_OFFLINE" => Some(ControlMessage::SyncOffline),
            other => {
                let value: Value = serde_json::from_str(other).ok()?;
                match value.get("type").and_then(Value::as_str) {
                    Some("SYNC_OFFLINE") => Some(ControlMessage::SyncOffline),
                    Some("SKIP_WAITING") => Some(ControlMessage::SkipWaiting),
                    _ => None,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// "Accepted but not yet confirmed": the request is in the offline log,
    /// not delivered.
    fn queued_ack() -> Self {
        Self {
            status: 200,
            body: json!({"offline": true, "queued": true}),
        }
    }

    fn offline_error(error: &str) -> Self {
        Self {
            status: 503,
            body: json!({"offline": true, "error": error}),
        }
    }

    pub fn is_offline_ack(&self) -> bool {
        self.body.get("queued").and_then(Value::as_bool) == Some(true)
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    offline: OfflineStore,
    static_version: String,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, offline: OfflineStore) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: None,
            offline,
            static_version: config.static_cache_version.clone(),
        }
    }

    pub fn set_token(&mut self, token: &str) {
        self.token = Some(token.to_string());
    }

    pub fn offline(&self) -> &OfflineStore {
        &self.offline
    }

    fn absolute_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    fn request_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        if let Some(token) = &self.token {
            headers.insert("authorization".to_string(), format!("Bearer {}", token));
        }
        headers
    }

    /// Network-first API read: a live response overwrites the cached copy;
    /// on transport failure the cache answers, else a synthetic 503.
    pub async fn get_json(&self, path: &str) -> Result<ApiResponse> {
        let url = self.absolute_url(path);
        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                if (200..300).contains(&status) {
                    if let Err(e) = self.offline.cache_api_response(&url, status, &text).await {
                        // cache maintenance failures are diagnostics only
                        error!("[OFFLINE] failed to cache {}: {}", url, e);
                    }
                }
                Ok(ApiResponse {
                    status,
                    body: parse_body(&text),
                })
            }
            Err(e) => {
                warn!("[OFFLINE] GET {} unreachable: {}", url, e);
                match self.offline.cached_api_response(&url).await {
                    Ok(Some((status, body))) => {
                        info!("[OFFLINE] serving cached copy of {}", url);
                        Ok(ApiResponse {
                            status,
                            body: parse_body(&body),
                        })
                    }
                    Ok(None) => Ok(ApiResponse::offline_error(&e.to_string())),
                    Err(cache_err) => {
                        error!("[OFFLINE] cache lookup for {} failed: {}", url, cache_err);
                        Ok(ApiResponse::offline_error(&e.to_string()))
                    }
                }
            }
        }
    }

    /// Mutation path. A transport failure persists the full request into the
    /// offline log in the same failure handler, then acknowledges with the
    /// synthetic queued response. Server rejections propagate as-is.
    pub async fn send(&self, method: &str, path: &str, body: Option<Value>) -> Result<ApiResponse> {
        let url = self.absolute_url(path);
        let http_method = reqwest::Method::from_bytes(method.as_bytes())?;
        let mut request = self.http.request(http_method, &url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let body_text = body.as_ref().map(|b| b.to_string());
        if let Some(b) = &body {
            request = request.json(b);
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                Ok(ApiResponse {
                    status,
                    body: parse_body(&text),
                })
            }
            Err(e) => {
                warn!("[OFFLINE] {} {} unreachable, queuing: {}", method, url, e);
                match self
                    .offline
                    .enqueue(&url, method, &self.request_headers(), body_text.as_deref())
                    .await
                {
                    Ok(id) => info!("[OFFLINE] queued request {} as entry {}", url, id),
                    Err(log_err) => {
                        // never surfaced to the caller as a user-facing error
                        error!("[OFFLINE] failed to persist queued request: {}", log_err)
                    }
                }
                Ok(ApiResponse::queued_ack())
            }
        }
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<ApiResponse> {
        self.send("POST", path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<ApiResponse> {
        self.send("PUT", path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send("DELETE", path, None).await
    }

    /// Replay the offline log in FIFO order. Halts at the first entry that
    /// cannot be delivered, leaving it and everything after it queued.
    pub async fn sync_offline(&self) -> Result<ReplayReport> {
        let report = self.offline.replay(|entry| self.deliver(entry)).await?;
        info!(
            "[OFFLINE] replay finished: {} delivered, {} remaining",
            report.replayed, report.remaining
        );
        Ok(report)
    }

    async fn deliver(&self, entry: QueuedRequest) -> Result<()> {
        let method = reqwest::Method::from_bytes(entry.method.as_bytes())?;
        let mut request = self.http.request(method, &entry.url);
        for (name, value) in &entry.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &entry.body {
            request = request.body(body.clone());
        }
        let resp = request.send().await?;
        if !resp.status().is_success() {
            // the prerequisite of this mutation may be gone server-side;
            // stalling the queue beats applying later writes out of order
            anyhow::bail!("replay rejected with status {}", resp.status());
        }
        Ok(())
    }

    pub async fn handle_control(&self, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::SyncOffline => {
                self.sync_offline().await?;
            }
            ControlMessage::SkipWaiting => {
                self.offline.activate(&self.static_version).await?;
            }
        }
        Ok(())
    }

    /// Cache-first static asset fetch. Only successful same-origin responses
    /// are cached.
    pub async fn fetch_static(&self, url: &str) -> Result<Option<(String, Vec<u8>)>> {
        if let Some(hit) = self.offline.cached_static(url).await? {
            return Ok(Some(hit));
        }
        match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let content_type = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let same_origin = self.same_origin(url);
                let bytes = resp.bytes().await?.to_vec();
                if same_origin {
                    if let Err(e) = self
                        .offline
                        .cache_static(url, &self.static_version, &content_type, &bytes)
                        .await
                    {
                        error!("[OFFLINE] failed to cache static {}: {}", url, e);
                    }
                }
                Ok(Some((content_type, bytes)))
            }
            Ok(resp) => {
                warn!("[OFFLINE] static fetch {} returned {}", url, resp.status());
                Ok(None)
            }
            Err(e) => {
                warn!("[OFFLINE] static fetch {} unreachable: {}", url, e);
                Ok(None)
            }
        }
    }

    /// Navigation fetch: on total failure, fall back to the cached root
    /// document.
    pub async fn fetch_document(&self, url: &str) -> Result<Option<(String, Vec<u8>)>> {
        if let Some(hit) = self.fetch_static(url).await? {
            return Ok(Some(hit));
        }
        if let Some(root) = self.root_document_url(url) {
            return self.offline.cached_static(&root).await;
        }
        Ok(None)
    }

    fn root_document_url(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let mut root = parsed.clone();
        root.set_path("/");
        root.set_query(None);
        root.set_fragment(None);
        Some(root.to_string())
    }

    fn same_origin(&self, url: &str) -> bool {
        let (Ok(base), Ok(target)) = (Url::parse(&self.base_url), Url::parse(url)) else {
            return false;
        };
        base.scheme() == target.scheme()
            && base.host_str() == target.host_str()
            && base.port_or_known_default() == target.port_or_known_default()
    }

    /// Out-of-band attachment upload. Binary payloads never ride the socket
    /// channels and never enter the offline queue; a transport failure here
    /// propagates to the caller.
    pub async fn upload_attachment(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Attachment> {
        let url = self.absolute_url("/attachments");
        let mut request = self
            .http
            .post(&url)
            .query(&[("filename", file_name), ("mime", mime_type)])
            .header(CONTENT_TYPE, mime_type)
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?.error_for_status()?;
        Ok(resp.json::<Attachment>().await?)
    }

    /// Idempotent get-or-create of the direct conversation with `user_id`.
    /// Needs a live response, so it bypasses the queue.
    pub async fn get_or_create_conversation(&self, user_id: &str) -> Result<Conversation> {
        let url = self.absolute_url("/conversations");
        let mut request = self.http.post(&url).json(&json!({"participantId": user_id}));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?.error_for_status()?;
        Ok(resp.json::<Conversation>().await?)
    }
}

fn parse_body(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Port 1 refuses connections, so every request is a transport failure.
    fn unreachable_client(offline: OfflineStore) -> ApiClient {
        let config = ClientConfig {
            api_base_url: "http://127.0.0.1:1/api".to_string(),
            socket_base_url: "ws://127.0.0.1:1".to_string(),
            offline_db_path: "sqlite::memory:".to_string(),
            static_cache_version: "v2".to_string(),
            typing_expiry_ms: 2000,
            poll_interval_secs: 3,
            keyring_fallback: false,
        };
        let mut client = ApiClient::new(&config, offline);
        client.set_token("tok-123");
        client
    }

    #[tokio::test]
    async fn failed_mutation_is_queued_and_acked() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        let client = unreachable_client(store);

        let resp = client
            .post("/tasks", json!({"title": "write spec"}))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["offline"], true);
        assert_eq!(resp.body["queued"], true);
        assert!(resp.is_offline_ack());

        let pending = client.offline().pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].method, "POST");
        assert_eq!(pending[0].url, "http://127.0.0.1:1/api/tasks");
        assert_eq!(
            pending[0].headers.get("authorization").map(String::as_str),
            Some("Bearer tok-123")
        );
        assert_eq!(pending[0].body.as_deref(), Some("{\"title\":\"write spec\"}"));
    }

    #[tokio::test]
    async fn offline_get_serves_cached_copy() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        store
            .cache_api_response("http://127.0.0.1:1/api/groups", 200, "[{\"id\":\"g1\"}]")
            .await
            .unwrap();
        let client = unreachable_client(store);

        let resp = client.get_json("/groups").await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body[0]["id"], "g1");
    }

    #[tokio::test]
    async fn offline_get_without_cache_is_synthetic_503() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        let client = unreachable_client(store);

        let resp = client.get_json("/groups").await.unwrap();
        assert_eq!(resp.status, 503);
        assert_eq!(resp.body["offline"], true);
        assert!(resp.body["error"].is_string());
    }

    #[tokio::test]
    async fn replay_against_dead_network_halts_on_first_entry() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        let client = unreachable_client(store);
        client.post("/tasks", json!({"n": 1})).await.unwrap();
        client.post("/tasks", json!({"n": 2})).await.unwrap();

        let report = client.sync_offline().await.unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.remaining, 2);
        assert!(report.halted_on.is_some());
        assert_eq!(client.offline().pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn navigation_falls_back_to_cached_root_document() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        store
            .cache_static("http://127.0.0.1:1/", "v2", "text/html", b"<html>app</html>")
            .await
            .unwrap();
        let client = unreachable_client(store);

        let (content_type, body) = client
            .fetch_document("http://127.0.0.1:1/projects/42")
            .await
            .unwrap()
            .expect("root fallback");
        assert_eq!(content_type, "text/html");
        assert_eq!(body, b"<html>app</html>");
    }

    #[test]
    fn control_messages_parse_from_both_raw_forms() {
        assert_eq!(
            ControlMessage::parse("SYNC_OFFLINE"),
            Some(ControlMessage::SyncOffline)
        );
        assert_eq!(
            ControlMessage::parse("{\"type\":\"SKIP_WAITING\"}"),
            Some(ControlMessage::SkipWaiting)
        );
        assert_eq!(ControlMessage::parse("{\"type\":\"NOPE\"}"), None);
    }

    #[tokio::test]
    async fn skip_waiting_activates_the_configured_version() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        store
            .cache_static("http://127.0.0.1:1/app.js", "v1", "text/javascript", b"old")
            .await
            .unwrap();
        let client = unreachable_client(store);

        client
            .handle_control(ControlMessage::SkipWaiting)
            .await
            .unwrap();
        assert!(client
            .offline()
            .cached_static("http://127.0.0.1:1/app.js")
            .await
            .unwrap()
            .is_none());
    }
}
