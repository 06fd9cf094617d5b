use std::time::Duration;

use workhub_sync::client::config::ClientConfig;
use workhub_sync::client::services::group_sync::GroupChatSync;
use workhub_sync::client::services::offline::OfflineStore;
use workhub_sync::client::services::rest::ApiClient;
use workhub_sync::client::services::transport::{
    ChannelKind, ChannelRegistry, ServerEvent, TransportError,
};
use workhub_sync::client::utils::session_store::SessionStore;

// End-to-end probe against a dev backend: queue a mutation, replay it, bring
// up the group channel and drive one room. Works (degraded) with no backend
// at all, which is the interesting case for the offline path.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cfg = ClientConfig::from_env();
    let store = SessionStore::new(&cfg);
    let token = match store.load() {
        Some(token) => token,
        None => {
            let token = std::env::var("WORKHUB_TOKEN").unwrap_or_else(|_| "dev-token".to_string());
            if let Err(e) = store.save(&token) {
                println!("token not persisted: {}", e);
            }
            token
        }
    };

    let offline = OfflineStore::open(&cfg.offline_db_path).await?;
    let mut api = ApiClient::new(&cfg, offline);
    api.set_token(&token);

    let resp = api
        .post("/tasks", serde_json::json!({"title": "probe task"}))
        .await?;
    println!("POST /tasks -> {} {}", resp.status, resp.body);

    let report = api.sync_offline().await?;
    println!(
        "replay -> {} delivered, {} remaining (halted on {:?})",
        report.replayed, report.remaining, report.halted_on
    );

    let mut registry = ChannelRegistry::new(&cfg);
    let handle = match registry.connect(ChannelKind::Messages, &token).await {
        Ok(handle) => handle,
        Err(e @ TransportError::AuthenticationFailed(_)) => {
            // stale session: drop it so the next run starts from a fresh token
            let _ = store.clear();
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    let mut events = registry.take_events(ChannelKind::Messages);

    let group_id = std::env::var("PROBE_GROUP_ID").unwrap_or_else(|_| "g1".to_string());
    let mut sync = GroupChatSync::new(
        &group_id,
        "probe-user",
        handle,
        Duration::from_millis(cfg.typing_expiry_ms),
    );
    if let Err(e) = sync.load_history(&api).await {
        println!("history fetch failed: {}", e);
        let _ = sync.ingest_history(vec![]);
    }
    sync.keystroke();
    sync.send_message("Hello from sync_probe @[Ana](u2)", None, vec![])?;

    if let Some(events) = events.as_mut() {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(ServerEvent::Group(event))) => {
                sync.apply(event);
                println!("messages after push: {}", sync.messages().len());
            }
            Ok(Some(_)) | Ok(None) => println!("channel closed before a push arrived"),
            Err(_) => println!("no push within 5s (backend offline?)"),
        }
    }

    sync.unmount();
    registry.disconnect(ChannelKind::Messages);
    Ok(())
}
