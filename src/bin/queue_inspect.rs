use workhub_sync::client::config::ClientConfig;
use workhub_sync::client::services::offline::OfflineStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ClientConfig::from_env();
    println!("Connecting to {}", cfg.offline_db_path);
    let store = OfflineStore::open(&cfg.offline_db_path).await?;

    println!("\n-- offline_requests --");
    let pending = store.pending().await?;
    for entry in pending.iter() {
        println!(
            "id={} method={} url={} headers={} body_len={} created_at={}",
            entry.id,
            entry.method,
            entry.url,
            entry.headers.len(),
            entry.body.as_deref().map(str::len).unwrap_or(0),
            entry.created_at
        );
    }
    if pending.is_empty() {
        println!("(empty)");
    }

    println!("\n-- api_cache --");
    println!("entries={}", store.api_cache_len().await?);
    Ok(())
}
