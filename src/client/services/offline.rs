//! Durable offline state: the append-only log of mutating requests awaiting
//! replay, plus the two disjoint response-cache namespaces (API and static
//! assets). Backed by a local SQLite database so nothing is lost across
//! restarts.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;

use anyhow::Result;
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// One logged mutation, exactly as it failed to send.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: i64,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub created_at: i64,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub remaining: usize,
    pub halted_on: Option<i64>,
}

#[derive(Clone)]
pub struct OfflineStore {
    pool: SqlitePool,
}

impl OfflineStore {
    pub async fn open(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        // a single connection keeps every query on the same in-memory db
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS offline_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                method TEXT NOT NULL,
                headers TEXT NOT NULL,
                body TEXT,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS api_cache (
                url TEXT PRIMARY KEY,
                status INTEGER NOT NULL,
                body TEXT NOT NULL,
                fetched_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS static_cache (
                url TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                content_type TEXT NOT NULL,
                body BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a failed mutation to the log. Returns the assigned entry id.
    pub async fn enqueue(
        &self,
        url: &str,
        method: &str,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> Result<i64> {
        let headers_json = serde_json::to_string(headers)?;
        let result = sqlx::query(
            "INSERT INTO offline_requests (url, method, headers, body, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(url)
        .bind(method)
        .bind(headers_json)
        .bind(body)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Queued entries in insertion (replay) order.
    pub async fn pending(&self) -> Result<Vec<QueuedRequest>> {
        let rows = sqlx::query(
            "SELECT id, url, method, headers, body, created_at
             FROM offline_requests ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let headers_json: String = row.try_get("headers")?;
            entries.push(QueuedRequest {
                id: row.try_get("id")?,
                url: row.try_get("url")?,
                method: row.try_get("method")?,
                headers: serde_json::from_str(&headers_json).unwrap_or_default(),
                body: row.try_get("body")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(entries)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM offline_requests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replay the log in FIFO order through `deliver`. Each entry is removed
    /// only after a confirmed successful delivery; the first failure halts
    /// the whole pass so mutation ordering is preserved: a later entry is
    /// never attempted past a failed one.
    pub async fn replay<F, Fut>(&self, mut deliver: F) -> Result<ReplayReport>
    where
        F: FnMut(QueuedRequest) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let entries = self.pending().await?;
        let total = entries.len();
        let mut replayed = 0usize;
        let mut halted_on = None;

        for entry in entries {
            let id = entry.id;
            match deliver(entry).await {
                Ok(()) => {
                    self.delete(id).await?;
                    replayed += 1;
                }
                Err(e) => {
                    info!("[OFFLINE] replay halted on entry {}: {}", id, e);
                    halted_on = Some(id);
                    break;
                }
            }
        }
        Ok(ReplayReport {
            replayed,
            remaining: total - replayed,
            halted_on,
        })
    }

    /// Overwrite the last-known-good API response for this URL.
    pub async fn cache_api_response(&self, url: &str, status: u16, body: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_cache (url, status, body, fetched_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(url) DO UPDATE SET
                status = excluded.status,
                body = excluded.body,
                fetched_at = excluded.fetched_at",
        )
        .bind(url)
        .bind(status as i64)
        .bind(body)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cached_api_response(&self, url: &str) -> Result<Option<(u16, String)>> {
        let row = sqlx::query("SELECT status, body FROM api_cache WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let status: i64 = row.try_get("status")?;
                let body: String = row.try_get("body")?;
                Ok(Some((status as u16, body)))
            }
            None => Ok(None),
        }
    }

    pub async fn cache_static(
        &self,
        url: &str,
        version: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO static_cache (url, version, content_type, body) VALUES (?, ?, ?, ?)
             ON CONFLICT(url) DO UPDATE SET
                version = excluded.version,
                content_type = excluded.content_type,
                body = excluded.body",
        )
        .bind(url)
        .bind(version)
        .bind(content_type)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cached_static(&self, url: &str) -> Result<Option<(String, Vec<u8>)>> {
        let row = sqlx::query("SELECT content_type, body FROM static_cache WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let content_type: String = row.try_get("content_type")?;
                let body: Vec<u8> = row.try_get("body")?;
                Ok(Some((content_type, body)))
            }
            None => Ok(None),
        }
    }

    /// Activate a deployed static-cache version: every row from another
    /// version is purged. The API namespace is left untouched.
    pub async fn activate(&self, version: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM static_cache WHERE version != ?")
            .bind(version)
            .execute(&self.pool)
            .await?;
        let purged = result.rows_affected();
        info!(
            "[OFFLINE] static cache activated at version {} ({} stale entries purged)",
            version, purged
        );
        Ok(purged)
    }

    pub async fn api_cache_len(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM api_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn entries_replay_in_insertion_order() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        store
            .enqueue("http://x/tasks", "POST", &no_headers(), Some("{\"n\":1}"))
            .await
            .unwrap();
        store
            .enqueue("http://x/tasks/1", "PUT", &no_headers(), Some("{\"n\":2}"))
            .await
            .unwrap();

        let mut seen = Vec::new();
        let report = store
            .replay(|entry| {
                seen.push(entry.url.clone());
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["http://x/tasks", "http://x/tasks/1"]);
        assert_eq!(report.replayed, 2);
        assert_eq!(report.remaining, 0);
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_halts_on_first_failure_and_keeps_order() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        let a = store
            .enqueue("http://x/a", "POST", &no_headers(), None)
            .await
            .unwrap();
        let b = store
            .enqueue("http://x/b", "POST", &no_headers(), None)
            .await
            .unwrap();
        let c = store
            .enqueue("http://x/c", "POST", &no_headers(), None)
            .await
            .unwrap();
        assert!(a < b && b < c);

        let report = store
            .replay(|entry| async move {
                if entry.url.ends_with("/b") {
                    anyhow::bail!("still unreachable");
                }
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.halted_on, Some(b));

        // B and C remain, in that order; C was never attempted past B
        let pending = store.pending().await.unwrap();
        let urls: Vec<&str> = pending.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["http://x/b", "http://x/c"]);
    }

    #[tokio::test]
    async fn queued_entries_keep_headers_and_body() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        store
            .enqueue("http://x/tasks", "POST", &headers, Some("{\"title\":\"t\"}"))
            .await
            .unwrap();

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(pending[0].body.as_deref(), Some("{\"title\":\"t\"}"));
        assert!(pending[0].created_at > 0);
    }

    #[tokio::test]
    async fn api_cache_overwrites_per_url() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        store
            .cache_api_response("http://x/groups", 200, "[1]")
            .await
            .unwrap();
        store
            .cache_api_response("http://x/groups", 200, "[1,2]")
            .await
            .unwrap();
        let (status, body) = store
            .cached_api_response("http://x/groups")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "[1,2]");
        assert_eq!(store.api_cache_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn activation_purges_only_stale_static_entries() {
        let store = OfflineStore::open_in_memory().await.unwrap();
        store
            .cache_static("http://x/app.js", "v1", "text/javascript", b"old")
            .await
            .unwrap();
        store
            .cache_static("http://x/app.css", "v2", "text/css", b"new")
            .await
            .unwrap();
        store
            .cache_api_response("http://x/api/groups", 200, "[]")
            .await
            .unwrap();

        let purged = store.activate("v2").await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.cached_static("http://x/app.js").await.unwrap().is_none());
        assert!(store.cached_static("http://x/app.css").await.unwrap().is_some());
        // the api namespace is a separate store
        assert!(store
            .cached_api_response("http://x/api/groups")
            .await
            .unwrap()
            .is_some());
    }
}
