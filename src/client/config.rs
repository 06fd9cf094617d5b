use std::env;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub socket_base_url: String,
    pub offline_db_path: String,
    pub static_cache_version: String,
    pub typing_expiry_ms: u64,
    pub poll_interval_secs: u64,
    pub keyring_fallback: bool,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            api_base_url: env::var("API_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:4000/api".to_string()),
            socket_base_url: env::var("SOCKET_BASE_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:4000".to_string()),
            offline_db_path: env::var("OFFLINE_DB_PATH")
                .unwrap_or_else(|_| "sqlite:data/workhub_offline.db".to_string()),
            static_cache_version: env::var("STATIC_CACHE_VERSION")
                .unwrap_or_else(|_| "v1".to_string()),
            typing_expiry_ms: env::var("TYPING_EXPIRY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),
            poll_interval_secs: env::var("POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            keyring_fallback: env::var("KEYRING_FALLBACK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}
