use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::error::{Error, Result};
use crate::types::{StoredMessage, StoredPushSubscription};

/// Age beyond which stored entries are treated as expired. Applied lazily on
/// every read and write; there is no background sweeper.
pub const RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Keyed storage of JSON strings. The relay only ever needs `get`/`put`, so
/// the message and subscription stores stay backend-agnostic: tests run
/// against [`MemoryKv`], production against [`PostgresKv`].
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Storage("kv lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::Storage("kv lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

pub struct PostgresKv {
    pool: PgPool,
}

impl PostgresKv {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for PostgresKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Conversation storage: one JSON array of messages per domain listing.
#[derive(Clone)]
pub struct MessageStore {
    kv: Arc<dyn KvStore>,
}

impl MessageStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(domain: &str) -> String {
        format!("messages:{domain}")
    }

    /// Appends a message and prunes expired entries in the same write.
    ///
    /// This is read-modify-write without compare-and-swap: two concurrent
    /// appends to the same key can lose one update. Accepted at this
    /// traffic level; see DESIGN.md.
    pub async fn append(&self, domain: &str, message: StoredMessage) -> Result<()> {
        let key = Self::key(domain);
        let mut messages = self.load(&key).await?;
        messages.push(message);
        let horizon = Utc::now().timestamp_millis() - RETENTION_MS;
        messages.retain(|m| m.timestamp > horizon);
        let payload =
            serde_json::to_string(&messages).map_err(|e| Error::Storage(e.to_string()))?;
        self.kv.put(&key, &payload).await
    }

    /// Messages for a domain with `timestamp > since` (strict), expired
    /// entries excluded, ascending by timestamp. When `session_id` is given,
    /// only that session's thread is returned.
    pub async fn query(
        &self,
        domain: &str,
        session_id: Option<&str>,
        since: i64,
    ) -> Result<Vec<StoredMessage>> {
        let mut messages = self.load(&Self::key(domain)).await?;
        let horizon = Utc::now().timestamp_millis() - RETENTION_MS;
        messages.retain(|m| m.timestamp > horizon);
        if let Some(session_id) = session_id {
            messages.retain(|m| m.session_id == session_id);
        }
        messages.retain(|m| m.timestamp > since);
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn load(&self, key: &str) -> Result<Vec<StoredMessage>> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw)
            .map_err(|e| Error::Storage(format!("invalid stored message data: {e}")))
    }
}

/// Browser push subscriptions, one per `(domain, session)` pair.
#[derive(Clone)]
pub struct PushStore {
    kv: Arc<dyn KvStore>,
}

impl PushStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(domain: &str, session_id: &str) -> String {
        format!("push:{domain}:{session_id}")
    }

    pub async fn register(&self, domain: &str, session_id: &str, subscription: Value) -> Result<()> {
        let entry = StoredPushSubscription {
            subscription,
            stored_at: Utc::now().timestamp_millis(),
        };
        let payload = serde_json::to_string(&entry).map_err(|e| Error::Storage(e.to_string()))?;
        self.kv.put(&Self::key(domain, session_id), &payload).await
    }

    /// Returns the registered subscription, treating entries past the
    /// retention horizon as absent.
    pub async fn lookup(
        &self,
        domain: &str,
        session_id: &str,
    ) -> Result<Option<StoredPushSubscription>> {
        let Some(raw) = self.kv.get(&Self::key(domain, session_id)).await? else {
            return Ok(None);
        };
        let entry: StoredPushSubscription = serde_json::from_str(&raw)
            .map_err(|e| Error::Storage(format!("invalid stored subscription: {e}")))?;
        if entry.stored_at <= Utc::now().timestamp_millis() - RETENTION_MS {
            return Ok(None);
        }
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(text: &str, session_id: &str, timestamp: i64) -> StoredMessage {
        StoredMessage {
            text: text.to_string(),
            is_user: false,
            timestamp,
            session_id: session_id.to_string(),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test]
    async fn append_then_query_returns_the_message_once() {
        let store = MessageStore::new(Arc::new(MemoryKv::new()));
        let now = now_ms();

        store.append("d1", message("hello", "s1", now)).await.unwrap();

        let messages = store.query("d1", None, 0).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello");
        assert_eq!(messages[0].session_id, "s1");
    }

    #[tokio::test]
    async fn query_sorts_ascending_by_timestamp() {
        let store = MessageStore::new(Arc::new(MemoryKv::new()));
        let now = now_ms();

        store.append("d1", message("third", "s1", now)).await.unwrap();
        store
            .append("d1", message("first", "s1", now - 20))
            .await
            .unwrap();
        store
            .append("d1", message("second", "s1", now - 10))
            .await
            .unwrap();

        let texts: Vec<String> = store
            .query("d1", None, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn expired_messages_are_excluded_on_read() {
        let kv = Arc::new(MemoryKv::new());
        let store = MessageStore::new(kv.clone());
        let now = now_ms();

        let stale = message("stale", "s1", now - RETENTION_MS - 1_000);
        let fresh = message("fresh", "s1", now);
        kv.put(
            "messages:d1",
            &serde_json::to_string(&vec![stale, fresh]).unwrap(),
        )
        .await
        .unwrap();

        let messages = store.query("d1", None, 0).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "fresh");
    }

    #[tokio::test]
    async fn append_prunes_expired_entries_from_the_stored_list() {
        let kv = Arc::new(MemoryKv::new());
        let store = MessageStore::new(kv.clone());
        let now = now_ms();

        let stale = message("stale", "s1", now - RETENTION_MS - 1_000);
        kv.put("messages:d1", &serde_json::to_string(&vec![stale]).unwrap())
            .await
            .unwrap();

        store.append("d1", message("fresh", "s1", now)).await.unwrap();

        let raw = kv.get("messages:d1").await.unwrap().unwrap();
        let stored: Vec<StoredMessage> = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text, "fresh");
    }

    #[tokio::test]
    async fn since_filter_is_strictly_greater_than() {
        let store = MessageStore::new(Arc::new(MemoryKv::new()));
        let now = now_ms();

        store.append("d1", message("at", "s1", now)).await.unwrap();
        store
            .append("d1", message("after", "s1", now + 1))
            .await
            .unwrap();

        let messages = store.query("d1", None, now).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "after");

        assert!(store.query("d1", None, now + 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_filter_narrows_to_one_thread() {
        let store = MessageStore::new(Arc::new(MemoryKv::new()));
        let now = now_ms();

        store.append("d1", message("mine", "s1", now)).await.unwrap();
        store
            .append("d1", message("other", "s2", now + 1))
            .await
            .unwrap();

        let messages = store.query("d1", Some("s1"), 0).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "mine");
    }

    #[tokio::test]
    async fn missing_key_reads_as_empty() {
        let store = MessageStore::new(Arc::new(MemoryKv::new()));
        assert!(store.query("nowhere", None, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_stored_data_is_a_storage_error() {
        let kv = Arc::new(MemoryKv::new());
        let store = MessageStore::new(kv.clone());
        kv.put("messages:d1", "not json").await.unwrap();

        let err = store.query("d1", None, 0).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let err = store.append("d1", message("x", "s1", now_ms())).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn push_subscription_round_trip() {
        let store = PushStore::new(Arc::new(MemoryKv::new()));
        store
            .register("d1", "s1", json!({ "endpoint": "https://push.example/abc" }))
            .await
            .unwrap();

        let entry = store.lookup("d1", "s1").await.unwrap().unwrap();
        assert_eq!(
            entry.subscription["endpoint"],
            json!("https://push.example/abc")
        );
        assert!(store.lookup("d1", "s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_push_subscription_reads_as_absent() {
        let kv = Arc::new(MemoryKv::new());
        let store = PushStore::new(kv.clone());
        let entry = StoredPushSubscription {
            subscription: json!({ "endpoint": "https://push.example/abc" }),
            stored_at: now_ms() - RETENTION_MS - 1_000,
        };
        kv.put("push:d1:s1", &serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();

        assert!(store.lookup("d1", "s1").await.unwrap().is_none());
    }
}
