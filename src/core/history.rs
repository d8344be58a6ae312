//! Best-effort conversation persistence.
//!
//! Each configuration (model, endpoint, key) gets its own record in a
//! key-value store. Only user and assistant messages with visible text are
//! kept; entries older than the configured depth are pruned on load. Storage
//! failures are logged and never interrupt the conversation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::core::config::Config;
use crate::core::message::{Message, Role};

const MILLIS_PER_HOUR: i64 = 60 * 60 * 1000;
const KEY_HASH_LEN: usize = 12;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, String>;
    async fn put(&self, key: &str, value: Value) -> Result<(), String>;
    async fn delete(&self, key: &str) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `history/` under the platform data directory.
    pub fn default_location() -> Option<Self> {
        Config::project_dirs()
            .map(|dirs| Self::new(dirs.data_dir().join("history")))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn write_atomically(dir: &Path, path: &Path, contents: &[u8]) -> Result<(), String> {
    use std::io::Write;

    std::fs::create_dir_all(dir).map_err(|err| err.to_string())?;
    let mut temp_file = NamedTempFile::new_in(dir).map_err(|err| err.to_string())?;
    temp_file.write_all(contents).map_err(|err| err.to_string())?;
    temp_file.flush().map_err(|err| err.to_string())?;
    temp_file
        .persist(path)
        .map(|_| ())
        .map_err(|err| err.error.to_string())
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, String> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| err.to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), String> {
        let contents = serde_json::to_vec_pretty(&value).map_err(|err| err.to_string())?;
        let dir = self.dir.clone();
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &contents))
            .await
            .map_err(|err| err.to_string())?
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: Message,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredHistoryRecord {
    pub storage_key: String,
    pub messages: Vec<StoredMessage>,
    pub last_updated: i64,
}

fn sanitize(value: &str) -> String {
    if value.is_empty() {
        return "default".to_string();
    }
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// `<model>_<base url>_<key hash>`, so separate configurations keep
/// separate histories without the key itself touching disk.
pub fn storage_key(model: &str, base_url: &str, api_key: Option<&str>) -> String {
    let key_hash = match api_key.filter(|key| !key.is_empty()) {
        Some(key) => {
            let digest = Sha256::digest(key.as_bytes());
            let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
            hex[..KEY_HASH_LEN].to_string()
        }
        None => "no-key".to_string(),
    };
    format!("{}_{}_{}", sanitize(model), sanitize(base_url), key_hash)
}

fn is_persistable(message: &Message) -> bool {
    matches!(message.role, Role::User | Role::Assistant) && message.display_text().is_some()
}

/// Tool replies are never stored, so neither are the calls they answer.
fn without_tool_plumbing(mut message: Message) -> Message {
    message.tool_calls.clear();
    message.tool_call_id = None;
    message
}

pub struct ChatHistory {
    store: Arc<dyn KeyValueStore>,
    storage_key: String,
    depth_hours: u64,
}

impl ChatHistory {
    pub fn new(store: Arc<dyn KeyValueStore>, storage_key: String, depth_hours: u64) -> Self {
        Self {
            store,
            storage_key,
            depth_hours,
        }
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub async fn save(&self, messages: &[Message]) {
        let now = Utc::now().timestamp_millis();
        let stored: Vec<StoredMessage> = messages
            .iter()
            .filter(|message| is_persistable(message))
            .map(|message| StoredMessage {
                timestamp: message.timestamp.unwrap_or(now),
                message: without_tool_plumbing(message.clone()),
            })
            .collect();
        if stored.is_empty() {
            return;
        }

        let record = StoredHistoryRecord {
            storage_key: self.storage_key.clone(),
            messages: stored,
            last_updated: now,
        };
        if let Err(err) = self.write(&record).await {
            warn!(key = %self.storage_key, error = %err, "Failed to save chat history");
        }
    }

    async fn write(&self, record: &StoredHistoryRecord) -> Result<(), String> {
        let value = serde_json::to_value(record).map_err(|err| err.to_string())?;
        self.store.put(&self.storage_key, value).await
    }

    /// Messages younger than the history depth, oldest first. Pruned entries
    /// are removed from the store as well.
    pub async fn load(&self) -> Vec<Message> {
        let record = match self.store.get(&self.storage_key).await {
            Ok(Some(value)) => match serde_json::from_value::<StoredHistoryRecord>(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(key = %self.storage_key, error = %err, "Ignoring unreadable chat history");
                    return Vec::new();
                }
            },
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(key = %self.storage_key, error = %err, "Failed to load chat history");
                return Vec::new();
            }
        };

        let now = Utc::now().timestamp_millis();
        let max_age = i64::try_from(self.depth_hours)
            .unwrap_or(i64::MAX / MILLIS_PER_HOUR)
            .saturating_mul(MILLIS_PER_HOUR);
        let original_len = record.messages.len();
        let fresh: Vec<StoredMessage> = record
            .messages
            .into_iter()
            .filter(|item| now - item.timestamp <= max_age)
            .collect();

        if fresh.len() < original_len {
            debug!(
                key = %self.storage_key,
                pruned = original_len - fresh.len(),
                "Pruned expired chat history"
            );
            let outcome = if fresh.is_empty() {
                self.store.delete(&self.storage_key).await
            } else {
                self.write(&StoredHistoryRecord {
                    storage_key: self.storage_key.clone(),
                    messages: fresh.clone(),
                    last_updated: now,
                })
                .await
            };
            if let Err(err) = outcome {
                warn!(key = %self.storage_key, error = %err, "Failed to prune chat history");
            }
        }

        fresh
            .into_iter()
            .map(|item| {
                let mut message = without_tool_plumbing(item.message);
                message.timestamp = Some(item.timestamp);
                message
            })
            .collect()
    }

    pub async fn clear(&self) {
        if let Err(err) = self.store.delete(&self.storage_key).await {
            warn!(key = %self.storage_key, error = %err, "Failed to clear chat history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{ToolArguments, ToolCallRef};
    use serde_json::json;
    use tempfile::TempDir;

    fn at(mut message: Message, timestamp: i64) -> Message {
        message.timestamp = Some(timestamp);
        message
    }

    #[test]
    fn storage_keys_separate_configurations() {
        let a = storage_key("gpt-4o-mini", "http://127.0.0.1:1234/v1", Some("sk-one"));
        let b = storage_key("gpt-4o-mini", "http://127.0.0.1:1234/v1", Some("sk-two"));
        assert_ne!(a, b);
        assert_eq!(a, storage_key("gpt-4o-mini", "http://127.0.0.1:1234/v1", Some("sk-one")));
        assert!(a.starts_with("gpt_4o_mini_http___127_0_0_1_1234_v1_"));
        assert!(!a.contains("sk-one"));
        assert_eq!(storage_key("", "", None), "default_default_no-key");
    }

    #[tokio::test]
    async fn save_keeps_only_visible_conversation() {
        let store = Arc::new(MemoryStore::new());
        let history = ChatHistory::new(store.clone(), "k".to_string(), 24);
        let now = Utc::now().timestamp_millis();

        history
            .save(&[
                Message::system("prompt"),
                at(Message::user("hi"), now - 1_000),
                Message::assistant_tool_calls(
                    None,
                    vec![ToolCallRef::new("c", "echo", ToolArguments::default())],
                ),
                Message::tool("c", "{}"),
                at(Message::assistant("hello"), now - 500),
            ])
            .await;

        let stored = store.get("k").await.expect("get").expect("record");
        assert_eq!(stored["storageKey"], json!("k"));
        let records = stored["messages"].as_array().expect("messages");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["timestamp"], json!(now - 1_000));

        let loaded = history.load().await;
        let texts: Vec<Option<&str>> = loaded.iter().map(|m| m.content.as_deref()).collect();
        assert_eq!(texts, vec![Some("hi"), Some("hello")]);
        assert_eq!(loaded[0].timestamp, Some(now - 1_000));
    }

    #[tokio::test]
    async fn answered_tool_calls_are_stored_as_plain_text() {
        let store = Arc::new(MemoryStore::new());
        let history = ChatHistory::new(store.clone(), "k".to_string(), 24);

        history
            .save(&[
                Message::user("check"),
                Message::assistant_tool_calls(
                    Some("Let me check".to_string()),
                    vec![ToolCallRef::new("c1", "echo", ToolArguments::default())],
                ),
                Message::tool("c1", "{}"),
                Message::assistant("echoed"),
            ])
            .await;

        let stored = store.get("k").await.expect("get").expect("record");
        assert!(stored["messages"][1]["message"].get("tool_calls").is_none());

        let loaded = history.load().await;
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].content.as_deref(), Some("Let me check"));
        assert!(loaded.iter().all(|m| m.tool_calls.is_empty() && m.tool_call_id.is_none()));
    }

    #[tokio::test]
    async fn load_prunes_expired_messages() {
        let store = Arc::new(MemoryStore::new());
        let history = ChatHistory::new(store.clone(), "k".to_string(), 1);
        let now = Utc::now().timestamp_millis();

        history
            .save(&[
                at(Message::user("old"), now - 2 * MILLIS_PER_HOUR),
                at(Message::user("new"), now - 60_000),
            ])
            .await;

        let loaded = history.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content.as_deref(), Some("new"));

        let stored = store.get("k").await.expect("get").expect("record");
        assert_eq!(stored["messages"].as_array().map(Vec::len), Some(1));

        let expired = ChatHistory::new(store.clone(), "gone".to_string(), 1);
        expired
            .save(&[at(Message::user("ancient"), now - 5 * MILLIS_PER_HOUR)])
            .await;
        assert!(expired.load().await.is_empty());
        assert!(store.get("gone").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn file_store_round_trips_and_clears() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(FileStore::new(temp_dir.path().join("history")));
        let history = ChatHistory::new(store.clone(), storage_key("m", "u", None), 24);

        assert!(history.load().await.is_empty());
        history.save(&[Message::user("persist me")]).await;
        assert!(temp_dir
            .path()
            .join("history")
            .join(format!("{}.json", history.storage_key()))
            .exists());

        let loaded = history.load().await;
        assert_eq!(loaded[0].content.as_deref(), Some("persist me"));

        history.clear().await;
        assert!(history.load().await.is_empty());
        history.clear().await;
    }

    #[tokio::test]
    async fn unreadable_record_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.put("k", json!({"nope": true})).await.expect("put");
        let history = ChatHistory::new(store, "k".to_string(), 24);
        assert!(history.load().await.is_empty());
    }
}
