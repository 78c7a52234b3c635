//! Dual-backend item persistence: a device-local JSON store and a
//! remote bearer-authenticated HTTP store behind one gateway.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use curio_core::{AppConfig, Item};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "curio-storage";

/// Fixed keys of the local key-value store.
const ITEMS_KEY: &str = "items.json";
const CONFIG_KEY: &str = "config.json";

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure reaching the remote store.
    #[error("remote store unreachable: {0}")]
    Connectivity(#[from] reqwest::Error),
    /// The remote store rejected the bearer credential.
    #[error("credential rejected: check that the configured token matches the remote store")]
    Auth,
    /// The remote store reported a non-auth failure.
    #[error("remote store error (status {status}): {message}")]
    Remote { status: u16, message: String },
    #[error("local store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serializing local data: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Directory-scoped key-value store holding the serialized collection
/// and configuration under two fixed keys. Writes go through a temp
/// file and an atomic rename.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Missing keys and corrupted payloads both load as the default
    /// value; corruption is logged and discarded rather than surfaced.
    async fn read_key<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, StoreError> {
        let path = self.root.join(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(key, %err, "discarding corrupted local data");
                Ok(T::default())
            }
        }
    }

    async fn write_key<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        fs::create_dir_all(&self.root).await?;

        let path = self.root.join(key);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }

    pub async fn load_items(&self) -> Result<Vec<Item>, StoreError> {
        self.read_key(ITEMS_KEY).await
    }

    pub async fn save_items(&self, items: &[Item]) -> Result<(), StoreError> {
        self.write_key(ITEMS_KEY, &items).await
    }

    pub async fn load_config(&self) -> Result<AppConfig, StoreError> {
        self.read_key(CONFIG_KEY).await
    }

    pub async fn save_config(&self, config: &AppConfig) -> Result<(), StoreError> {
        self.write_key(CONFIG_KEY, config).await
    }

    async fn upsert_one(&self, item: &Item) -> Result<(), StoreError> {
        let mut items = self.load_items().await?;
        match items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item.clone(),
            None => items.insert(0, item.clone()),
        }
        self.save_items(&items).await
    }

    /// Merge keyed by id: existing entries are overwritten in place,
    /// untouched order is preserved, unseen entries are appended.
    async fn upsert_batch(&self, items: &[Item]) -> Result<(), StoreError> {
        let mut current = self.load_items().await?;
        let mut incoming: HashMap<String, Item> = items
            .iter()
            .map(|item| (item.id.clone(), item.clone()))
            .collect();
        for existing in &mut current {
            if let Some(replacement) = incoming.remove(&existing.id) {
                *existing = replacement;
            }
        }
        for item in items {
            if let Some(fresh) = incoming.remove(&item.id) {
                current.push(fresh);
            }
        }
        self.save_items(&current).await
    }

    async fn delete_batch(&self, ids: &[String]) -> Result<(), StoreError> {
        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut items = self.load_items().await?;
        items.retain(|item| !doomed.contains(item.id.as_str()));
        self.save_items(&items).await
    }
}

/// Client for the remote authenticated store: read-all, upsert-one,
/// upsert-batch, and delete-batch routes, all bearer-authenticated.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    endpoint: String,
    token: String,
    client: reqwest::Client,
}

impl RemoteStore {
    pub fn new(endpoint: &str, token: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{route}", self.endpoint)
    }

    /// Classify a non-success response: 401 becomes [`StoreError::Auth`],
    /// anything else carries the server's `error` field when present.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(StoreError::Auth);
        }
        let message = resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| {
                body.get("error")
                    .and_then(|e| e.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("request failed ({})", status.as_u16()));
        Err(StoreError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn list_all(&self) -> Result<Vec<Item>, StoreError> {
        let resp = self
            .client
            .get(self.url("items"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn upsert_one(&self, item: &Item) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(self.url("items"))
            .bearer_auth(&self.token)
            .json(item)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn upsert_batch(&self, items: &[Item]) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(self.url("batch_items"))
            .bearer_auth(&self.token)
            .json(&items)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn delete_batch(&self, ids: &[String]) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(self.url("batch_delete"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }
}

/// No-op authenticated read used to confirm credentials before a
/// configuration change is committed. Mutates nothing.
pub async fn verify_connection(endpoint: &str, token: &str) -> Result<(), StoreError> {
    let store = RemoteStore::new(endpoint, token)?;
    store.list_all().await.map(|_| ())
}

/// The active storage target, chosen once per configuration load.
#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalStore),
    Remote(RemoteStore),
}

/// Uniform CRUD/batch surface over whichever backend the current
/// configuration selects. The gateway is the sole mutator of the
/// collection; other components read snapshots via [`Gateway::list_all`].
#[derive(Debug, Clone)]
pub struct Gateway {
    backend: Backend,
}

impl Gateway {
    /// Remote iff both endpoint and token are non-empty; local otherwise.
    pub fn from_config(config: &AppConfig, data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let backend = if config.remote_configured() {
            let endpoint = config.api_endpoint.as_deref().unwrap_or_default();
            let token = config.auth_token.as_deref().unwrap_or_default();
            Backend::Remote(RemoteStore::new(endpoint, token)?)
        } else {
            Backend::Local(LocalStore::new(data_dir))
        };
        Ok(Self { backend })
    }

    pub fn local(store: LocalStore) -> Self {
        Self {
            backend: Backend::Local(store),
        }
    }

    pub fn remote(store: RemoteStore) -> Self {
        Self {
            backend: Backend::Remote(store),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.backend, Backend::Remote(_))
    }

    /// Snapshot of every item, in stored order. Sorting for display is
    /// a view concern applied after every read.
    pub async fn list_all(&self) -> Result<Vec<Item>, StoreError> {
        match &self.backend {
            Backend::Local(store) => store.load_items().await,
            Backend::Remote(store) => store.list_all().await,
        }
    }

    /// Insert if the id is unseen, else replace in place.
    pub async fn upsert_one(&self, item: &Item) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Local(store) => store.upsert_one(item).await,
            Backend::Remote(store) => store.upsert_one(item).await,
        }
    }

    pub async fn upsert_batch(&self, items: &[Item]) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Local(store) => store.upsert_batch(items).await,
            Backend::Remote(store) => store.upsert_batch(items).await,
        }
    }

    /// Idempotent: ids absent from the collection are ignored.
    pub async fn delete_batch(&self, ids: &[String]) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Local(store) => store.delete_batch(ids).await,
            Backend::Remote(store) => store.delete_batch(ids).await,
        }
    }

    pub async fn delete_one(&self, id: &str) -> Result<(), StoreError> {
        self.delete_batch(&[id.to_string()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curio_core::ItemKind;
    use tempfile::tempdir;

    fn mk_item(id: &str, content: &str, created_at: i64) -> Item {
        Item {
            id: id.to_string(),
            kind: ItemKind::Link,
            content: content.to_string(),
            title: format!("title-{id}"),
            summary: None,
            ai_summary: None,
            category: None,
            tags: vec!["seed".to_string()],
            created_at,
        }
    }

    #[tokio::test]
    async fn round_trip_preserves_every_field() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());

        let mut item = mk_item("a", "https://example.com", 100);
        item.summary = Some("hand-written".to_string());
        item.ai_summary = Some("machine-written".to_string());
        item.category = Some("From bookmarks".to_string());
        item.tags = vec!["one".to_string(), "two".to_string()];

        store.save_items(std::slice::from_ref(&item)).await.expect("save");
        let loaded = store.load_items().await.expect("load");
        assert_eq!(loaded, vec![item]);
    }

    #[tokio::test]
    async fn missing_and_corrupted_data_load_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());
        assert!(store.load_items().await.expect("missing").is_empty());

        std::fs::write(dir.path().join("items.json"), b"{not json").expect("write garbage");
        assert!(store.load_items().await.expect("corrupted").is_empty());
    }

    #[tokio::test]
    async fn upsert_one_replaces_in_place_and_prepends_new() {
        let dir = tempdir().expect("tempdir");
        let gateway = Gateway::local(LocalStore::new(dir.path()));

        gateway.upsert_one(&mk_item("a", "u1", 1)).await.expect("insert a");
        gateway.upsert_one(&mk_item("b", "u2", 2)).await.expect("insert b");

        let mut replacement = mk_item("a", "u1-edited", 1);
        replacement.title = "edited".to_string();
        gateway.upsert_one(&replacement).await.expect("replace a");

        let items = gateway.list_all().await.expect("list");
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(items[1].title, "edited");
    }

    #[tokio::test]
    async fn upsert_batch_merges_by_id_preserving_existing_order() {
        let dir = tempdir().expect("tempdir");
        let gateway = Gateway::local(LocalStore::new(dir.path()));

        gateway
            .upsert_batch(&[mk_item("a", "u1", 1), mk_item("b", "u2", 2), mk_item("c", "u3", 3)])
            .await
            .expect("seed");

        let mut b2 = mk_item("b", "u2-edited", 2);
        b2.title = "replaced".to_string();
        gateway
            .upsert_batch(&[b2, mk_item("d", "u4", 4)])
            .await
            .expect("merge");

        let items = gateway.list_all().await.expect("list");
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(items[1].title, "replaced");
    }

    #[tokio::test]
    async fn upsert_batch_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let gateway = Gateway::local(LocalStore::new(dir.path()));

        let batch = vec![mk_item("a", "u1", 1), mk_item("b", "u2", 2)];
        gateway.upsert_batch(&batch).await.expect("first");
        let once = gateway.list_all().await.expect("list once");
        gateway.upsert_batch(&batch).await.expect("second");
        let twice = gateway.list_all().await.expect("list twice");
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn ids_stay_unique_across_upsert_sequences() {
        let dir = tempdir().expect("tempdir");
        let gateway = Gateway::local(LocalStore::new(dir.path()));

        gateway.upsert_one(&mk_item("a", "u1", 1)).await.expect("one");
        gateway
            .upsert_batch(&[mk_item("a", "u1", 1), mk_item("b", "u2", 2)])
            .await
            .expect("batch");
        gateway.upsert_one(&mk_item("b", "u2", 2)).await.expect("one again");

        let items = gateway.list_all().await.expect("list");
        let mut ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), items.len());
    }

    #[tokio::test]
    async fn delete_batch_ignores_absent_ids() {
        let dir = tempdir().expect("tempdir");
        let gateway = Gateway::local(LocalStore::new(dir.path()));

        gateway
            .upsert_batch(&[mk_item("a", "u1", 1), mk_item("b", "u2", 2)])
            .await
            .expect("seed");
        gateway
            .delete_batch(&["b".to_string(), "ghost".to_string()])
            .await
            .expect("delete");

        let items = gateway.list_all().await.expect("list");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "a");
    }

    #[tokio::test]
    async fn delete_one_forwards_to_the_batch_path() {
        let dir = tempdir().expect("tempdir");
        let gateway = Gateway::local(LocalStore::new(dir.path()));

        gateway.upsert_one(&mk_item("a", "u1", 1)).await.expect("seed");
        gateway.delete_one("a").await.expect("delete");
        gateway.delete_one("a").await.expect("repeat delete is a no-op");

        assert!(gateway.list_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn backend_selection_follows_configuration() {
        let dir = tempdir().expect("tempdir");

        let local_only = AppConfig::default();
        let gateway = Gateway::from_config(&local_only, dir.path()).expect("local gateway");
        assert!(!gateway.is_remote());

        let remote = AppConfig {
            api_endpoint: Some("https://store.example/".to_string()),
            auth_token: Some("secret".to_string()),
            analysis_keys: Vec::new(),
        };
        let gateway = Gateway::from_config(&remote, dir.path()).expect("remote gateway");
        assert!(gateway.is_remote());

        // Endpoint without a token still runs locally.
        let half = AppConfig {
            api_endpoint: Some("https://store.example".to_string()),
            auth_token: None,
            analysis_keys: Vec::new(),
        };
        let gateway = Gateway::from_config(&half, dir.path()).expect("half gateway");
        assert!(!gateway.is_remote());
    }

    #[tokio::test]
    async fn config_round_trips_through_local_store() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());

        assert_eq!(store.load_config().await.expect("default"), AppConfig::default());

        let config = AppConfig {
            api_endpoint: Some("https://store.example".to_string()),
            auth_token: Some("secret".to_string()),
            analysis_keys: vec!["k1".to_string(), "k2".to_string()],
        };
        store.save_config(&config).await.expect("save");
        assert_eq!(store.load_config().await.expect("load"), config);
    }
}
