//! JSON document store.
//!
//! Every collection is a JSON array of objects kept in memory and mirrored to
//! `<data dir>/<collection>.json`. Each document carries a string `id` field
//! which is its primary key inside the collection.
//!
//! All writes go through a single lock. A write first reloads the collection
//! files from disk, so other processes sharing the directory (the admin CLI
//! next to a running server) are not overwritten. It then stages copies of the
//! collections it touches and only swaps them in (and persists them) once the
//! caller's closure returns `Ok`, so a failing closure leaves the store as it
//! was. Reads reload a collection whose file changed since it was last seen.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A typed document living in one named collection.
///
/// The serialized form must be a JSON object with a string `id` field equal
/// to [`Document::id`].
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Name of the collection (and of the backing file, without `.json`)
    const COLLECTION: &'static str;

    /// Primary key of the document
    fn id(&self) -> &str;
}

/// Errors raised by the document store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection}/{id} not found")]
    NotFound { collection: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("collection {collection} is corrupt: {message}")]
    Corrupt { collection: String, message: String },

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found<D: Document>(id: impl Into<String>) -> Self {
        StoreError::NotFound {
            collection: D::COLLECTION,
            id: id.into(),
        }
    }
}

type Collections = HashMap<String, Vec<Value>>;

/// Modification time and length of a collection file when it was last read or written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl Stamp {
    fn of(metadata: &Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        }
    }
}

#[derive(Default)]
struct Inner {
    docs: Collections,
    stamps: HashMap<String, Stamp>,
}

/// Shared handle to the document store. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    root: Option<PathBuf>,
}

impl Store {
    /// Open (or create) a store rooted at `dir`, loading every `*.json` file.
    ///
    /// # Errors
    /// * `StoreError::Io` if the directory cannot be created or read
    /// * `StoreError::Corrupt` if a collection file is not a JSON array
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = dir.into();
        std::fs::create_dir_all(&root)?;

        let mut inner = Inner::default();
        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();
            let Some(name) = collection_name(&path) else {
                continue;
            };
            let metadata = std::fs::metadata(&path)?;
            if !metadata.is_file() {
                continue;
            }

            let documents = parse_collection(&name, &std::fs::read_to_string(&path)?)?;
            debug!(collection = %name, documents = documents.len(), "loaded collection");
            inner.stamps.insert(name.clone(), Stamp::of(&metadata));
            inner.docs.insert(name, documents);
        }

        info!(path = %root.display(), collections = inner.docs.len(), "document store opened");

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            root: Some(root),
        })
    }

    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            root: None,
        }
    }

    /// Read access to the collections, reloading any file that changed on disk
    async fn fresh(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        let Some(root) = self.root.as_ref() else {
            return Ok(self.inner.read().await);
        };

        let on_disk = scan(root).await?;
        {
            let inner = self.inner.read().await;
            if stale(&inner, &on_disk).is_empty() {
                return Ok(inner);
            }
        }

        let mut inner = self.inner.write().await;
        let changed = stale(&inner, &on_disk);
        reload(root, &mut inner, &on_disk, &changed).await?;
        Ok(inner.downgrade())
    }

    /// All documents of a collection in insertion order
    pub async fn list<D: Document>(&self) -> Result<Vec<D>, StoreError> {
        let inner = self.fresh().await?;
        decode_all(
            inner
                .docs
                .get(D::COLLECTION)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        )
    }

    /// Documents matching `predicate`, in insertion order
    pub async fn find<D, F>(&self, predicate: F) -> Result<Vec<D>, StoreError>
    where
        D: Document,
        F: Fn(&D) -> bool,
    {
        Ok(self
            .list::<D>()
            .await?
            .into_iter()
            .filter(|doc| predicate(doc))
            .collect())
    }

    pub async fn get<D: Document>(&self, id: &str) -> Result<Option<D>, StoreError> {
        let inner = self.fresh().await?;
        let Some(docs) = inner.docs.get(D::COLLECTION) else {
            return Ok(None);
        };
        docs.iter()
            .find(|value| value_id(value) == Some(id))
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .transpose()
    }

    pub async fn count<D, F>(&self, predicate: F) -> Result<usize, StoreError>
    where
        D: Document,
        F: Fn(&D) -> bool,
    {
        Ok(self.find::<D, F>(predicate).await?.len())
    }

    /// Insert a new document; an existing id is a conflict
    pub async fn insert<D: Document>(&self, doc: D) -> Result<D, StoreError> {
        self.write(move |txn| txn.insert(doc)).await
    }

    /// Replace (or create) a document, returning the previous version
    pub async fn put<D: Document>(&self, doc: D) -> Result<Option<D>, StoreError> {
        self.write(move |txn| txn.put(doc)).await
    }

    /// Modify a document in place.
    ///
    /// The closure may reject the change by returning an error, in which case
    /// nothing is written.
    pub async fn update<D, T, F>(&self, id: &str, f: F) -> Result<T, StoreError>
    where
        D: Document,
        F: FnOnce(&mut D) -> Result<T, StoreError>,
    {
        self.write(move |txn| txn.update(id, f)).await
    }

    pub async fn remove<D: Document>(&self, id: &str) -> Result<D, StoreError> {
        self.write(move |txn| txn.remove::<D>(id)).await
    }

    /// Run a unit of work over one or more collections.
    ///
    /// Changes become visible (and are persisted) only if `f` returns `Ok`.
    /// Either every touched collection file is replaced or none is.
    pub async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, StoreError>,
    {
        let mut inner = self.inner.write().await;

        if let Some(root) = self.root.as_ref() {
            let on_disk = scan(root).await?;
            let everything: Vec<String> = on_disk.keys().cloned().collect();
            reload(root, &mut inner, &on_disk, &everything).await?;
        }

        let mut txn = Txn {
            base: &inner.docs,
            staged: HashMap::new(),
            dirty: BTreeSet::new(),
        };
        let result = f(&mut txn)?;
        let Txn { staged, dirty, .. } = txn;

        let mut stamps = Vec::new();
        if let Some(root) = self.root.as_ref() {
            stamps = commit(root, &inner.docs, &staged, &dirty).await?;
        }

        for (name, docs) in staged {
            if dirty.contains(name) {
                inner.docs.insert(name.to_string(), docs);
            }
        }
        for (name, stamp) in stamps {
            inner.stamps.insert(name.to_string(), stamp);
        }

        Ok(result)
    }
}

/// Current stamps of every collection file under `root`
async fn scan(root: &Path) -> Result<HashMap<String, Stamp>, StoreError> {
    let mut stamps = HashMap::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = collection_name(&entry.path()) else {
            continue;
        };
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            stamps.insert(name, Stamp::of(&metadata));
        }
    }
    Ok(stamps)
}

fn stale(inner: &Inner, on_disk: &HashMap<String, Stamp>) -> Vec<String> {
    on_disk
        .iter()
        .filter(|(name, stamp)| inner.stamps.get(*name) != Some(*stamp))
        .map(|(name, _)| name.clone())
        .collect()
}

async fn reload(
    root: &Path,
    inner: &mut Inner,
    on_disk: &HashMap<String, Stamp>,
    names: &[String],
) -> Result<(), StoreError> {
    for name in names {
        let raw = tokio::fs::read_to_string(collection_path(root, name)).await?;
        let documents = parse_collection(name, &raw)?;
        debug!(collection = %name, documents = documents.len(), "reloaded collection");
        if let Some(stamp) = on_disk.get(name) {
            inner.stamps.insert(name.clone(), *stamp);
        }
        inner.docs.insert(name.clone(), documents);
    }
    Ok(())
}

/// Persist the dirty collections: every temp file is written before any is
/// renamed into place, and already renamed files are put back if a later
/// rename fails.
async fn commit(
    root: &Path,
    base: &Collections,
    staged: &HashMap<&'static str, Vec<Value>>,
    dirty: &BTreeSet<&'static str>,
) -> Result<Vec<(&'static str, Stamp)>, StoreError> {
    let mut pending: Vec<(&'static str, PathBuf, PathBuf)> = Vec::new();

    for name in dirty {
        let Some(docs) = staged.get(*name) else {
            continue;
        };
        let path = collection_path(root, name);
        let temp = temp_path(&path);
        let written = match serde_json::to_vec_pretty(docs) {
            Ok(payload) => tokio::fs::write(&temp, payload).await.map_err(StoreError::from),
            Err(e) => Err(StoreError::from(e)),
        };
        if let Err(e) = written {
            discard(&temp).await;
            for (_, temp, _) in &pending {
                discard(temp).await;
            }
            return Err(e);
        }
        pending.push((*name, temp, path));
    }

    for (index, (name, temp, path)) in pending.iter().enumerate() {
        if let Err(e) = tokio::fs::rename(temp, path).await {
            warn!(collection = name, error = %e, "commit failed, restoring previous files");
            for (_, temp, _) in &pending[index..] {
                discard(temp).await;
            }
            for (name, _, path) in &pending[..index] {
                restore(path, base.get(*name)).await;
            }
            return Err(e.into());
        }
    }

    let mut stamps = Vec::with_capacity(pending.len());
    for (name, _, path) in pending {
        let metadata = tokio::fs::metadata(&path).await?;
        debug!(collection = name, "collection persisted");
        stamps.push((name, Stamp::of(&metadata)));
    }
    Ok(stamps)
}

/// Put a collection file back to its pre-commit contents
async fn restore(path: &Path, previous: Option<&Vec<Value>>) {
    let result = match previous {
        Some(docs) => match serde_json::to_vec_pretty(docs) {
            Ok(payload) => {
                let temp = temp_path(path);
                match tokio::fs::write(&temp, payload).await {
                    Ok(()) => tokio::fs::rename(&temp, path).await,
                    Err(e) => {
                        discard(&temp).await;
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e.into()),
        },
        None => tokio::fs::remove_file(path).await,
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "could not restore collection file");
    }
}

async fn discard(temp: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %temp.display(), error = %e, "could not remove temp file");
        }
    }
}

/// Staged view over the store handed to [`Store::write`] closures.
pub struct Txn<'a> {
    base: &'a Collections,
    staged: HashMap<&'static str, Vec<Value>>,
    dirty: BTreeSet<&'static str>,
}

impl Txn<'_> {
    fn docs(&self, collection: &'static str) -> &[Value] {
        if let Some(docs) = self.staged.get(collection) {
            return docs;
        }
        self.base
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn docs_mut(&mut self, collection: &'static str) -> &mut Vec<Value> {
        self.dirty.insert(collection);
        let base = self.base;
        self.staged
            .entry(collection)
            .or_insert_with(|| base.get(collection).cloned().unwrap_or_default())
    }

    pub fn list<D: Document>(&self) -> Result<Vec<D>, StoreError> {
        decode_all(self.docs(D::COLLECTION))
    }

    pub fn get<D: Document>(&self, id: &str) -> Result<Option<D>, StoreError> {
        self.docs(D::COLLECTION)
            .iter()
            .find(|value| value_id(value) == Some(id))
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .transpose()
    }

    pub fn insert<D: Document>(&mut self, doc: D) -> Result<D, StoreError> {
        let value = encode(&doc)?;
        let docs = self.docs_mut(D::COLLECTION);
        if docs.iter().any(|existing| value_id(existing) == Some(doc.id())) {
            return Err(StoreError::Conflict(format!(
                "{}/{} already exists",
                D::COLLECTION,
                doc.id()
            )));
        }
        docs.push(value);
        Ok(doc)
    }

    pub fn put<D: Document>(&mut self, doc: D) -> Result<Option<D>, StoreError> {
        let value = encode(&doc)?;
        let docs = self.docs_mut(D::COLLECTION);
        match docs.iter_mut().find(|existing| value_id(existing) == Some(doc.id())) {
            Some(slot) => {
                let previous = std::mem::replace(slot, value);
                Ok(Some(serde_json::from_value(previous)?))
            }
            None => {
                docs.push(value);
                Ok(None)
            }
        }
    }

    pub fn update<D, T, F>(&mut self, id: &str, f: F) -> Result<T, StoreError>
    where
        D: Document,
        F: FnOnce(&mut D) -> Result<T, StoreError>,
    {
        let mut doc: D = self.get(id)?.ok_or_else(|| StoreError::not_found::<D>(id))?;
        let result = f(&mut doc)?;
        self.put(doc)?;
        Ok(result)
    }

    /// Drop the oldest documents of a collection so at most `keep` remain.
    /// Returns how many were dropped.
    pub fn keep_newest<D: Document>(&mut self, keep: usize) -> usize {
        let excess = self.docs(D::COLLECTION).len().saturating_sub(keep);
        if excess > 0 {
            let docs = self.docs_mut(D::COLLECTION);
            *docs = docs.split_off(excess);
        }
        excess
    }

    pub fn remove<D: Document>(&mut self, id: &str) -> Result<D, StoreError> {
        let docs = self.docs_mut(D::COLLECTION);
        let position = docs
            .iter()
            .position(|value| value_id(value) == Some(id))
            .ok_or_else(|| StoreError::not_found::<D>(id))?;
        Ok(serde_json::from_value(docs.remove(position))?)
    }
}

fn collection_path(root: &Path, collection: &str) -> PathBuf {
    root.join(format!("{collection}.json"))
}

fn temp_path(path: &Path) -> PathBuf {
    path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()))
}

/// Collection name of a `*.json` path
fn collection_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

fn parse_collection(name: &str, raw: &str) -> Result<Vec<Value>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        collection: name.to_string(),
        message: e.to_string(),
    })
}

fn value_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

fn encode<D: Document>(doc: &D) -> Result<Value, StoreError> {
    let value = serde_json::to_value(doc)?;
    if value_id(&value) != Some(doc.id()) {
        return Err(StoreError::Corrupt {
            collection: D::COLLECTION.to_string(),
            message: "document does not serialize its id".to_string(),
        });
    }
    Ok(value)
}

fn decode_all<D: Document>(docs: &[Value]) -> Result<Vec<D>, StoreError> {
    docs.iter()
        .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
        .collect()
}
