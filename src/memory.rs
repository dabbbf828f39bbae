//! Document store held in process memory.
//!
//! Behaves like the remote store for everything the gateway relies on
//! (listing order, atomic commits, server timestamps, change listeners) and
//! can be told to fail reads or writes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::db_client::{ChangeStream, DocumentStore};
use crate::document::{Document, FieldValue, Fields, Write};

#[derive(Default)]
struct MemoryState {
    /// Collection path -> documents in insertion order.
    collections: BTreeMap<String, Vec<Document>>,
    listeners: Vec<(String, mpsc::Sender<Result<Vec<Document>>>)>,
    fail_reads: bool,
    fail_writes: bool,
    next_id: u64,
}

impl MemoryState {
    fn listing(&self, collection: &str) -> Vec<Document> {
        self.collections.get(collection).cloned().unwrap_or_default()
    }

    fn notify(&mut self, collection: &str) {
        let listing = self.listing(collection);
        self.listeners.retain(|(watched, tx)| {
            if watched != collection {
                return !tx.is_closed();
            }
            match tx.try_send(Ok(listing.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Listener on {} is lagging, dropping an update", collection);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryDocumentStore")
            .field("collections", &state.collections.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores a document as-is, bypassing commit validation. Listeners are notified.
    pub fn insert_raw(&self, collection: &str, id: &str, fields: Fields) {
        let mut state = self.lock();
        let path = format!("{}/{}", collection, id);
        let mut document = Document::new(path.clone(), fields);
        document.update_time = Some(Utc::now());
        let docs = state.collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| d.path == path) {
            Some(existing) => *existing = document,
            None => docs.push(document),
        }
        state.notify(collection);
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock().listing(collection)
    }

    /// Total number of stored documents across every collection.
    pub fn document_count(&self) -> usize {
        self.lock().collections.values().map(Vec::len).sum()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Pushes an error event to every listener of `collection`.
    pub fn emit_listener_error(&self, collection: &str, message: &str) {
        let state = self.lock();
        for (watched, tx) in &state.listeners {
            if watched == collection {
                let _ = tx.try_send(Err(anyhow!("{}", message)));
            }
        }
    }

    pub fn listener_count(&self, collection: &str) -> usize {
        self.lock()
            .listeners
            .iter()
            .filter(|(watched, tx)| watched == collection && !tx.is_closed())
            .count()
    }
}

fn split_path(path: &str) -> Result<(&str, &str)> {
    path.rsplit_once('/')
        .filter(|(collection, id)| !collection.is_empty() && !id.is_empty())
        .ok_or_else(|| anyhow!("Invalid document path: {}", path))
}

fn resolve_server_timestamps(fields: &Fields) -> Fields {
    let now = Utc::now();
    fields
        .iter()
        .map(|(name, value)| {
            let value = match value {
                FieldValue::ServerTimestamp => FieldValue::Timestamp(now),
                other => other.clone(),
            };
            (name.clone(), value)
        })
        .collect()
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let state = self.lock();
        if state.fail_reads {
            return Err(anyhow!("Simulated read failure on {}", collection));
        }
        Ok(state.listing(collection))
    }

    async fn query_eq(&self, collection: &str, field: &str, value: FieldValue) -> Result<Vec<Document>> {
        let state = self.lock();
        if state.fail_reads {
            return Err(anyhow!("Simulated read failure on {}", collection));
        }
        Ok(state
            .listing(collection)
            .into_iter()
            .filter(|d| d.get(field) == Some(&value))
            .collect())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(anyhow!("Simulated write failure"));
        }

        // validate everything before touching state so the commit stays atomic
        for write in &writes {
            let (collection, _) = split_path(write.path())?;
            if let Write::Create { path, .. } = write {
                let exists = state
                    .collections
                    .get(collection)
                    .map(|docs| docs.iter().any(|d| &d.path == path))
                    .unwrap_or(false);
                if exists {
                    return Err(anyhow!("Document already exists: {}", path));
                }
            }
        }

        let mut touched = Vec::new();
        for write in writes {
            let (collection, _) = split_path(write.path())?;
            let collection = collection.to_string();
            let fields = resolve_server_timestamps(write.fields());
            let docs = state.collections.entry(collection.clone()).or_default();
            let position = docs.iter().position(|d| d.path == write.path());

            match (write, position) {
                (Write::Set { merge: true, .. }, Some(i)) => {
                    docs[i].fields.extend(fields);
                    docs[i].update_time = Some(Utc::now());
                }
                (Write::Set { path, .. }, Some(i)) => {
                    let mut document = Document::new(path, fields);
                    document.update_time = Some(Utc::now());
                    docs[i] = document;
                }
                (write, _) => {
                    let mut document = Document::new(write.path(), fields);
                    document.update_time = Some(Utc::now());
                    docs.push(document);
                }
            }
            if !touched.contains(&collection) {
                touched.push(collection);
            }
        }

        for collection in touched {
            state.notify(&collection);
        }
        Ok(())
    }

    /// Sends the current listing right away, then one listing per change.
    fn watch(&self, collection: &str) -> ChangeStream {
        let (tx, rx) = mpsc::channel(32);
        let mut state = self.lock();
        let initial = if state.fail_reads {
            Err(anyhow!("Simulated read failure on {}", collection))
        } else {
            Ok(state.listing(collection))
        };
        let _ = tx.try_send(initial);
        state.listeners.push((collection.to_string(), tx));
        ChangeStream::new(rx)
    }

    fn new_document_id(&self) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        format!("doc{:06}", state.next_id)
    }
}
