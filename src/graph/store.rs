//! Process-wide set of loaded documents
//!
//! Cross-document resolution looks dependency documents up here, and can
//! wait for one that has not been loaded yet.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use super::document::Document;
use super::schema::SchemaRegistry;
use crate::config::GraphConfig;
use crate::error::Result;

pub(crate) struct StoreInner {
    registry: Arc<SchemaRegistry>,
    config: GraphConfig,
    documents: Mutex<HashMap<Uuid, Document>>,
    loaded: Notify,
}

#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

impl DocumentStore {
    pub fn new(registry: Arc<SchemaRegistry>, config: GraphConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                registry,
                config,
                documents: Mutex::new(HashMap::new()),
                loaded: Notify::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    /// Create a new document with the store's registry and config, and load it
    pub fn create_document(&self) -> Result<Document> {
        let doc = Document::new(self.inner.registry.clone(), self.inner.config.clone())?;
        self.insert(doc.clone());
        Ok(doc)
    }

    /// Load a document from encoded state
    pub fn load_document(&self, state: &[u8]) -> Result<Document> {
        let doc = Document::from_state(self.inner.registry.clone(), self.inner.config.clone(), state)?;
        self.insert(doc.clone());
        Ok(doc)
    }

    /// Make `doc` available for resolution, waking anything waiting for it
    pub fn insert(&self, doc: Document) {
        doc.attach_store(Arc::downgrade(&self.inner));
        let id = doc.id();
        if self.inner.documents.lock().insert(id, doc).is_some() {
            log::warn!("Replaced loaded document {}", id);
        } else {
            log::debug!("Loaded document {}", id);
        }
        self.inner.loaded.notify_waiters();
    }

    pub fn get(&self, id: &Uuid) -> Option<Document> {
        self.inner.documents.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) -> Option<Document> {
        self.inner.documents.lock().remove(id)
    }

    pub fn document_ids(&self) -> Vec<Uuid> {
        self.inner.documents.lock().keys().copied().collect()
    }

    /// Wait until a document with `id` is loaded
    pub async fn wait_for(&self, id: Uuid) -> Document {
        loop {
            let notified = self.inner.loaded.notified();
            tokio::pin!(notified);
            // Register before checking so an insert in between is not missed
            notified.as_mut().enable();
            if let Some(doc) = self.get(&id) {
                return doc;
            }
            notified.await;
        }
    }
}
