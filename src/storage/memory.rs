//! In-process document store used by tests and the `replay` command

use crate::error::Result;
use crate::storage::DocumentStore;
use crate::types::{Author, AuthorId, Document, DocumentId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    documents: Vec<Document>,
    index: HashMap<DocumentId, usize>,
    authors: HashMap<AuthorId, Author>,
}

/// [`DocumentStore`] keeping everything in a mutex-guarded vector
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail, to exercise store-error handling
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn documents(&self) -> Vec<Document> {
        self.lock().documents.clone()
    }

    pub fn author(&self, id: &AuthorId) -> Option<Author> {
        self.lock().authors.get(id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic in another test thread must not cascade through the store
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(crate::error::DynHashtagError::Database(
                "store is rejecting writes".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.lock();
        if inner.index.contains_key(&doc.id) {
            return Ok(());
        }
        let position = inner.documents.len();
        inner.index.insert(doc.id.clone(), position);
        inner.documents.push(doc.clone());
        Ok(())
    }

    async fn insert_author(&self, author: &Author) -> Result<()> {
        self.check_writable()?;
        self.lock().authors.insert(author.id.clone(), author.clone());
        Ok(())
    }

    async fn documents_since(&self, since: DateTime<Utc>) -> Result<Vec<Document>> {
        let mut documents: Vec<Document> = self
            .lock()
            .documents
            .iter()
            .filter(|d| d.created_at > since)
            .cloned()
            .collect();
        documents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(documents)
    }

    async fn count_documents(&self) -> Result<usize> {
        Ok(self.lock().documents.len())
    }
}
