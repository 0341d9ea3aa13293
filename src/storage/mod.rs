//! Storage layer for kept documents and their authors
//!
//! The ingestion loop writes through [`DocumentStore`]; the corpus sampler
//! reads the positive corpus back from it.

pub mod libsql;
pub mod memory;

use crate::error::Result;
use crate::types::{Author, Document};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage backend trait for the document store collaborator
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a kept document; storing the same id twice is a no-op
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    /// Insert or refresh an author profile
    async fn insert_author(&self, author: &Author) -> Result<()>;

    /// Documents created strictly after `since`, oldest first
    async fn documents_since(&self, since: DateTime<Utc>) -> Result<Vec<Document>>;

    /// Total number of stored documents
    async fn count_documents(&self) -> Result<usize>;
}

pub use self::libsql::{ConnectionMode, LibsqlDocumentStore};
pub use self::memory::MemoryDocumentStore;
