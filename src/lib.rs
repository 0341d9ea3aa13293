//! dynhashtag - Adaptive topic following over live social-media streams
//!
//! Follows a topic defined by a small seed query of keywords and authors as
//! its vocabulary drifts:
//! - Filters the live stream with the active relevance classifier
//! - Periodically retrains the classifier on recently kept documents
//! - Expands the query with TF-IDF selected terms and frequent authors
//! - Hands new classifiers to the live loop without stopping ingestion
//!
//! # Architecture
//!
//! - **Types**: documents, authors, query sets, model snapshots
//! - **Stream**: subscription client (SSE and in-memory) and wire decoding
//! - **Storage**: document store (libSQL and in-memory)
//! - **Text**: tokenization and stop words
//! - **Filter**: encoder, term selector, sampler, classifier, handoff,
//!   retrain scheduler and the ingestion loop
//!
//! # Example
//!
//! ```ignore
//! use dynhashtag_core::filter::{ClassifierHandoff, IngestionLoop, RetrainPipeline, RetrainScheduler};
//!
//! let handoff = Arc::new(ClassifierHandoff::new());
//! let pipeline = RetrainPipeline::from_config(&config, store.clone(), stream.clone());
//! let scheduler = RetrainScheduler::new(
//!     pipeline,
//!     handoff.clone(),
//!     config.seed.query_set(),
//!     config.filter.remodel_interval(),
//!     config.filter.history_limit,
//! );
//! let ingest = IngestionLoop::from_config(&config, stream, store, handoff.subscribe());
//!
//! tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });
//! let report = ingest.run(shutdown).await?;
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod storage;
pub mod stream;
pub mod text;
pub mod types;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{DynHashtagError, Result};
pub use storage::{ConnectionMode, DocumentStore, LibsqlDocumentStore, MemoryDocumentStore};
pub use stream::{StreamClient, StreamError, StreamEvent, Subscription};
pub use types::{
    Author, AuthorId, Document, DocumentId, Generation, ModelSnapshot, QuerySet, StreamFilter,
};
