//! Common test utilities and helpers

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use dynhashtag_core::{
    config::AppConfig,
    filter::{ClassifierHandoff, IngestionLoop, RetrainPipeline, RetrainScheduler},
    stream::memory::MemoryStreamClient,
    Document, DocumentStore, MemoryDocumentStore,
};
use std::sync::Arc;
use std::time::Duration;

/// Configuration tuned for fast tests: short polls and backoff
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.filter.top_k = 5;
    config.filter.remodel_hours = 6;
    config.filter.min_author_documents = 10;
    config.filter.sample_timeout_secs = 30;
    config.filter.handoff_poll_millis = 20;
    config.stream.reconnect_delay_secs = 1;
    config.stream.max_reconnect_attempts = 0;
    config
}

pub fn doc_at(id: &str, author: &str, text: &str, at: DateTime<Utc>) -> Document {
    Document::new(id, author, text, at)
}

pub fn doc(id: &str, author: &str, text: &str) -> Document {
    doc_at(id, author, text, Utc::now())
}

/// 50 on-topic documents for the seed `{obama, usa}`
///
/// Expansion terms appear in a decreasing number of documents (election 40,
/// senate 35, debate 30, campaign 25, vote 20), every document carries one
/// unique filler term, and the documents alternate between authors `100`
/// and `200`.
pub fn positive_corpus() -> Vec<Document> {
    let expansions = [
        ("election", 40),
        ("senate", 35),
        ("debate", 30),
        ("campaign", 25),
        ("vote", 20),
    ];
    (0..50)
        .map(|i| {
            let mut words = vec!["obama".to_string(), "usa".to_string()];
            for (term, docs) in expansions {
                if i < docs {
                    words.push(term.to_string());
                }
            }
            words.push(format!("topic{}", i));
            let author = if i % 2 == 0 { "100" } else { "200" };
            doc(&format!("p{}", i), author, &words.join(" "))
        })
        .collect()
}

/// Off-topic sample documents
pub fn negative_sample(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| doc(&format!("n{}", i), "900", &format!("weather report number{}", i)))
        .collect()
}

pub async fn seed_store(store: &MemoryDocumentStore, docs: &[Document]) {
    for doc in docs {
        store.insert_document(doc).await.expect("insert positive");
    }
}

/// Everything a full ingest + retrain setup needs, backed by in-memory collaborators
pub struct Harness {
    pub config: AppConfig,
    pub store: Arc<MemoryDocumentStore>,
    pub stream: Arc<MemoryStreamClient>,
    pub handoff: Arc<ClassifierHandoff>,
    pub scheduler: RetrainScheduler,
}

impl Harness {
    pub fn new(config: AppConfig) -> Self {
        let store = Arc::new(MemoryDocumentStore::new());
        let stream = Arc::new(MemoryStreamClient::default());
        let handoff = Arc::new(ClassifierHandoff::new());
        let scheduler = RetrainScheduler::new(
            RetrainPipeline::from_config(&config, store.clone(), stream.clone()),
            handoff.clone(),
            config.seed.query_set(),
            config.filter.remodel_interval(),
            config.filter.history_limit,
        );
        Self {
            config,
            store,
            stream,
            handoff,
            scheduler,
        }
    }

    pub fn ingestion(&self) -> IngestionLoop {
        IngestionLoop::from_config(
            &self.config,
            self.stream.clone(),
            self.store.clone(),
            self.handoff.subscribe(),
        )
    }

    /// Wait until the store holds a document with `id`
    pub async fn wait_for_document(&self, id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.store.documents().iter().any(|d| d.id.0 == id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("document was not stored in time");
    }
}
