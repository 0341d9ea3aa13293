//! Positive and negative training corpora
//!
//! Positives are the documents kept during the last retrain window.
//! Negatives come from the raw sample stream, skipping anything that shares
//! a term with the query the next classifier will serve, until the negative
//! corpus is exactly as large as the positive one.

use super::RetrainError;
use crate::storage::DocumentStore;
use crate::stream::{dispatch, Flow, StreamClient, StreamError, StreamListener};
use crate::text::Tokenizer;
use crate::types::{Author, Document, QuerySet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Listener collecting off-topic documents from the sample stream
pub struct SampleCollector {
    tokenizer: Arc<Tokenizer>,
    exclude: Arc<QuerySet>,
    wanted: usize,
    documents: Vec<Document>,
    skipped: usize,
    fatal: Option<StreamError>,
}

impl SampleCollector {
    pub fn new(tokenizer: Arc<Tokenizer>, exclude: Arc<QuerySet>, wanted: usize) -> Self {
        Self {
            tokenizer,
            exclude,
            wanted,
            documents: Vec::with_capacity(wanted),
            skipped: 0,
            fatal: None,
        }
    }

    /// Whether `doc` mentions any possibly relevant term
    pub fn is_excluded(&self, doc: &Document) -> bool {
        self.tokenizer
            .terms(doc)
            .iter()
            .any(|term| self.exclude.contains_keyword(term))
    }

    pub fn is_full(&self) -> bool {
        self.documents.len() >= self.wanted
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn into_documents(self) -> Vec<Document> {
        self.documents
    }
}

#[async_trait]
impl StreamListener for SampleCollector {
    async fn on_document(&mut self, document: Document, _author: Option<Author>) -> Flow {
        if self.is_full() {
            return Flow::Stop;
        }
        if self.is_excluded(&document) {
            self.skipped += 1;
            return Flow::Continue;
        }
        self.documents.push(document);
        if self.is_full() {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    async fn on_error(&mut self, error: StreamError) -> Flow {
        if error.is_fatal() {
            self.fatal = Some(error);
            Flow::Stop
        } else {
            warn!("Sample stream error, reopening: {}", error);
            Flow::Reconnect
        }
    }
}

/// Builds the training corpora for one retrain cycle
pub struct CorpusSampler {
    store: Arc<dyn DocumentStore>,
    stream: Arc<dyn StreamClient>,
    tokenizer: Arc<Tokenizer>,
    window: Duration,
    sample_timeout: Duration,
    retry_delay: Duration,
}

impl CorpusSampler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        stream: Arc<dyn StreamClient>,
        tokenizer: Arc<Tokenizer>,
        window: Duration,
        sample_timeout: Duration,
    ) -> Self {
        Self {
            store,
            stream,
            tokenizer,
            window,
            sample_timeout,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Delay before reopening the sample stream after a transient failure
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Start of the positive window ending at `now`
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::seconds(self.window.as_secs() as i64)
    }

    /// Documents kept since `now - window`; an empty corpus fails the cycle
    pub async fn positives(&self, now: DateTime<Utc>) -> Result<Vec<Document>, RetrainError> {
        let docs = self.store.documents_since(self.window_start(now)).await?;
        if docs.is_empty() {
            return Err(RetrainError::EmptyCorpus {
                window_hours: self.window.as_secs() / 3600,
            });
        }
        info!("Positive corpus: {} documents", docs.len());
        Ok(docs)
    }

    /// Exactly `wanted` sample documents sharing no keyword with `exclude`
    pub async fn negatives(
        &self,
        wanted: usize,
        exclude: Arc<QuerySet>,
    ) -> Result<Vec<Document>, RetrainError> {
        let mut collector = SampleCollector::new(self.tokenizer.clone(), exclude, wanted);
        if wanted == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + self.sample_timeout;
        let outcome = timeout_at(deadline, self.collect(&mut collector)).await;

        match outcome {
            Ok(Ok(())) => {
                info!(
                    "Negative corpus: {} documents ({} skipped as possibly relevant)",
                    collector.len(),
                    collector.skipped()
                );
                Ok(collector.into_documents())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RetrainError::SampleTimeout {
                collected: collector.len(),
                wanted,
                timeout: self.sample_timeout,
            }),
        }
    }

    async fn collect(&self, collector: &mut SampleCollector) -> Result<(), RetrainError> {
        loop {
            let mut subscription = match self.stream.sample().await {
                Ok(subscription) => subscription,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!("Failed to open sample stream: {}", e);
                    sleep(self.retry_delay).await;
                    continue;
                }
            };
            debug!("Sampling from {}", subscription.label());

            while let Some(event) = subscription.next().await {
                match dispatch(&mut *collector, event).await {
                    Flow::Continue => {}
                    Flow::Reconnect => break,
                    Flow::Stop => {
                        subscription.close();
                        return match collector.fatal.take() {
                            Some(error) => Err(error.into()),
                            None => Ok(()),
                        };
                    }
                }
            }

            subscription.close();
            sleep(self.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDocumentStore;
    use crate::stream::memory::MemoryStreamClient;
    use crate::text::Language;

    fn tokenizer() -> Arc<Tokenizer> {
        Arc::new(Tokenizer::new(&[Language::English]))
    }

    #[tokio::test]
    async fn test_positives_from_window() {
        let store = Arc::new(MemoryDocumentStore::new());
        let now = Utc::now();
        store
            .insert_document(&Document::new("old", "1", "obama", now - chrono::Duration::hours(7)))
            .await
            .unwrap();
        store
            .insert_document(&Document::new("new", "1", "obama", now - chrono::Duration::hours(1)))
            .await
            .unwrap();

        let sampler = CorpusSampler::new(
            store,
            Arc::new(MemoryStreamClient::default()),
            tokenizer(),
            Duration::from_secs(6 * 3600),
            Duration::from_secs(5),
        );
        let positives = sampler.positives(now).await.unwrap();
        assert_eq!(positives.len(), 1);
        assert_eq!(positives[0].id.0, "new");
    }

    #[tokio::test]
    async fn test_empty_positive_corpus_fails() {
        let sampler = CorpusSampler::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryStreamClient::default()),
            tokenizer(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );
        assert!(matches!(
            sampler.positives(Utc::now()).await,
            Err(RetrainError::EmptyCorpus { window_hours: 1 })
        ));
    }

    #[tokio::test]
    async fn test_negatives_are_balanced_and_off_topic() {
        let stream = Arc::new(MemoryStreamClient::default());
        let now = Utc::now();
        stream.queue_sample(vec![
            Document::new("1", "9", "Obama speaks", now),
            Document::new("2", "9", "cats are great", now),
            Document::new("3", "9", "lunch time", now).with_hashtags(&["USA"]),
            Document::new("4", "9", "rainy monday", now),
            Document::new("5", "9", "more weather", now),
        ]);

        let sampler = CorpusSampler::new(
            Arc::new(MemoryDocumentStore::new()),
            stream.clone(),
            tokenizer(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );
        let exclude = Arc::new(QuerySet::new(["obama", "usa"], Vec::<&str>::new()));
        let negatives = sampler.negatives(2, exclude).await.unwrap();

        let ids: Vec<&str> = negatives.iter().map(|d| d.id.0.as_str()).collect();
        assert_eq!(ids, vec!["2", "4"]);
        assert_eq!(stream.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_sampling_times_out() {
        let stream = Arc::new(MemoryStreamClient::default());
        stream.queue_sample(vec![Document::new("1", "9", "cats", Utc::now())]);

        let sampler = CorpusSampler::new(
            Arc::new(MemoryDocumentStore::new()),
            stream,
            tokenizer(),
            Duration::from_secs(3600),
            Duration::from_secs(30),
        );
        let result = sampler
            .negatives(3, Arc::new(QuerySet::new(["obama"], Vec::<&str>::new())))
            .await;
        assert!(matches!(
            result,
            Err(RetrainError::SampleTimeout { collected: 1, wanted: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_fatal_sample_error_fails_fast() {
        let stream = Arc::new(MemoryStreamClient::default());
        stream.fail_next_opens([StreamError::Unauthorized(401)]);

        let sampler = CorpusSampler::new(
            Arc::new(MemoryDocumentStore::new()),
            stream,
            tokenizer(),
            Duration::from_secs(3600),
            Duration::from_secs(30),
        );
        let result = sampler
            .negatives(1, Arc::new(QuerySet::default()))
            .await;
        assert!(matches!(
            result,
            Err(RetrainError::Stream(StreamError::Unauthorized(401)))
        ));
    }
}
