//! Live ingestion loop
//!
//! Keeps one filtered subscription open for the current query and routes
//! its events through [`StreamListener`]. Each document is encoded against
//! the query of the active classifier generation and kept only when that
//! classifier predicts it relevant; before the first generation arrives
//! every document is kept.
//!
//! # States
//!
//! ```text
//! Connecting --open ok--> Streaming --document--> Streaming
//!     ^  |                   |  |
//!     |  +--transient err----+  +--new snapshot--> Restarting --> Connecting
//!     |     (backoff)        |
//!     +----------------------+        fatal error / shutdown --> Stopped
//! ```
//!
//! New snapshots are picked up after every event and on a poll interval, so
//! a quiet stream still switches generations promptly. Documents arriving
//! while the subscription is being reopened are not seen.

use super::classifier::Label;
use super::encoder::FeatureEncoder;
use super::handoff::HandoffReceiver;
use super::IngestError;
use crate::config::AppConfig;
use crate::storage::DocumentStore;
use crate::stream::{
    dispatch, Flow, StreamClient, StreamError, StreamEvent, StreamListener, Subscription,
};
use crate::text::Tokenizer;
use crate::types::{Author, Document, Generation, ModelSnapshot, QuerySet};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestState {
    Connecting,
    Streaming,
    Restarting,
    Stopped,
}

/// Counters reported when the loop stops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub received: u64,
    pub accepted: u64,
    pub dropped_irrelevant: u64,
    pub store_failures: u64,
    /// Subscription restarts caused by a new classifier generation
    pub restarts: u64,
    /// Reconnects after transient stream failures
    pub reconnects: u64,
    pub generation: Option<Generation>,
}

/// Reconnect and polling behaviour
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Consecutive failures tolerated before giving up (0 = unlimited)
    pub max_reconnect_attempts: u32,
    pub handoff_poll: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 12,
            handoff_poll: Duration::from_secs(1),
        }
    }
}

impl IngestSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            reconnect_delay: config.stream.reconnect_delay(),
            max_reconnect_delay: config.stream.max_reconnect_delay(),
            max_reconnect_attempts: config.stream.max_reconnect_attempts,
            handoff_poll: config.filter.handoff_poll(),
        }
    }
}

/// Why a streaming session ended
enum SessionEnd {
    Shutdown,
    Restart,
    Reconnect(StreamError),
    Fatal(StreamError),
}

pub struct IngestionLoop {
    stream: Arc<dyn StreamClient>,
    store: Arc<dyn DocumentStore>,
    encoder: FeatureEncoder,
    handoff: HandoffReceiver,
    settings: IngestSettings,
    query: Arc<QuerySet>,
    active: Option<Arc<ModelSnapshot>>,
    state: watch::Sender<IngestState>,
    report: IngestReport,
    failures: u32,
    delay: Duration,
}

impl IngestionLoop {
    pub fn new(
        stream: Arc<dyn StreamClient>,
        store: Arc<dyn DocumentStore>,
        encoder: FeatureEncoder,
        handoff: HandoffReceiver,
        initial: QuerySet,
        settings: IngestSettings,
    ) -> Self {
        let (state, _) = watch::channel(IngestState::Connecting);
        let delay = settings.reconnect_delay;
        Self {
            stream,
            store,
            encoder,
            handoff,
            settings,
            query: Arc::new(initial),
            active: None,
            state,
            report: IngestReport::default(),
            failures: 0,
            delay,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        stream: Arc<dyn StreamClient>,
        store: Arc<dyn DocumentStore>,
        handoff: HandoffReceiver,
    ) -> Self {
        let tokenizer = Arc::new(Tokenizer::new(&config.filter.languages));
        Self::new(
            stream,
            store,
            FeatureEncoder::new(tokenizer),
            handoff,
            config.seed.query_set(),
            IngestSettings::from_config(config),
        )
    }

    /// Observe state transitions while the loop runs
    pub fn state_receiver(&self) -> watch::Receiver<IngestState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> IngestState {
        *self.state.borrow()
    }

    pub fn query(&self) -> &QuerySet {
        &self.query
    }

    pub fn active_generation(&self) -> Option<Generation> {
        self.active.as_ref().map(|s| s.generation)
    }

    pub fn report(&self) -> &IngestReport {
        &self.report
    }

    fn set_state(&self, next: IngestState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Ingestion: {:?} -> {:?}", previous, next);
        }
    }

    /// Swap in a freshly published snapshot, if any
    fn take_handoff(&mut self) -> bool {
        let Some(snapshot) = self.handoff.try_take() else {
            return false;
        };
        info!(
            "Ingestion: switching to {} ({})",
            snapshot.generation, snapshot.query
        );
        self.query = snapshot.query.clone();
        self.report.generation = Some(snapshot.generation);
        self.active = Some(snapshot);
        true
    }

    /// Decide relevance with the active classifier; cold start keeps everything
    fn is_relevant(&self, doc: &Document) -> bool {
        match &self.active {
            None => true,
            Some(snapshot) => {
                let features = self.encoder.encode(doc, &snapshot.query);
                snapshot.classifier.predict(&features) == Label::Positive
            }
        }
    }

    /// Next backoff delay with up to 25% jitter
    fn next_backoff(&mut self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.25);
        // Saturates so configured delays near Duration::MAX cannot overflow
        let wait = self.delay.saturating_add(self.delay.mul_f64(jitter));
        self.delay = self
            .delay
            .saturating_mul(2)
            .min(self.settings.max_reconnect_delay);
        wait
    }

    /// Count a failed connection; `Err` once the attempt budget is spent
    fn register_failure(&mut self, error: StreamError) -> Result<Duration, IngestError> {
        self.failures += 1;
        let limit = self.settings.max_reconnect_attempts;
        if limit > 0 && self.failures >= limit {
            error!(
                "Ingestion: giving up after {} failed attempts: {}",
                self.failures, error
            );
            return Err(IngestError::ReconnectExhausted {
                attempts: self.failures,
                last: error,
            });
        }
        let wait = self.next_backoff();
        warn!(
            "Ingestion: stream failure ({}), reconnecting in {:?} (attempt {})",
            error, wait, self.failures
        );
        Ok(wait)
    }

    /// Run until shutdown or a fatal error
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<IngestReport, IngestError> {
        info!("Ingestion loop starting with {}", self.query);
        let result = self.drive(&mut shutdown).await;
        self.set_state(IngestState::Stopped);

        match result {
            Ok(()) => {
                info!(
                    "Ingestion loop stopped: {} received, {} kept, {} dropped",
                    self.report.received, self.report.accepted, self.report.dropped_irrelevant
                );
                Ok(self.report)
            }
            Err(e) => {
                error!("Ingestion loop stopped: {}", e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), IngestError> {
        self.take_handoff();

        loop {
            self.set_state(IngestState::Connecting);
            let filter = self.query.to_filter();

            let opened = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                opened = self.stream.open(&filter) => opened,
            };

            let end = match opened {
                Ok(subscription) => {
                    debug!("Ingestion: opened {}", subscription.label());
                    self.stream_session(subscription, shutdown).await
                }
                Err(e) if e.is_fatal() => SessionEnd::Fatal(e),
                Err(e) => SessionEnd::Reconnect(e),
            };

            match end {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Fatal(e) => return Err(IngestError::Unauthorized(e)),
                SessionEnd::Restart => {
                    self.set_state(IngestState::Restarting);
                    self.report.restarts += 1;
                    self.failures = 0;
                    self.delay = self.settings.reconnect_delay;
                    // Only the newest snapshot matters
                    self.take_handoff();
                }
                SessionEnd::Reconnect(e) => {
                    let wait = self.register_failure(e)?;
                    self.report.reconnects += 1;
                    tokio::select! {
                        _ = shutdown.recv() => return Ok(()),
                        _ = sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn stream_session(
        &mut self,
        mut subscription: Subscription,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let mut poll = interval(self.settings.handoff_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = shutdown.recv() => break SessionEnd::Shutdown,
                _ = poll.tick() => {
                    if self.take_handoff() {
                        break SessionEnd::Restart;
                    }
                }
                event = subscription.next() => {
                    let Some(event) = event else {
                        break SessionEnd::Reconnect(StreamError::Closed);
                    };
                    let error = match &event {
                        StreamEvent::Error(e) => Some(e.clone()),
                        _ => None,
                    };
                    match dispatch(&mut *self, event).await {
                        Flow::Continue => {
                            if self.take_handoff() {
                                break SessionEnd::Restart;
                            }
                        }
                        Flow::Reconnect => {
                            break SessionEnd::Reconnect(error.unwrap_or(StreamError::Closed));
                        }
                        Flow::Stop => {
                            break SessionEnd::Fatal(error.unwrap_or(StreamError::Closed));
                        }
                    }
                }
            }
        };

        subscription.close();
        end
    }
}

#[async_trait]
impl StreamListener for IngestionLoop {
    async fn on_connect(&mut self) -> Flow {
        info!("Ingestion: streaming {}", self.query);
        self.set_state(IngestState::Streaming);
        self.failures = 0;
        self.delay = self.settings.reconnect_delay;
        Flow::Continue
    }

    async fn on_document(&mut self, document: Document, author: Option<Author>) -> Flow {
        self.report.received += 1;

        if !self.is_relevant(&document) {
            self.report.dropped_irrelevant += 1;
            debug!("Ingestion: dropped {} as irrelevant", document.id);
            return Flow::Continue;
        }

        if let Some(author) = &author {
            if let Err(e) = self.store.insert_author(author).await {
                warn!("Failed to store author {}: {}", author.id, e);
                self.report.store_failures += 1;
                return Flow::Continue;
            }
        }
        if let Err(e) = self.store.insert_document(&document).await {
            warn!("Failed to store document {}: {}", document.id, e);
            self.report.store_failures += 1;
            return Flow::Continue;
        }

        self.report.accepted += 1;
        debug!("Ingestion: kept {}", document.id);
        Flow::Continue
    }

    async fn on_disconnect(&mut self) -> Flow {
        info!("Ingestion: stream disconnected");
        Flow::Reconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::classifier::{Classifier, LogisticClassifier};
    use crate::filter::encoder::FeatureVector;
    use crate::filter::handoff::ClassifierHandoff;
    use crate::storage::MemoryDocumentStore;
    use crate::stream::memory::MemoryStreamClient;
    use crate::text::Language;
    use chrono::Utc;

    /// Keeps documents containing at least one query keyword
    struct KeywordHit;

    impl Classifier for KeywordHit {
        fn name(&self) -> &str {
            "keyword-hit"
        }

        fn predict(&self, features: &FeatureVector) -> Label {
            Label::from(features.keyword_flags().iter().any(|f| *f > 0.0))
        }
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            max_reconnect_attempts: 3,
            handoff_poll: Duration::from_millis(20),
        }
    }

    fn ingestion(
        stream: Arc<MemoryStreamClient>,
        store: Arc<MemoryDocumentStore>,
        handoff: &ClassifierHandoff,
    ) -> IngestionLoop {
        IngestionLoop::new(
            stream,
            store,
            FeatureEncoder::new(Arc::new(Tokenizer::new(&[Language::English]))),
            handoff.subscribe(),
            QuerySet::new(["obama"], Vec::<&str>::new()),
            settings(),
        )
    }

    fn snapshot(generation: u64, keywords: &[&str]) -> Arc<ModelSnapshot> {
        Arc::new(ModelSnapshot {
            generation: Generation(generation),
            classifier: Arc::new(KeywordHit),
            query: Arc::new(QuerySet::new(keywords, Vec::<&str>::new())),
            trained_at: Utc::now(),
            positives: 0,
            negatives: 0,
        })
    }

    #[tokio::test]
    async fn test_cold_start_keeps_everything() {
        let stream = Arc::new(MemoryStreamClient::default());
        let store = Arc::new(MemoryDocumentStore::new());
        let handoff = ClassifierHandoff::new();
        let mut ingest = ingestion(stream, store.clone(), &handoff);

        let doc = Document::new("1", "7", "obama rally", Utc::now());
        assert_eq!(ingest.on_document(doc, Some(Author::new("7", "someone"))).await, Flow::Continue);

        assert_eq!(store.documents().len(), 1);
        assert!(store.author(&"7".into()).is_some());
        assert_eq!(ingest.report().accepted, 1);
    }

    #[tokio::test]
    async fn test_active_classifier_drops_irrelevant() {
        let stream = Arc::new(MemoryStreamClient::default());
        let store = Arc::new(MemoryDocumentStore::new());
        let handoff = ClassifierHandoff::new();
        handoff.put(snapshot(1, &["obama"]));

        let mut ingest = ingestion(stream, store.clone(), &handoff);
        assert!(ingest.take_handoff());
        assert_eq!(ingest.active_generation(), Some(Generation(1)));

        let now = Utc::now();
        ingest.on_document(Document::new("1", "7", "obama rally", now), None).await;
        ingest.on_document(Document::new("2", "7", "just #obama", now), None).await;

        assert_eq!(store.documents().len(), 1);
        assert_eq!(ingest.report().dropped_irrelevant, 1);
    }

    #[tokio::test]
    async fn test_store_failure_drops_document() {
        let stream = Arc::new(MemoryStreamClient::default());
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_fail_writes(true);
        let handoff = ClassifierHandoff::new();

        let mut ingest = ingestion(stream, store.clone(), &handoff);
        let flow = ingest
            .on_document(Document::new("1", "7", "obama", Utc::now()), None)
            .await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(ingest.report().store_failures, 1);
        assert_eq!(ingest.report().accepted, 0);
    }

    #[tokio::test]
    async fn test_handoff_restarts_subscription_with_new_query() {
        let stream = Arc::new(MemoryStreamClient::default());
        let store = Arc::new(MemoryDocumentStore::new());
        let handoff = ClassifierHandoff::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let ingest = ingestion(stream.clone(), store.clone(), &handoff);
        let task = tokio::spawn(ingest.run(shutdown_rx));

        stream.wait_for_opens(1).await;
        handoff.put(snapshot(1, &["obama", "senate"]));
        stream.wait_for_opens(2).await;

        let filters = stream.opened_filters();
        assert_eq!(filters[0].track, vec!["obama"]);
        assert_eq!(filters[1].track, vec!["obama", "senate"]);

        shutdown_tx.send(()).unwrap();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.restarts, 1);
        assert_eq!(report.generation, Some(Generation(1)));
        assert_eq!(stream.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_stops_loop() {
        let stream = Arc::new(MemoryStreamClient::default());
        stream.fail_next_opens([StreamError::Unauthorized(401)]);
        let handoff = ClassifierHandoff::new();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let ingest = ingestion(stream, Arc::new(MemoryDocumentStore::new()), &handoff);
        let mut states = ingest.state_receiver();
        let result = ingest.run(shutdown_rx).await;

        assert_eq!(
            result,
            Err(IngestError::Unauthorized(StreamError::Unauthorized(401)))
        );
        assert_eq!(*states.borrow_and_update(), IngestState::Stopped);
    }

    #[tokio::test]
    async fn test_reconnect_attempts_are_bounded() {
        let stream = Arc::new(MemoryStreamClient::default());
        stream.fail_next_opens(vec![StreamError::Transient("boom".into()); 3]);
        let handoff = ClassifierHandoff::new();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let result = ingestion(stream, Arc::new(MemoryDocumentStore::new()), &handoff)
            .run(shutdown_rx)
            .await;

        assert_eq!(
            result,
            Err(IngestError::ReconnectExhausted {
                attempts: 3,
                last: StreamError::Transient("boom".into()),
            })
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let stream = Arc::new(MemoryStreamClient::default());
        let handoff = ClassifierHandoff::new();
        let mut ingest = ingestion(stream, Arc::new(MemoryDocumentStore::new()), &handoff);

        let first = ingest.next_backoff();
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_micros(12_500));
        ingest.next_backoff();
        ingest.next_backoff();
        assert_eq!(ingest.delay, Duration::from_millis(40));
    }

    #[test]
    fn test_backoff_saturates_on_huge_delays() {
        let stream = Arc::new(MemoryStreamClient::default());
        let handoff = ClassifierHandoff::new();
        let mut ingest = ingestion(stream, Arc::new(MemoryDocumentStore::new()), &handoff);
        ingest.settings.max_reconnect_delay = Duration::MAX;
        ingest.delay = Duration::from_secs(u64::MAX / 2);

        let first = ingest.next_backoff();
        assert!(first >= Duration::from_secs(u64::MAX / 2));
        for _ in 0..3 {
            assert!(ingest.next_backoff() >= first);
        }
        assert_eq!(ingest.delay, Duration::MAX);
        assert_eq!(ingest.next_backoff(), Duration::MAX);
    }

    #[test]
    fn test_logistic_snapshot_is_accepted() {
        // Snapshots built by the trainer plug into the same path
        let classifier: Arc<dyn Classifier> = Arc::new(LogisticClassifier::new([4.0, 0.0, -4.0, 0.0], 0.0));
        let encoder = FeatureEncoder::new(Arc::new(Tokenizer::new(&[Language::English])));
        let query = QuerySet::new(["obama"], Vec::<&str>::new());
        let doc = Document::new("1", "2", "obama", Utc::now());
        assert_eq!(classifier.predict(&encoder.encode(&doc, &query)), Label::Positive);
    }
}
