//! Ingestion loop behaviour across disconnects, stream errors and classifier swaps

mod common;

use chrono::Utc;
use common::doc;
use dynhashtag_core::filter::{
    ClassifierHandoff, FeatureEncoder, IngestError, IngestSettings, IngestState, IngestionLoop,
    LogisticClassifier,
};
use dynhashtag_core::stream::memory::MemoryStreamClient;
use dynhashtag_core::text::{Language, Tokenizer};
use dynhashtag_core::{Generation, MemoryDocumentStore, ModelSnapshot, QuerySet, StreamError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Fixture {
    stream: Arc<MemoryStreamClient>,
    store: Arc<MemoryDocumentStore>,
    handoff: ClassifierHandoff,
}

impl Fixture {
    fn new() -> Self {
        Self {
            stream: Arc::new(MemoryStreamClient::default()),
            store: Arc::new(MemoryDocumentStore::new()),
            handoff: ClassifierHandoff::new(),
        }
    }

    fn ingestion(&self, reconnect_delay: Duration) -> IngestionLoop {
        IngestionLoop::new(
            self.stream.clone(),
            self.store.clone(),
            FeatureEncoder::new(Arc::new(Tokenizer::new(&[Language::English]))),
            self.handoff.subscribe(),
            QuerySet::new(["obama"], Vec::<&str>::new()),
            IngestSettings {
                reconnect_delay,
                max_reconnect_delay: reconnect_delay * 4,
                max_reconnect_attempts: 0,
                handoff_poll: Duration::from_millis(10),
            },
        )
    }

    async fn wait_for_stored(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.store.documents().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("documents were not stored in time");
    }
}

/// Keeps documents that mostly consist of query keywords
fn snapshot(generation: u64, keywords: &[&str]) -> Arc<ModelSnapshot> {
    Arc::new(ModelSnapshot {
        generation: Generation(generation),
        classifier: Arc::new(LogisticClassifier::new([4.0, 0.0, -4.0, 0.0], 0.0)),
        query: Arc::new(QuerySet::new(keywords, Vec::<&str>::new())),
        trained_at: Utc::now(),
        positives: 10,
        negatives: 10,
    })
}

#[tokio::test]
async fn test_reconnects_after_server_disconnect() {
    let fixture = Fixture::new();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let ingest = fixture.ingestion(Duration::from_millis(10));
    let mut states = ingest.state_receiver();
    let task = tokio::spawn(ingest.run(shutdown_rx));

    fixture.stream.wait_for_opens(1).await;
    fixture.stream.publish(doc("1", "7", "obama speaks"), None);
    fixture.wait_for_stored(1).await;

    fixture.stream.disconnect_all();
    fixture.stream.wait_for_opens(2).await;
    states
        .wait_for(|state| *state == IngestState::Streaming)
        .await
        .unwrap();

    fixture.stream.publish(doc("2", "7", "obama again"), None);
    fixture.wait_for_stored(2).await;

    shutdown_tx.send(()).unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.reconnects, 1);
    assert_eq!(report.restarts, 0);
    assert_eq!(report.accepted, 2);
    assert_eq!(fixture.stream.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_transient_error_triggers_reconnect() {
    let fixture = Fixture::new();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(fixture.ingestion(Duration::from_millis(10)).run(shutdown_rx));

    fixture.stream.wait_for_opens(1).await;
    fixture
        .stream
        .inject_error(StreamError::Transient("connection reset".into()));
    fixture.stream.wait_for_opens(2).await;

    // The same query is reopened
    let filters = fixture.stream.opened_filters();
    assert_eq!(filters[0], filters[1]);

    shutdown_tx.send(()).unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.reconnects, 1);
}

#[tokio::test]
async fn test_unauthorized_mid_stream_is_fatal() {
    let fixture = Fixture::new();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(fixture.ingestion(Duration::from_millis(10)).run(shutdown_rx));

    fixture.stream.wait_for_opens(1).await;
    fixture.stream.inject_error(StreamError::Unauthorized(401));

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("ingestion did not stop")
        .unwrap();
    assert_eq!(
        result.unwrap_err(),
        IngestError::Unauthorized(StreamError::Unauthorized(401))
    );
    assert_eq!(fixture.stream.opened_filters().len(), 1);
}

#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let fixture = Fixture::new();
    fixture
        .stream
        .fail_next_opens([StreamError::Transient("refused".into())]);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(fixture.ingestion(Duration::from_secs(60)).run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("shutdown did not interrupt the backoff")
        .unwrap()
        .unwrap();
    assert_eq!(report.reconnects, 1);
    assert!(fixture.stream.opened_filters().is_empty());
}

#[tokio::test]
async fn test_only_freshest_snapshot_is_adopted() {
    let fixture = Fixture::new();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(fixture.ingestion(Duration::from_millis(10)).run(shutdown_rx));
    fixture.stream.wait_for_opens(1).await;

    // Two publishes before the loop polls: the first is never seen
    fixture.handoff.put(snapshot(1, &["obama", "senate"]));
    fixture.handoff.put(snapshot(2, &["obama", "senate", "vote"]));
    fixture.stream.wait_for_opens(2).await;

    let filters = fixture.stream.opened_filters();
    assert_eq!(filters.len(), 2);
    assert_eq!(filters[1].track, vec!["obama", "senate", "vote"]);

    // With the classifier active, off-topic matches are dropped
    fixture.stream.publish(doc("1", "7", "vote"), None);
    fixture
        .stream
        .publish(doc("2", "7", "vote for the weather forecast channel today"), None);
    fixture.stream.publish(doc("3", "7", "senate vote"), None);
    fixture.wait_for_stored(2).await;

    shutdown_tx.send(()).unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.restarts, 1);
    assert_eq!(report.generation, Some(Generation(2)));
    assert_eq!(report.received, 3);
    assert_eq!(report.dropped_irrelevant, 1);
}
