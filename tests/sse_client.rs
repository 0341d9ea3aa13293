//! SSE client against a local HTTP responder

use dynhashtag_core::config::StreamConfig;
use dynhashtag_core::filter::{
    ClassifierHandoff, FeatureEncoder, IngestSettings, IngestState, IngestionLoop,
};
use dynhashtag_core::stream::sse::SseStreamClient;
use dynhashtag_core::text::{Language, Tokenizer};
use dynhashtag_core::{
    MemoryDocumentStore, QuerySet, StreamClient, StreamError, StreamEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

fn status_json(id: usize) -> String {
    serde_json::json!({
        "id_str": id.to_string(),
        "text": format!("obama rally number {}", id),
        "created_at": "2024-03-01T12:00:00Z",
        "user": { "id_str": "7", "screen_name": "reporter" },
        "entities": { "hashtags": [{ "text": "usa" }] }
    })
    .to_string()
}

fn event_stream_response(id: usize) -> String {
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\
         connection: close\r\n\r\ndata: {}\n\n",
        status_json(id)
    )
}

const UNAUTHORIZED: &str =
    "HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

async fn read_request(socket: &mut TcpStream) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
}

/// Serves one response per connection, keeps it open for `hold`, then hangs up
async fn spawn_responder<F>(respond: F, hold: Duration) -> (String, Arc<AtomicUsize>)
where
    F: Fn(usize) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let response = respond(n);
            tokio::spawn(async move {
                read_request(&mut socket).await;
                let _ = socket.write_all(response.as_bytes()).await;
                tokio::time::sleep(hold).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (base, connections)
}

fn client(base: &str) -> SseStreamClient {
    SseStreamClient::new(&StreamConfig {
        filter_url: format!("{}/filter", base),
        sample_url: format!("{}/sample", base),
        connect_timeout_secs: 5,
        ..StreamConfig::default()
    })
}

#[tokio::test]
async fn test_subscription_starts_with_connected_then_decodes_status() {
    let (base, _) = spawn_responder(event_stream_response, Duration::ZERO).await;
    let client = client(&base);
    let filter = QuerySet::new(["obama"], Vec::<&str>::new()).to_filter();

    let mut subscription = assert_ok!(client.open(&filter).await);
    assert!(matches!(subscription.next().await, Some(StreamEvent::Connected)));

    match subscription.next().await {
        Some(StreamEvent::Document { document, author }) => {
            assert_eq!(document.id.0, "1");
            assert_eq!(document.text, "obama rally number 1");
            assert_eq!(document.entities.hashtags, vec!["usa"]);
            assert_eq!(author.unwrap().screen_name, "reporter");
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_sample_subscription_also_announces_connect() {
    let (base, _) = spawn_responder(event_stream_response, Duration::ZERO).await;
    let mut subscription = assert_ok!(client(&base).sample().await);
    assert!(matches!(subscription.next().await, Some(StreamEvent::Connected)));
    assert!(matches!(
        subscription.next().await,
        Some(StreamEvent::Document { .. })
    ));
}

#[tokio::test]
async fn test_rejected_credentials_are_fatal() {
    let (base, connections) = spawn_responder(|_| UNAUTHORIZED.to_string(), Duration::ZERO).await;
    let filter = QuerySet::new(["obama"], Vec::<&str>::new()).to_filter();

    let error = assert_err!(client(&base).open(&filter).await);
    assert_eq!(error, StreamError::Unauthorized(401));
    assert!(error.is_fatal());
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_hangups_after_successful_sessions_do_not_exhaust_reconnects() {
    let (base, _) = spawn_responder(event_stream_response, Duration::from_millis(100)).await;
    let store = Arc::new(MemoryDocumentStore::new());
    let handoff = ClassifierHandoff::new();

    let ingest = IngestionLoop::new(
        Arc::new(client(&base)),
        store.clone(),
        FeatureEncoder::new(Arc::new(Tokenizer::new(&[Language::English]))),
        handoff.subscribe(),
        QuerySet::new(["obama"], Vec::<&str>::new()),
        IngestSettings {
            reconnect_delay: Duration::from_millis(5),
            max_reconnect_delay: Duration::from_millis(20),
            max_reconnect_attempts: 3,
            handoff_poll: Duration::from_millis(50),
        },
    );
    let mut states = ingest.state_receiver();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(ingest.run(shutdown_rx));

    // The first session reaches Streaming
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == IngestState::Streaming),
    )
    .await
    .expect("ingestion never reached Streaming")
    .unwrap();

    // Every session ends in a hangup; more sessions than the attempt budget
    tokio::time::timeout(Duration::from_secs(10), async {
        while store.documents().len() < 6 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ingestion stopped reconnecting");
    assert!(!task.is_finished());

    shutdown_tx.send(()).unwrap();
    let report = task.await.unwrap().unwrap();
    assert!(report.accepted >= 6);
    assert!(report.reconnects >= 5);
}
