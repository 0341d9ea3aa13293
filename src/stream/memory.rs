//! In-process stream client
//!
//! Documents published to a [`MemoryStreamClient`] fan out to every open
//! subscription whose filter matches, and to every sample subscription.
//! Documents published while nothing is subscribed are lost, like a real
//! stream during a reconnect.

use super::{StreamClient, StreamError, StreamEvent, Subscription};
use crate::types::{Author, Document, QuerySet, StreamFilter};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
enum FeedItem {
    Document(Document, Option<Author>),
    Error(StreamError),
    Disconnect,
}

/// [`StreamClient`] backed by a broadcast channel
pub struct MemoryStreamClient {
    feed: broadcast::Sender<FeedItem>,
    opened_filters: Mutex<Vec<StreamFilter>>,
    open_count: watch::Sender<usize>,
    sample_count: watch::Sender<usize>,
    active: Arc<AtomicUsize>,
    scripted_failures: Mutex<VecDeque<StreamError>>,
    sample_backlog: Mutex<VecDeque<Document>>,
}

impl Default for MemoryStreamClient {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryStreamClient {
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity);
        let (open_count, _) = watch::channel(0);
        let (sample_count, _) = watch::channel(0);
        Self {
            feed,
            opened_filters: Mutex::new(Vec::new()),
            open_count,
            sample_count,
            active: Arc::new(AtomicUsize::new(0)),
            scripted_failures: Mutex::new(VecDeque::new()),
            sample_backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Deliver a document to current subscribers; returns how many received it
    pub fn publish(&self, document: Document, author: Option<Author>) -> usize {
        self.feed
            .send(FeedItem::Document(document, author))
            .unwrap_or(0)
    }

    /// Push an error event into every open subscription
    pub fn inject_error(&self, error: StreamError) {
        let _ = self.feed.send(FeedItem::Error(error));
    }

    /// End every open subscription as if the server hung up
    pub fn disconnect_all(&self) {
        let _ = self.feed.send(FeedItem::Disconnect);
    }

    /// Make the next `open`/`sample` calls fail with these errors, in order
    pub fn fail_next_opens<I: IntoIterator<Item = StreamError>>(&self, errors: I) {
        lock(&self.scripted_failures).extend(errors);
    }

    /// Documents the next sample subscription replays before going live
    pub fn queue_sample<I: IntoIterator<Item = Document>>(&self, documents: I) {
        lock(&self.sample_backlog).extend(documents);
    }

    /// Filters of every successful `open`, oldest first
    pub fn opened_filters(&self) -> Vec<StreamFilter> {
        lock(&self.opened_filters).clone()
    }

    /// Subscriptions (filtered or sample) not yet closed
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until `open` has succeeded at least `count` times
    pub async fn wait_for_opens(&self, count: usize) {
        let mut rx = self.open_count.subscribe();
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }

    /// Wait until `sample` has succeeded at least `count` times
    pub async fn wait_for_samples(&self, count: usize) {
        let mut rx = self.sample_count.subscribe();
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }

    fn take_scripted_failure(&self) -> Option<StreamError> {
        lock(&self.scripted_failures).pop_front()
    }

    fn subscription(
        &self,
        label: String,
        backlog: Vec<Document>,
        query: Option<QuerySet>,
    ) -> Subscription {
        let live = BroadcastStream::new(self.feed.subscribe())
            .filter_map(move |item| match item {
                Ok(FeedItem::Document(document, author)) => {
                    let wanted = query.as_ref().map_or(true, |q| q.matches(&document));
                    wanted.then_some(StreamEvent::Document { document, author })
                }
                Ok(FeedItem::Error(error)) => Some(StreamEvent::Error(error)),
                Ok(FeedItem::Disconnect) => Some(StreamEvent::Disconnected),
                Err(lagged) => {
                    warn!("Memory stream subscriber lagged: {}", lagged);
                    None
                }
            })
            // The server hangs up after signalling a disconnect
            .take_while(|event| !matches!(event, StreamEvent::Disconnected));

        let replay = backlog
            .into_iter()
            .map(|document| StreamEvent::Document { document, author: None });
        let events = tokio_stream::iter(std::iter::once(StreamEvent::Connected).chain(replay))
            .chain(live);

        self.active.fetch_add(1, Ordering::SeqCst);
        let active = self.active.clone();
        Subscription::new(label, events).with_close_hook(move || {
            active.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl StreamClient for MemoryStreamClient {
    async fn open(&self, filter: &StreamFilter) -> Result<Subscription, StreamError> {
        if let Some(error) = self.take_scripted_failure() {
            debug!("Memory stream: scripted open failure: {}", error);
            return Err(error);
        }

        let query = QuerySet::new(&filter.track, filter.follow.iter().map(|a| a.as_str()));
        let subscription = self.subscription(format!("memory-filter({})", query), Vec::new(), Some(query));

        lock(&self.opened_filters).push(filter.clone());
        self.open_count.send_modify(|count| *count += 1);
        Ok(subscription)
    }

    async fn sample(&self) -> Result<Subscription, StreamError> {
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }

        let backlog: Vec<Document> = lock(&self.sample_backlog).drain(..).collect();
        let subscription = self.subscription("memory-sample".to_string(), backlog, None);

        self.sample_count.send_modify(|count| *count += 1);
        Ok(subscription)
    }
}
