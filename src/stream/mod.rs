//! Subscription client collaborator
//!
//! A [`StreamClient`] opens filtered or raw-sample subscriptions. Each
//! [`Subscription`] yields [`StreamEvent`]s until it is closed or the remote
//! end disconnects. Consumers implement [`StreamListener`] and route events
//! through [`dispatch`].
//!
//! Implementations:
//! - [`sse::SseStreamClient`]: Server-Sent Events over HTTP
//! - [`memory::MemoryStreamClient`]: in-process feed for tests and replays

pub mod memory;
pub mod sse;
pub mod wire;

use crate::types::{Author, Document, StreamFilter};
use async_trait::async_trait;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Network trouble, rate limiting, server hiccups: worth retrying
    #[error("Transient stream failure: {0}")]
    Transient(String),

    /// Credentials rejected; retrying cannot help
    #[error("Stream rejected credentials (HTTP {0})")]
    Unauthorized(u16),

    #[error("Subscription closed")]
    Closed,
}

impl StreamError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Unauthorized(_))
    }
}

/// Event delivered by a subscription
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    Document {
        document: Document,
        author: Option<Author>,
    },
    Error(StreamError),
    Disconnected,
}

type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Handle to one open subscription
///
/// Dropping the handle closes the underlying connection.
pub struct Subscription {
    label: String,
    events: EventStream,
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<S>(label: impl Into<String>, events: S) -> Self
    where
        S: Stream<Item = StreamEvent> + Send + 'static,
    {
        Self {
            label: label.into(),
            events: Box::pin(events),
            on_close: None,
        }
    }

    /// Run `hook` once when the subscription is closed or dropped
    pub fn with_close_hook(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next event; `None` once the remote end has gone away
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.next().await
    }

    pub fn close(self) {
        debug!("Closing subscription {}", self.label);
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("label", &self.label).finish()
    }
}

/// Subscription client collaborator
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Open a subscription delivering documents that match `filter`
    async fn open(&self, filter: &StreamFilter) -> Result<Subscription, StreamError>;

    /// Open a subscription on the unfiltered random sample
    async fn sample(&self) -> Result<Subscription, StreamError>;
}

/// What the event source should do after a listener callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Reconnect,
    Stop,
}

/// Capability interface for consumers of a subscription
#[async_trait]
pub trait StreamListener: Send {
    async fn on_connect(&mut self) -> Flow {
        Flow::Continue
    }

    async fn on_document(&mut self, document: Document, author: Option<Author>) -> Flow;

    async fn on_error(&mut self, error: StreamError) -> Flow {
        if error.is_fatal() {
            Flow::Stop
        } else {
            Flow::Reconnect
        }
    }

    async fn on_disconnect(&mut self) -> Flow {
        Flow::Reconnect
    }
}

/// Route one event to the matching listener callback
pub async fn dispatch<L>(listener: &mut L, event: StreamEvent) -> Flow
where
    L: StreamListener + ?Sized,
{
    match event {
        StreamEvent::Connected => listener.on_connect().await,
        StreamEvent::Document { document, author } => listener.on_document(document, author).await,
        StreamEvent::Error(error) => listener.on_error(error).await,
        StreamEvent::Disconnected => listener.on_disconnect().await,
    }
}
