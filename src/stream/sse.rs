//! Server-Sent Events subscription client
//!
//! Opens the filtered stream (`track`/`follow` query parameters) or the raw
//! sample stream as SSE connections. Each SSE `data` field carries one status
//! payload decoded by [`super::wire`].
//!
//! # Reconnection
//!
//! The client never reconnects on its own: a failed or dropped connection is
//! surfaced as a [`StreamEvent::Error`] or the end of the subscription, and
//! the ingestion loop owns the backoff policy.

use super::wire::decode_status;
use super::{StreamClient, StreamError, StreamEvent, Subscription};
use crate::config::StreamConfig;
use crate::types::StreamFilter;
use async_trait::async_trait;
use eventsource_client as es;
use es::Client as _;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use url::Url;

/// SSE-backed [`StreamClient`]
pub struct SseStreamClient {
    filter_url: String,
    sample_url: String,
    access_token: Option<SecretString>,
    connect_timeout: Duration,
}

impl SseStreamClient {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            filter_url: config.filter_url.clone(),
            sample_url: config.sample_url.clone(),
            access_token: config
                .access_token
                .clone()
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Filtered stream URL with comma-separated `track` and `follow` parameters
    pub fn filter_endpoint(&self, filter: &StreamFilter) -> Result<Url, StreamError> {
        let mut url = Url::parse(&self.filter_url)
            .map_err(|e| StreamError::Transient(format!("invalid filter_url: {}", e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            if !filter.track.is_empty() {
                pairs.append_pair("track", &filter.track.join(","));
            }
            if !filter.follow.is_empty() {
                let follow: Vec<&str> = filter.follow.iter().map(|a| a.as_str()).collect();
                pairs.append_pair("follow", &follow.join(","));
            }
        }
        Ok(url)
    }

    async fn connect(&self, label: String, url: &str) -> Result<Subscription, StreamError> {
        debug!("SSE client: connecting to {}", url);

        let mut builder = es::ClientBuilder::for_url(url)
            .map_err(|e| StreamError::Transient(format!("failed to build client: {}", e)))?;
        if let Some(token) = &self.access_token {
            builder = builder
                .header(
                    "Authorization",
                    &format!("Bearer {}", token.expose_secret()),
                )
                .map_err(|e| StreamError::Transient(format!("invalid auth header: {}", e)))?;
        }
        let client = builder
            .reconnect(es::ReconnectOptions::reconnect(false).build())
            .build();

        let mut events = client.stream().filter_map(convert_sse_item);

        // The connection is only established once the stream is polled, so
        // wait for the first item to learn whether the server accepted us.
        let first = tokio::time::timeout(self.connect_timeout, events.next())
            .await
            .map_err(|_| {
                StreamError::Transient(format!(
                    "no response from {} within {:?}",
                    url, self.connect_timeout
                ))
            })?;

        // The consumed marker is replayed so listeners still see on_connect
        let connected = tokio_stream::once(StreamEvent::Connected);
        match first {
            Some(StreamEvent::Connected) => {
                info!("SSE client: connected ({})", label);
                Ok(Subscription::new(label, connected.chain(events)))
            }
            Some(StreamEvent::Error(e)) => Err(e),
            Some(StreamEvent::Disconnected) | None => Err(StreamError::Transient(
                "stream closed before connecting".to_string(),
            )),
            Some(early) => {
                // Data before the connected marker: keep it
                let early = tokio_stream::once(early);
                Ok(Subscription::new(label, connected.chain(early).chain(events)))
            }
        }
    }
}

/// Map one SSE item to a stream event; comments and undecodable payloads are skipped
fn convert_sse_item(item: Result<es::SSE, es::Error>) -> Option<StreamEvent> {
    match item {
        Ok(es::SSE::Connected(_)) => Some(StreamEvent::Connected),
        Ok(es::SSE::Event(event)) => match decode_status(&event.data) {
            Some((document, author)) => Some(StreamEvent::Document {
                document,
                author: Some(author),
            }),
            None => {
                debug!("SSE client: skipping malformed payload (type: {})", event.event_type);
                None
            }
        },
        Ok(es::SSE::Comment(_)) => None,
        Err(e) => Some(StreamEvent::Error(classify_error(e))),
    }
}

/// Authorization failures are fatal; everything else is retried
fn classify_error(err: es::Error) -> StreamError {
    match err {
        es::Error::UnexpectedResponse(response, _) => {
            let status = response.status();
            if status == 401 || status == 403 {
                StreamError::Unauthorized(status)
            } else {
                warn!("SSE client: unexpected HTTP status {}", status);
                StreamError::Transient(format!("unexpected HTTP status {}", status))
            }
        }
        es::Error::StreamClosed => StreamError::Closed,
        other => StreamError::Transient(other.to_string()),
    }
}

#[async_trait]
impl StreamClient for SseStreamClient {
    async fn open(&self, filter: &StreamFilter) -> Result<Subscription, StreamError> {
        let url = self.filter_endpoint(filter)?;
        let label = format!(
            "filter(track={}, follow={})",
            filter.track.len(),
            filter.follow.len()
        );
        self.connect(label, url.as_str()).await
    }

    async fn sample(&self) -> Result<Subscription, StreamError> {
        let url = self.sample_url.clone();
        self.connect("sample".to_string(), &url).await
    }
}
