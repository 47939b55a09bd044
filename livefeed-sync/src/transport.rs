//! Upstream subscription transport.
//!
//! [`EventSource`] is the seam between the connection manager and the wire:
//! `connect` either fails (the session never opened) or yields a stream of
//! decoded server-sent events. The stream ending, or yielding an error, ends
//! the session.
//!
//! [`HttpEventSource`] is the production implementation: a streaming HTTP GET
//! whose body is fed through an [`SseDecoder`].

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use thiserror::Error;

use crate::sse::{SseDecoder, SseEvent};

/// The upstream subscription failed or dropped. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("upstream answered HTTP {0}")]
    Status(u16),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("stream closed by upstream")]
    Closed,
}

/// Events of one open session.
pub type EventStream = BoxStream<'static, Result<SseEvent, TransportError>>;

/// Opens upstream sessions.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<EventStream, TransportError>;
}

/// Server-sent events over a streaming HTTP response.
#[derive(Debug, Clone)]
pub struct HttpEventSource {
    client: reqwest::Client,
}

impl HttpEventSource {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self, endpoint: &str) -> Result<EventStream, TransportError> {
        let response = self
            .client
            .get(endpoint)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let mut decoder = SseDecoder::new();
        let events = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.feed(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(TransportError::Stream(e.to_string()))],
            })
            .flat_map(stream::iter);
        Ok(events.boxed())
    }
}
