//! Streaming HTTP reader for the upstream provider
//!
//! [`HttpUpstream`] POSTs a [`ProviderRequest`] and turns the response body
//! into a [`DeltaStream`] of text deltas. The stream ends after the `[DONE]`
//! sentinel (or at end of body), and yields a single terminal `Err` on a
//! provider error record or a dropped connection.
//!
//! Dropping the stream closes the connection, which is how the coordinator
//! stops a cancelled or timed-out read.

use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{RelayError, Result};
use crate::request::ProviderRequest;
use crate::upstream::wire::{decode_record, RecordDecoder, WireRecord};
use crate::upstream::{DeltaStream, Upstream};

/// Upstream reader speaking the record protocol over HTTP
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use storyrelay::upstream::HttpUpstream;
///
/// let upstream = HttpUpstream::new(
///     url::Url::parse("http://localhost:5000/api/stream").unwrap(),
///     Duration::from_secs(10),
/// )
/// .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpUpstream {
    /// Build a reader for `endpoint`
    ///
    /// Only connection establishment is bounded here; the overall session
    /// deadline belongs to the coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the HTTP client cannot be built.
    pub fn new(endpoint: url::Url, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, endpoint })
    }

    /// Build a reader from the provider and relay sections of the config
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        let endpoint = url::Url::parse(&config.provider.endpoint)
            .map_err(|e| RelayError::Config(format!("invalid provider endpoint: {}", e)))?;
        Self::new(endpoint, config.relay.connect_timeout())
    }

    /// Target endpoint
    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn open(&self, request: &ProviderRequest) -> std::result::Result<DeltaStream, RelayError> {
        tracing::debug!(endpoint = %self.endpoint, model = %request.model, "Opening upstream stream");

        let response = self
            .client
            .post(self.endpoint.as_str())
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                RelayError::Connection(format!("request to {} failed: {}", self.endpoint, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Connection(format!(
                "provider returned HTTP {}: {}",
                status,
                body.trim()
            )));
        }

        Ok(decode_deltas(response.bytes_stream()))
    }
}

struct DecodeState<S> {
    body: S,
    decoder: RecordDecoder,
    ready: VecDeque<std::result::Result<String, RelayError>>,
    finished: bool,
}

impl<S> DecodeState<S> {
    /// Classify one record; returns false once the stream must stop
    fn accept(&mut self, record: &str) -> bool {
        match decode_record(record) {
            WireRecord::Chunk(text) => {
                self.ready.push_back(Ok(text));
                true
            }
            WireRecord::Error(message) => {
                self.ready.push_back(Err(RelayError::Provider(message)));
                false
            }
            WireRecord::Done => {
                tracing::debug!("Upstream sent end-of-stream sentinel");
                false
            }
            WireRecord::Ignored => true,
            WireRecord::Malformed { payload, reason } => {
                tracing::warn!(%payload, %reason, "Skipping malformed upstream record");
                crate::metrics::record_protocol_warning();
                true
            }
        }
    }

    fn drain_records(&mut self) {
        while let Some(record) = self.decoder.next_record() {
            if !self.accept(&record) {
                self.finished = true;
                return;
            }
        }
    }
}

/// Turn a raw body byte stream into a stream of text deltas
///
/// Exposed so that any byte source (not only reqwest) can be decoded the
/// same way.
pub fn decode_deltas<S, E>(body: S) -> DeltaStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: RecordDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.decoder.push(&bytes);
                    state.drain_records();
                }
                Some(Err(e)) => {
                    state.ready.push_back(Err(RelayError::Connection(format!(
                        "upstream connection lost: {}",
                        e
                    ))));
                    state.finished = true;
                }
                None => {
                    if let Some(rest) = state.decoder.finish() {
                        state.accept(&rest);
                    }
                    state.finished = true;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(parts: &[&str]) -> impl Stream<Item = std::result::Result<Bytes, String>> {
        let owned: Vec<std::result::Result<Bytes, String>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        futures::stream::iter(owned)
    }

    async fn collect(stream: DeltaStream) -> Vec<std::result::Result<String, String>> {
        stream
            .map(|item| item.map_err(|e| e.to_string()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_deltas_until_sentinel() {
        let stream = decode_deltas(body(&[
            "data: {\"status\": \"started\"}\n\n",
            "data: {\"chunk\": \"Hello\"}\n\ndata: {\"chunk\": \" there\"}\n\n",
            "data: [DONE]\n\n",
            "data: {\"chunk\": \"after done\"}\n\n",
        ]));

        let items = collect(stream).await;
        assert_eq!(
            items,
            vec![Ok("Hello".to_string()), Ok(" there".to_string())]
        );
    }

    #[tokio::test]
    async fn test_records_split_across_reads() {
        let stream = decode_deltas(body(&[
            "data: {\"chu",
            "nk\": \"split\"}\n",
            "\ndata: [DONE]\n\n",
        ]));

        let items = collect(stream).await;
        assert_eq!(items, vec![Ok("split".to_string())]);
    }

    #[tokio::test]
    async fn test_error_record_ends_stream_with_provider_error() {
        let stream = decode_deltas(body(&[
            "data: {\"chunk\": \"partial\"}\n\n",
            "data: {\"error\": \"x\", \"status\": \"error\"}\n\n",
            "data: [DONE]\n\n",
        ]));

        let mut stream = stream;
        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        match stream.next().await {
            Some(Err(RelayError::Provider(message))) => assert_eq!(message, "x"),
            other => panic!("expected provider error, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let stream = decode_deltas(body(&[
            "data: {\"chunk\": \"a\"}\n\ndata: {oops\n\ndata: {\"chunk\": \"b\"}\n\n",
        ]));

        let items = collect(stream).await;
        assert_eq!(items, vec![Ok("a".to_string()), Ok("b".to_string())]);
    }

    #[tokio::test]
    async fn test_body_error_becomes_connection_error() {
        let parts: Vec<std::result::Result<Bytes, String>> = vec![
            Ok(Bytes::from("data: {\"chunk\": \"a\"}\n\n")),
            Err("reset by peer".to_string()),
        ];
        let mut stream = decode_deltas(futures::stream::iter(parts));

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        match stream.next().await {
            Some(Err(RelayError::Connection(message))) => {
                assert!(message.contains("reset by peer"))
            }
            other => panic!("expected connection error, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_end_of_body_without_sentinel_flushes_tail() {
        let stream = decode_deltas(body(&["data: {\"chunk\": \"a\"}\n\ndata: {\"chunk\": \"b\"}"]));

        let items = collect(stream).await;
        assert_eq!(items, vec![Ok("a".to_string()), Ok("b".to_string())]);
    }

    #[test]
    fn test_new_keeps_endpoint() {
        let upstream = HttpUpstream::new(
            url::Url::parse("http://localhost:9999/api/stream").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(upstream.endpoint().path(), "/api/stream");
    }
}
