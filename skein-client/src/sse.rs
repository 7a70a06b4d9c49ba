//! Server-sent events over reqwest.

use crate::executor::headers;
use crate::transport::resolve;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use skein_core::{ClientConfig, ClientError, ClientResult, EventSource, EventStream};
use std::time::Duration;

/// Incremental `text/event-stream` decoder.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; only complete lines
/// are interpreted. Each blank line dispatches the `data` lines gathered
/// since the previous one, joined by `\n`. Other fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the payloads it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        events
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let event = self.data.join("\n");
            self.data.clear();
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}

/// [`EventSource`] reading the configured SSE endpoint.
#[derive(Clone)]
pub struct SseEventSource {
    client: reqwest::Client,
    url: String,
}

impl SseEventSource {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        // No overall timeout: the stream is expected to stay open.
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        let base = config.api_base_url.trim_end_matches('/');
        Ok(Self {
            client,
            url: resolve(base, &config.event_stream_path),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn connect(&self, token: Option<String>) -> ClientResult<EventStream> {
        let mut request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(headers::REQUESTED_WITH, headers::REQUESTED_WITH_VALUE);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(ClientError::Http { status });
        }

        let mut decoder = SseDecoder::new();
        let events = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(err) => vec![Err(ClientError::Network(err.to_string()))],
            })
            .flat_map(stream::iter);
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"Events\":[]}\n\n");
        assert_eq!(events, vec!["{\"Events\":[]}".to_string()]);
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"id: 4\ndata: a\ndata:b\r\n\r\n");
        assert_eq!(events, vec!["a\nb".to_string()]);
    }

    #[test]
    fn test_comments_and_empty_dispatch_ignored() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b": keepalive\n\n\n").is_empty());
    }

    #[test]
    fn test_partial_line_waits() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: hel").is_empty());
        assert_eq!(decoder.push(b"lo\n\n"), vec!["hello".to_string()]);
    }

    #[test]
    fn test_source_url_from_config() {
        let source = SseEventSource::new(&ClientConfig::default()).unwrap();
        assert_eq!(source.url(), "http://localhost:8080/redfish/v1/EventService/SSE");
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_events(
            payloads in prop::collection::vec("[ -~]{0,40}", 1..6),
            cut in prop::collection::vec(1usize..16, 1..20),
        ) {
            let wire: String = payloads.iter().map(|p| format!("data: {}\n\n", p)).collect();
            let bytes = wire.as_bytes();

            let mut whole = SseDecoder::new();
            let expected = whole.push(bytes);

            let mut chunked = SseDecoder::new();
            let mut actual = Vec::new();
            let mut offset = 0;
            let mut sizes = cut.iter().cycle();
            while offset < bytes.len() {
                let size = *sizes.next().unwrap();
                let end = (offset + size).min(bytes.len());
                actual.extend(chunked.push(&bytes[offset..end]));
                offset = end;
            }
            prop_assert_eq!(actual, expected);
        }
    }
}
