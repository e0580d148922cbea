//! Server-sent events transport for the reasoning stream.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::{Client, header};
use std::collections::VecDeque;
use std::fmt::Display;
use tracing::{debug, info};

use crate::config::ApiConfig;
use crate::error::{DiagnosticError, Result};
use crate::stream::{EventStream, EventTransport};

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a full line is available, so chunk boundaries may
/// fall anywhere, including inside a UTF-8 sequence. Each dispatched event is
/// the `data:` lines of one block joined by `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((end, terminator)) = self.next_line_end() {
            let raw: Vec<u8> = self.buffer.drain(..end + terminator).collect();
            let line = String::from_utf8_lossy(&raw[..end]);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Position and length of the first complete line terminator: `\r\n`,
    /// `\n` or a lone `\r`. A trailing `\r` waits for the next chunk.
    fn next_line_end(&self) -> Option<(usize, usize)> {
        let end = self
            .buffer
            .iter()
            .position(|byte| *byte == b'\n' || *byte == b'\r')?;
        match (self.buffer[end], self.buffer.get(end + 1)) {
            (b'\n', _) => Some((end, 1)),
            (_, Some(b'\n')) => Some((end, 2)),
            (_, Some(_)) => Some((end, 1)),
            (_, None) => None,
        }
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data).join("\n"));
        }

        // comment / keep-alive
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

/// Turn a byte stream into a stream of SSE `data` payloads.
///
/// A transport error is yielded as [`DiagnosticError::Stream`]. The end of the
/// byte stream ends the event stream; a trailing unterminated event is dropped.
pub fn decode_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = (Box::pin(bytes), SseDecoder::new(), VecDeque::new());

    Box::pin(stream::unfold(
        state,
        |(mut bytes, mut decoder, mut pending)| async move {
            loop {
                if let Some(data) = pending.pop_front() {
                    return Some((Ok(data), (bytes, decoder, pending)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.feed(chunk.as_ref())),
                    Some(Err(e)) => {
                        let err = DiagnosticError::Stream(e.to_string());
                        return Some((Err(err), (bytes, decoder, pending)));
                    }
                    None => return None,
                }
            }
        },
    ))
}

/// Opens `GET {base}/reasoning-stream/{session_id}` as an event stream
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: Client,
    config: ApiConfig,
}

impl SseTransport {
    pub fn new(config: ApiConfig) -> Result<Self> {
        // No overall request timeout: it would cut off a healthy long-lived stream.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| DiagnosticError::Stream(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: Client, config: ApiConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl EventTransport for SseTransport {
    async fn open(&self, session_id: &str) -> Result<EventStream> {
        let url = self.config.reasoning_stream_url(session_id);
        debug!(url = %url, "Opening reasoning stream");

        let mut request = self
            .client
            .get(&url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");
        if let Some(value) = self.config.authorization() {
            request = request.header(header::AUTHORIZATION, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiagnosticError::Stream(format!("Connect failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiagnosticError::Stream(format!(
                "Stream endpoint returned {}",
                status
            )));
        }

        info!(session_id = %session_id, "Reasoning stream opened");
        Ok(decode_events(response.bytes_stream()))
    }
}
