//! Server-sent-events progress stream.
//!
//! The backend pushes per-reference status updates as a `text/event-stream`
//! body: frames of `data: <json>` lines terminated by a blank line.
//! [`SseDecoder`] turns arbitrary byte chunks into complete data payloads;
//! [`ImagineBackend::progress_stream`] wires it onto a live response body.

use futures::{stream, Stream, StreamExt};

use crate::api::ImagineBackend;
use crate::error::BackendError;

/// Upper bound on the buffered bytes of one unterminated event frame.
/// Status payloads are tiny; anything near this is a broken peer.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// An event frame grew past [`MAX_FRAME_BYTES`] without terminating.
#[derive(Debug, thiserror::Error)]
#[error("Event frame exceeded {MAX_FRAME_BYTES} bytes without terminating")]
pub struct FrameTooLarge;

/// Incremental decoder for `text/event-stream` bodies.
///
/// Feed it raw chunks as they arrive; it yields the `data` payload of each
/// completed event. Chunk boundaries may fall anywhere, including inside a
/// UTF-8 line. Non-`data` fields (`event:`, `id:`, comments) are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk, returning the data payloads of any events it
    /// completed. Multi-line data fields are joined with `\n`.
    ///
    /// Fails with [`FrameTooLarge`] when the pending frame exceeds
    /// [`MAX_FRAME_BYTES`]; the decoder resets and stays usable.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, FrameTooLarge> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let raw: String = self.buffer.drain(..=pos).collect();
            let line = raw.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates the current event.
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }

        let pending = self.buffer.len() + self.data_lines.iter().map(String::len).sum::<usize>();
        if pending > MAX_FRAME_BYTES {
            self.buffer.clear();
            self.data_lines.clear();
            return Err(FrameTooLarge);
        }
        Ok(events)
    }
}

impl ImagineBackend {
    /// Open the push-stream progress channel for one job reference.
    ///
    /// Sends a `GET /v1/inference/{reference}` request and decodes the SSE
    /// body into raw event payload strings. Transport errors surface as
    /// `Err` items; the connection-establishment error (including a non-2xx
    /// status) is returned up front.
    pub async fn progress_stream(
        &self,
        reference: &str,
    ) -> Result<impl Stream<Item = Result<String, BackendError>>, BackendError> {
        let response = self
            .client
            .get(format!("{}/v1/inference/{}", self.api_url, reference))
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;

        let mut decoder = SseDecoder::new();
        Ok(response.bytes_stream().flat_map(move |chunk| {
            let items: Vec<Result<String, BackendError>> = match chunk {
                Ok(bytes) => match decoder.push(&bytes) {
                    Ok(payloads) => payloads.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(BackendError::Protocol(e.to_string()))],
                },
                Err(e) => vec![Err(BackendError::from(e))],
            };
            stream::iter(items)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"status\":\"completed\"}\n\n").unwrap();
        assert_eq!(events, vec!["{\"status\":\"completed\"}"]);
    }

    #[test]
    fn event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"sta").unwrap().is_empty());
        assert!(decoder.push(b"tus\":\"failed\"}\n").unwrap().is_empty());
        let events = decoder.push(b"\n").unwrap();
        assert_eq!(events, vec!["{\"status\":\"failed\"}"]);
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: one\n\ndata: two\n\n").unwrap();
        assert_eq!(events, vec!["one", "two"]);
    }

    #[test]
    fn crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: x\r\n\r\n").unwrap();
        assert_eq!(events, vec!["x"]);
    }

    #[test]
    fn data_without_space_after_colon() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data:tight\n\n").unwrap();
        assert_eq!(events, vec!["tight"]);
    }

    #[test]
    fn multi_line_data_joined() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: a\ndata: b\n\n").unwrap();
        assert_eq!(events, vec!["a\nb"]);
    }

    #[test]
    fn non_data_fields_ignored() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: progress\nid: 1\ndata: payload\n\n").unwrap();
        assert_eq!(events, vec!["payload"]);
    }

    #[test]
    fn blank_lines_without_data_yield_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"\n\n\n").unwrap().is_empty());
    }

    #[test]
    fn unterminated_frame_past_cap_errors() {
        let mut decoder = SseDecoder::new();
        // One endless line: no newline ever arrives.
        assert!(decoder.push(&vec![b'x'; MAX_FRAME_BYTES + 1]).is_err());
        // The decoder resets and keeps decoding afterwards.
        let events = decoder.push(b"data: ok\n\n").unwrap();
        assert_eq!(events, vec!["ok"]);
    }

    #[test]
    fn accumulated_data_lines_count_against_the_cap() {
        let mut decoder = SseDecoder::new();
        let line = format!("data: {}\n", "y".repeat(MAX_FRAME_BYTES / 2 + 1));
        assert!(decoder.push(line.as_bytes()).unwrap().is_empty());
        assert!(decoder.push(line.as_bytes()).is_err());
    }
}
