//! Server-sent events over reqwest
//!
//! The response body is split into lines with `LinesCodec`, then folded into
//! SSE frames by [`SseParser`].

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use shared::stream::StreamErrorEvent;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use super::{EventStream, SseFrame, StreamTransport};
use crate::error::ConnectionError;

/// Upper bound for a single SSE line
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Incremental SSE frame assembler
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without terminator). Returns a frame when the line
    /// completes one.
    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            return Some(SseFrame::Event {
                event: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }
        if line.starts_with(':') {
            return Some(SseFrame::KeepAlive);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id / retry are not used
            _ => {}
        }
        None
    }
}

/// Map an SSE `error` event body to a connection error
pub fn error_from_event(data: &str) -> ConnectionError {
    match serde_json::from_str::<StreamErrorEvent>(data) {
        Ok(StreamErrorEvent {
            code: Some(code),
            message,
            ..
        }) => ConnectionError::Rejected {
            code,
            message: message.unwrap_or_default(),
        },
        Ok(StreamErrorEvent { message, .. }) => {
            ConnectionError::Transport(message.unwrap_or_else(|| data.to_string()))
        }
        Err(_) => ConnectionError::Transport(data.to_string()),
    }
}

/// Error body of a rejected stream handshake, `{"error": {...}}` or bare
fn error_from_handshake(status: u16, body: &str) -> ConnectionError {
    let parsed = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .map(|v| v.get("error").cloned().unwrap_or(v))
        .and_then(|v| serde_json::from_value::<StreamErrorEvent>(v).ok());

    match parsed {
        Some(StreamErrorEvent {
            code: Some(code),
            message,
            ..
        }) => ConnectionError::Rejected {
            code,
            message: message.unwrap_or_default(),
        },
        _ if (400..500).contains(&status) => ConnectionError::Rejected {
            code: status as i64 * 100,
            message: body.to_string(),
        },
        _ => ConnectionError::Transport(format!("stream handshake returned HTTP {status}")),
    }
}

#[derive(Debug, Clone)]
pub struct HttpSseTransport {
    client: Client,
}

impl HttpSseTransport {
    /// `client` should not carry a total request timeout; the stream body
    /// stays open for the lifetime of the session.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamTransport for HttpSseTransport {
    async fn connect(&self, url: &str) -> Result<EventStream, ConnectionError> {
        let resp = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(error_from_handshake(status.as_u16(), &body));
        }

        let reader = StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other));
        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let frames = futures::stream::unfold(
            (lines, SseParser::new()),
            |(mut lines, mut parser)| async move {
                loop {
                    match lines.next().await {
                        None => return None,
                        Some(Err(e)) => {
                            let err = ConnectionError::Transport(e.to_string());
                            return Some((Err(err), (lines, parser)));
                        }
                        Some(Ok(line)) => {
                            if let Some(frame) = parser.push_line(&line) {
                                return Some((Ok(frame), (lines, parser)));
                            }
                        }
                    }
                }
            },
        );
        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut SseParser, text: &str) -> Vec<SseFrame> {
        text.lines().filter_map(|l| parser.push_line(l)).collect()
    }

    #[test]
    fn test_parser_assembles_frames() {
        let mut parser = SseParser::new();
        let frames = feed(
            &mut parser,
            "id: 1\nevent: message\ndata: {\"a\":1}\n\n:keepalive\ndata: x\ndata: y\n\n",
        );
        assert_eq!(
            frames,
            vec![
                SseFrame::Event {
                    event: "message".into(),
                    data: "{\"a\":1}".into()
                },
                SseFrame::KeepAlive,
                SseFrame::Event {
                    event: "message".into(),
                    data: "x\ny".into()
                },
            ]
        );
    }

    #[test]
    fn test_parser_ignores_blank_runs() {
        let mut parser = SseParser::new();
        assert!(feed(&mut parser, "\n\nevent: error\n\n").is_empty());
        // the dangling event name does not leak into the next frame
        let frames = feed(&mut parser, "data: z\n\n");
        assert_eq!(
            frames,
            vec![SseFrame::Event {
                event: "message".into(),
                data: "z".into()
            }]
        );
    }

    #[test]
    fn test_error_event_mapping() {
        let err = error_from_event(r#"{"message":"Token expired","code":40142,"statusCode":401}"#);
        assert!(err.is_token_expired());

        let err = error_from_event("not json");
        assert!(matches!(err, ConnectionError::Transport(_)));

        let err = error_from_handshake(
            401,
            r#"{"error":{"message":"Token expired","code":40142,"statusCode":401}}"#,
        );
        assert!(err.is_token_expired());

        let err = error_from_handshake(403, "forbidden");
        assert!(!err.is_retryable());

        let err = error_from_handshake(503, "");
        assert!(err.is_retryable());
    }
}
