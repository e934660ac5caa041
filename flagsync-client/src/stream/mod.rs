//! Stream connection
//!
//! One push session at a time. Events are delivered on a single-consumer
//! channel tagged with the session generation; the consumer drops anything
//! whose generation is not the current one, so nothing from a closed session
//! is observed after [`StreamConnection::close`] returns.

pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthToken;
use crate::error::ConnectionError;

pub use sse::{HttpSseTransport, SseParser};

/// One unit read off the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Event { event: String, data: String },
    /// Comment line; only resets the read timeout
    KeepAlive,
}

pub type EventStream = BoxStream<'static, Result<SseFrame, ConnectionError>>;

#[async_trait]
pub trait StreamTransport: Send + Sync + std::fmt::Debug {
    async fn connect(&self, url: &str) -> Result<EventStream, ConnectionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    ClosedWithError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened,
    /// Raw `data` of a `message` event
    Message(String),
    Error(ConnectionError),
    /// Server ended the stream without an error
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: StreamEvent,
}

/// `{streaming_url}/sse?channels=..&accessToken=..&v=1.1&heartbeats=true`
pub fn build_stream_url(streaming_url: &str, token: &AuthToken) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(&format!("{}/sse", streaming_url.trim_end_matches('/')))
        .map_err(|e| ConnectionError::Transport(format!("invalid streaming url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("channels", &token.stream_channels().join(","))
        .append_pair("accessToken", &token.token)
        .append_pair("v", "1.1")
        .append_pair("heartbeats", "true");
    Ok(url)
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct StreamConnection {
    transport: Arc<dyn StreamTransport>,
    events: mpsc::Sender<SessionEvent>,
    state: Arc<Mutex<ConnectionState>>,
    session: Option<Session>,
    generation: u64,
    read_timeout: Duration,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("state", &self.state())
            .field("generation", &self.generation)
            .finish()
    }
}

impl StreamConnection {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        events: mpsc::Sender<SessionEvent>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            events,
            state: Arc::new(Mutex::new(ConnectionState::Closed)),
            session: None,
            generation: 0,
            read_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Generation of the current session; events from other generations are stale
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Open a new session, closing the current one first
    pub fn open(&mut self, url: Url) -> u64 {
        self.close();
        self.generation += 1;
        let generation = self.generation;
        *self.state.lock() = ConnectionState::Connecting;

        let cancel = CancellationToken::new();
        let session = SessionTask {
            transport: Arc::clone(&self.transport),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            cancel: cancel.clone(),
            generation,
            read_timeout: self.read_timeout,
        };
        tracing::debug!(generation, "Opening push stream");
        let handle = tokio::spawn(session.run(url));
        self.session = Some(Session { cancel, handle });
        generation
    }

    /// Idempotent. Moves to `Closed`; later events of the old session are stale.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            session.handle.abort();
            self.generation += 1;
            tracing::debug!("Push stream closed");
        }
        *self.state.lock() = ConnectionState::Closed;
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionTask {
    transport: Arc<dyn StreamTransport>,
    events: mpsc::Sender<SessionEvent>,
    state: Arc<Mutex<ConnectionState>>,
    cancel: CancellationToken,
    generation: u64,
    read_timeout: Duration,
}

impl SessionTask {
    async fn emit(&self, event: StreamEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.events
            .send(SessionEvent {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }

    fn set_state(&self, state: ConnectionState) {
        if !self.cancel.is_cancelled() {
            *self.state.lock() = state;
        }
    }

    async fn fail(&self, error: ConnectionError) {
        self.set_state(ConnectionState::ClosedWithError);
        self.emit(StreamEvent::Error(error)).await;
    }

    async fn run(self, url: Url) {
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.transport.connect(url.as_str()) => result,
        };
        let mut frames = match connected {
            Ok(frames) => frames,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };

        self.set_state(ConnectionState::Open);
        if !self.emit(StreamEvent::Opened).await {
            return;
        }

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = tokio::time::timeout(self.read_timeout, frames.next()) => next,
            };
            match next {
                Err(_) => {
                    self.fail(ConnectionError::Timeout(self.read_timeout)).await;
                    return;
                }
                Ok(None) => {
                    self.set_state(ConnectionState::Closed);
                    self.emit(StreamEvent::Closed).await;
                    return;
                }
                Ok(Some(Err(e))) => {
                    self.fail(e).await;
                    return;
                }
                Ok(Some(Ok(SseFrame::KeepAlive))) => {}
                Ok(Some(Ok(SseFrame::Event { event, data }))) => {
                    if event == "error" {
                        self.fail(sse::error_from_event(&data)).await;
                        return;
                    }
                    if data.is_empty() {
                        continue;
                    }
                    if !self.emit(StreamEvent::Message(data)).await {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use shared::TokenClaims;

    fn token() -> AuthToken {
        let claims = TokenClaims {
            capability: r#"{"a_b_splits":["subscribe"],"control_pri":["subscribe"]}"#.into(),
            iat: 0,
            exp: 3600,
        };
        AuthToken::from_response(shared::AuthResponse {
            push_enabled: true,
            token: claims.sign(b"test-secret").unwrap(),
            conn_delay: None,
        })
        .unwrap()
    }

    #[test]
    fn test_build_stream_url() {
        let url = build_stream_url("https://streaming.example.com/", &token()).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/sse");
        assert_eq!(
            pairs[0],
            (
                "channels".to_string(),
                "a_b_splits,[?occupancy=metrics.publishers]control_pri".to_string()
            )
        );
        assert_eq!(pairs[2], ("v".to_string(), "1.1".to_string()));
        assert_eq!(pairs[3], ("heartbeats".to_string(), "true".to_string()));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let transport = Arc::new(MockTransport::new());
        let session = transport.push_session();
        let (tx, mut rx) = mpsc::channel(16);
        let mut conn = StreamConnection::new(transport.clone(), tx, Duration::from_secs(5));

        let url = build_stream_url("http://localhost", &token()).unwrap();
        let generation = conn.open(url);

        let opened = rx.recv().await.unwrap();
        assert_eq!(opened.generation, generation);
        assert_eq!(opened.event, StreamEvent::Opened);
        assert_eq!(conn.state(), ConnectionState::Open);

        session.send_raw("{\"hello\":1}");
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, StreamEvent::Message("{\"hello\":1}".into()));

        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_ne!(conn.generation(), generation);
    }

    #[tokio::test]
    async fn test_connect_failure_and_read_timeout() {
        let transport = Arc::new(MockTransport::new());
        transport.push_failure(ConnectionError::Transport("refused".into()));
        let _silent = transport.push_session();
        let (tx, mut rx) = mpsc::channel(16);
        let mut conn = StreamConnection::new(transport.clone(), tx, Duration::from_millis(50));

        conn.open(build_stream_url("http://localhost", &token()).unwrap());
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev.event, StreamEvent::Error(ConnectionError::Transport(_))));
        assert_eq!(conn.state(), ConnectionState::ClosedWithError);

        conn.open(build_stream_url("http://localhost", &token()).unwrap());
        assert_eq!(rx.recv().await.unwrap().event, StreamEvent::Opened);
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev.event, StreamEvent::Error(ConnectionError::Timeout(_))));
        assert_eq!(transport.connect_count(), 2);
    }
}
