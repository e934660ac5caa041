//! In-process collaborators for tests and demos
//!
//! Scripted auth, fetch and stream transports that never touch the network.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use shared::{
    AuthResponse, FlagChanges, FlagDefinition, MembershipResponse, NotificationPayload,
    SegmentChanges, StreamMessage, TokenClaims,
};
use tokio::sync::mpsc;

use crate::auth::{AuthClient, AuthToken};
use crate::error::{AuthError, ConnectionError, FetchError};
use crate::fetcher::{ChangesFetcher, FetchOptions};
use crate::stream::{EventStream, SseFrame, StreamTransport};

/// HS256 key of tokens minted by [`token_for`]
pub const MOCK_TOKEN_SECRET: &[u8] = b"flagsync-test-secret";

/// Token granting `channels`, valid for `lifetime_secs` from now
pub fn token_for(channels: &[&str], lifetime_secs: i64) -> AuthToken {
    let capability: serde_json::Map<String, serde_json::Value> = channels
        .iter()
        .map(|c| (c.to_string(), serde_json::json!(["subscribe"])))
        .collect();
    let iat = shared::util::now_secs();
    let claims = TokenClaims {
        capability: serde_json::Value::Object(capability).to_string(),
        iat,
        exp: iat + lifetime_secs,
    };
    AuthToken {
        token: claims.sign(MOCK_TOKEN_SECRET).unwrap_or_default(),
        channels: channels.iter().map(|c| c.to_string()).collect(),
        issued_at: iat,
        expires_at: iat + lifetime_secs,
        conn_delay: Duration::ZERO,
    }
}

/// Same as [`token_for`] but as the auth endpoint would return it
pub fn auth_response_for(channels: &[&str], lifetime_secs: i64) -> AuthResponse {
    AuthResponse {
        push_enabled: true,
        token: token_for(channels, lifetime_secs).token,
        conn_delay: None,
    }
}

// ========== Auth ==========

#[derive(Debug, Default)]
struct AuthState {
    scripted: VecDeque<Result<AuthToken, AuthError>>,
    fallback: Option<Result<AuthToken, AuthError>>,
    calls: Vec<Vec<String>>,
}

/// Auth client answering from a script, then from a fixed fallback
#[derive(Debug, Default)]
pub struct MockAuthClient {
    state: Mutex<AuthState>,
    delay: Mutex<Duration>,
}

impl MockAuthClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call without a scripted result with `token`
    pub fn always(token: AuthToken) -> Self {
        let client = Self::new();
        client.state.lock().fallback = Some(Ok(token));
        client
    }

    pub fn always_fail(error: AuthError) -> Self {
        let client = Self::new();
        client.state.lock().fallback = Some(Err(error));
        client
    }

    /// Hold every answer back by `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn push_result(&self, result: Result<AuthToken, AuthError>) {
        self.state.lock().scripted.push_back(result);
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Keys sent with each call
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl AuthClient for MockAuthClient {
    async fn authenticate(&self, keys: &[String]) -> Result<AuthToken, AuthError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.calls.push(keys.to_vec());
        if let Some(result) = state.scripted.pop_front() {
            return result;
        }
        state
            .fallback
            .clone()
            .unwrap_or_else(|| Err(AuthError::Network("no scripted auth result".into())))
    }
}

// ========== Fetcher ==========

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRecord {
    Flags {
        since: i64,
        no_cache: bool,
        till: Option<i64>,
    },
    Segment {
        name: String,
        since: i64,
        no_cache: bool,
    },
    Memberships {
        key: String,
        no_cache: bool,
    },
}

#[derive(Debug, Default)]
struct FetcherState {
    flag_pages: HashMap<i64, FlagChanges>,
    segment_pages: HashMap<(String, i64), SegmentChanges>,
    memberships: HashMap<String, MembershipResponse>,
    flag_failures: VecDeque<FetchError>,
    /// One-shot failures for a specific `since`
    flag_failures_at: HashMap<i64, FetchError>,
    membership_failures: VecDeque<FetchError>,
    records: Vec<FetchRecord>,
}

/// Fetcher serving scripted pages keyed by `since`.
///
/// Unknown `since` values answer with an empty converged page.
#[derive(Debug, Default)]
pub struct MockFetcher {
    state: Mutex<FetcherState>,
    delay: Mutex<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response, to hold rounds in flight
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn add_flag_page(&self, since: i64, till: i64, splits: Vec<FlagDefinition>) {
        self.state
            .lock()
            .flag_pages
            .insert(since, FlagChanges { splits, since, till });
    }

    pub fn add_segment_page(
        &self,
        name: &str,
        since: i64,
        till: i64,
        added: &[&str],
        removed: &[&str],
    ) {
        self.state.lock().segment_pages.insert(
            (name.to_string(), since),
            SegmentChanges {
                name: name.to_string(),
                added: added.iter().map(|s| s.to_string()).collect(),
                removed: removed.iter().map(|s| s.to_string()).collect(),
                since,
                till,
            },
        );
    }

    pub fn set_memberships(&self, key: &str, segments: &[&str], change_number: Option<i64>) {
        self.state.lock().memberships.insert(
            key.to_string(),
            MembershipResponse::from_names(segments.iter().copied(), change_number),
        );
    }

    pub fn fail_next_flags(&self, error: FetchError) {
        self.state.lock().flag_failures.push_back(error);
    }

    /// Fail the next flag request whose `since` is `since`
    pub fn fail_flags_at(&self, since: i64, error: FetchError) {
        self.state.lock().flag_failures_at.insert(since, error);
    }

    pub fn fail_next_memberships(&self, error: FetchError) {
        self.state.lock().membership_failures.push_back(error);
    }

    pub fn records(&self) -> Vec<FetchRecord> {
        self.state.lock().records.clone()
    }

    pub fn flag_fetches(&self) -> Vec<FetchRecord> {
        self.records()
            .into_iter()
            .filter(|r| matches!(r, FetchRecord::Flags { .. }))
            .collect()
    }

    pub fn membership_fetches(&self, key: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| matches!(r, FetchRecord::Memberships { key: k, .. } if k == key))
            .count()
    }

    pub fn clear_records(&self) {
        self.state.lock().records.clear();
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ChangesFetcher for MockFetcher {
    async fn fetch_flag_changes(
        &self,
        since: i64,
        options: FetchOptions,
    ) -> Result<FlagChanges, FetchError> {
        let result = {
            let mut state = self.state.lock();
            state.records.push(FetchRecord::Flags {
                since,
                no_cache: options.no_cache,
                till: options.till,
            });
            let failure = match state.flag_failures.pop_front() {
                Some(e) => Some(e),
                None => state.flag_failures_at.remove(&since),
            };
            match failure {
                Some(e) => Err(e),
                None => Ok(state
                    .flag_pages
                    .get(&since)
                    .cloned()
                    .unwrap_or(FlagChanges {
                        splits: Vec::new(),
                        since,
                        till: since,
                    })),
            }
        };
        self.pause().await;
        result
    }

    async fn fetch_segment_changes(
        &self,
        name: &str,
        since: i64,
        options: FetchOptions,
    ) -> Result<SegmentChanges, FetchError> {
        let page = {
            let mut state = self.state.lock();
            state.records.push(FetchRecord::Segment {
                name: name.to_string(),
                since,
                no_cache: options.no_cache,
            });
            state
                .segment_pages
                .get(&(name.to_string(), since))
                .cloned()
                .unwrap_or(SegmentChanges {
                    name: name.to_string(),
                    added: Vec::new(),
                    removed: Vec::new(),
                    since,
                    till: since,
                })
        };
        self.pause().await;
        Ok(page)
    }

    async fn fetch_memberships(
        &self,
        key: &str,
        options: FetchOptions,
    ) -> Result<MembershipResponse, FetchError> {
        let result = {
            let mut state = self.state.lock();
            state.records.push(FetchRecord::Memberships {
                key: key.to_string(),
                no_cache: options.no_cache,
            });
            match state.membership_failures.pop_front() {
                Some(e) => Err(e),
                None => Ok(state.memberships.get(key).cloned().unwrap_or_default()),
            }
        };
        self.pause().await;
        result
    }
}

// ========== Stream transport ==========

type FrameSender = mpsc::UnboundedSender<Result<SseFrame, ConnectionError>>;
type FrameReceiver = mpsc::UnboundedReceiver<Result<SseFrame, ConnectionError>>;

#[derive(Debug, Default)]
struct TransportState {
    scripted: VecDeque<Result<FrameReceiver, ConnectionError>>,
    urls: Vec<String>,
}

/// Transport whose connections are scripted in order.
///
/// Connecting with nothing scripted fails with a transport error.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next connection to succeed; the returned handle feeds it
    pub fn push_session(&self) -> MockSession {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().scripted.push_back(Ok(rx));
        MockSession { tx }
    }

    /// Script the next connection to fail
    pub fn push_failure(&self, error: ConnectionError) {
        self.state.lock().scripted.push_back(Err(error));
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().urls.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.lock().urls.clone()
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn connect(&self, url: &str) -> Result<EventStream, ConnectionError> {
        let mut state = self.state.lock();
        state.urls.push(url.to_string());
        let rx = match state.scripted.pop_front() {
            Some(result) => result?,
            None => return Err(ConnectionError::Transport("no scripted session".into())),
        };
        let frames = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(frames.boxed())
    }
}

/// Server side of a scripted stream session. Dropping it ends the stream.
#[derive(Debug, Clone)]
pub struct MockSession {
    tx: FrameSender,
}

impl MockSession {
    pub fn send_raw(&self, data: &str) {
        let _ = self.tx.send(Ok(SseFrame::Event {
            event: "message".into(),
            data: data.to_string(),
        }));
    }

    pub fn send_message(&self, message: &StreamMessage) {
        if let Ok(data) = serde_json::to_string(message) {
            self.send_raw(&data);
        }
    }

    pub fn send_notification(&self, channel: &str, payload: &NotificationPayload, timestamp: i64) {
        if let Ok(message) = StreamMessage::notification(channel, payload, timestamp) {
            self.send_message(&message);
        }
    }

    pub fn send_occupancy(&self, channel: &str, publishers: u32, timestamp: i64) {
        self.send_message(&StreamMessage::occupancy(
            format!("{}{channel}", shared::stream::OCCUPANCY_CHANNEL_PREFIX),
            publishers,
            timestamp,
        ));
    }

    /// Push-provider `error` event
    pub fn send_error_event(&self, code: i64, message: &str) {
        let _ = self.tx.send(Ok(SseFrame::Event {
            event: "error".into(),
            data: serde_json::json!({ "code": code, "message": message }).to_string(),
        }));
    }

    pub fn keep_alive(&self) {
        let _ = self.tx.send(Ok(SseFrame::KeepAlive));
    }

    pub fn fail(&self, error: ConnectionError) {
        let _ = self.tx.send(Err(error));
    }
}
