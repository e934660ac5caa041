//! Scriptable control-plane state shared by every handler

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared::{
    FlagChanges, FlagDefinition, MembershipResponse, NotificationPayload, SegmentChanges,
    StreamMessage,
};
use tokio::sync::mpsc;

/// One frame pushed to connected stream clients
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Message(String),
    Error(String),
}

/// Request seen by the mock, for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub no_cache: bool,
}

#[derive(Debug)]
struct Inner {
    sdk_key: String,
    /// HS256 key for issued push tokens
    jwt_secret: String,
    push_enabled: bool,
    channels: Vec<String>,
    token_lifetime_secs: i64,
    conn_delay: Option<u64>,
    /// Provider error returned on the stream handshake
    stream_rejection: Option<(u16, i64, String)>,
    flag_pages: HashMap<i64, FlagChanges>,
    segment_pages: HashMap<(String, i64), SegmentChanges>,
    memberships: HashMap<String, MembershipResponse>,
    subscribers: Vec<mpsc::UnboundedSender<StreamFrame>>,
    requests: Vec<RecordedRequest>,
}

/// Handle to the mock control plane. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    inner: Arc<Mutex<Inner>>,
    heartbeat: Duration,
}

impl ControlPlane {
    pub fn new(sdk_key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sdk_key: sdk_key.into(),
                jwt_secret: "flagsync-mock-secret".into(),
                push_enabled: true,
                channels: vec![
                    "NzM2MDI5Mzc0_MTgyNTg1MTgwNg==_splits".into(),
                    "NzM2MDI5Mzc0_MTgyNTg1MTgwNg==_segments".into(),
                    "NzM2MDI5Mzc0_MTgyNTg1MTgwNg==_mySegments".into(),
                    "control_pri".into(),
                    "control_sec".into(),
                ],
                token_lifetime_secs: 3600,
                conn_delay: None,
                stream_rejection: None,
                flag_pages: HashMap::new(),
                segment_pages: HashMap::new(),
                memberships: HashMap::new(),
                subscribers: Vec::new(),
                requests: Vec::new(),
            })),
            heartbeat: Duration::from_secs(15),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn sdk_key(&self) -> String {
        self.inner.lock().sdk_key.clone()
    }

    pub fn jwt_secret(&self) -> String {
        self.inner.lock().jwt_secret.clone()
    }

    // ========== Auth ==========

    pub fn set_push_enabled(&self, enabled: bool) {
        self.inner.lock().push_enabled = enabled;
    }

    pub fn push_enabled(&self) -> bool {
        self.inner.lock().push_enabled
    }

    /// Channels granted by issued tokens
    pub fn set_channels(&self, channels: &[&str]) {
        self.inner.lock().channels = channels.iter().map(|c| c.to_string()).collect();
    }

    pub fn add_channel(&self, channel: &str) {
        self.inner.lock().channels.push(channel.to_string());
    }

    pub fn channels(&self) -> Vec<String> {
        self.inner.lock().channels.clone()
    }

    pub fn set_conn_delay(&self, secs: Option<u64>) {
        self.inner.lock().conn_delay = secs;
    }

    pub fn conn_delay(&self) -> Option<u64> {
        self.inner.lock().conn_delay
    }

    pub fn token_lifetime_secs(&self) -> i64 {
        self.inner.lock().token_lifetime_secs
    }

    // ========== Fetch data ==========

    pub fn add_flag_page(&self, since: i64, till: i64, splits: Vec<FlagDefinition>) {
        self.inner
            .lock()
            .flag_pages
            .insert(since, FlagChanges { splits, since, till });
    }

    pub fn flag_changes(&self, since: i64) -> FlagChanges {
        self.inner
            .lock()
            .flag_pages
            .get(&since)
            .cloned()
            .unwrap_or(FlagChanges {
                splits: Vec::new(),
                since,
                till: since,
            })
    }

    pub fn add_segment_page(
        &self,
        name: &str,
        since: i64,
        till: i64,
        added: &[&str],
        removed: &[&str],
    ) {
        self.inner.lock().segment_pages.insert(
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

    pub fn segment_changes(&self, name: &str, since: i64) -> SegmentChanges {
        self.inner
            .lock()
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
    }

    pub fn set_memberships(&self, key: &str, segments: &[&str], change_number: Option<i64>) {
        self.inner.lock().memberships.insert(
            key.to_string(),
            MembershipResponse::from_names(segments.iter().copied(), change_number),
        );
    }

    pub fn memberships(&self, key: &str) -> MembershipResponse {
        self.inner
            .lock()
            .memberships
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    // ========== Stream ==========

    /// Make the next stream handshakes fail with an HTTP `status` and provider `code`
    pub fn reject_streams(&self, status: u16, code: i64, message: &str) {
        self.inner.lock().stream_rejection = Some((status, code, message.to_string()));
    }

    pub fn accept_streams(&self) {
        self.inner.lock().stream_rejection = None;
    }

    pub fn stream_rejection(&self) -> Option<(u16, i64, String)> {
        self.inner.lock().stream_rejection.clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| !s.is_closed());
        inner.subscribers.len()
    }

    /// Send a message to every connected stream; returns how many received it
    pub fn publish(&self, message: &StreamMessage) -> usize {
        match serde_json::to_string(message) {
            Ok(data) => self.broadcast(StreamFrame::Message(data)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode stream message");
                0
            }
        }
    }

    pub fn publish_notification(&self, channel: &str, payload: &NotificationPayload) -> usize {
        match StreamMessage::notification(channel, payload, shared::util::now_millis()) {
            Ok(message) => self.publish(&message),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode notification");
                0
            }
        }
    }

    pub fn publish_occupancy(&self, channel: &str, publishers: u32) -> usize {
        self.publish(&StreamMessage::occupancy(
            format!("{}{channel}", shared::stream::OCCUPANCY_CHANNEL_PREFIX),
            publishers,
            shared::util::now_millis(),
        ))
    }

    /// Push-provider `error` event on every connected stream
    pub fn publish_error(&self, code: i64, message: &str) -> usize {
        let data = serde_json::json!({ "code": code, "message": message, "statusCode": code / 100 });
        self.broadcast(StreamFrame::Error(data.to_string()))
    }

    /// Drop every connected stream
    pub fn disconnect_all(&self) {
        self.inner.lock().subscribers.clear();
    }

    fn broadcast(&self, frame: StreamFrame) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| s.send(frame.clone()).is_ok());
        inner.subscribers.len()
    }

    // ========== Request log ==========

    pub fn record(&self, request: RecordedRequest) {
        self.inner.lock().requests.push(request);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn requests_to(&self, prefix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.starts_with(prefix))
            .collect()
    }
}
