//! Push stream message types
//!
//! Every SSE `message` event carries a [`StreamMessage`] envelope whose `data`
//! field is itself a JSON document. Occupancy samples are recognised by the
//! envelope `name`; everything else is a [`NotificationPayload`] discriminated
//! by its `type` field.

use serde::{Deserialize, Serialize};

/// Envelope `name` of occupancy samples on control channels
pub const OCCUPANCY_EVENT_NAME: &str = "[meta]occupancy";

/// Prefix requesting occupancy metadata for a channel subscription
pub const OCCUPANCY_CHANNEL_PREFIX: &str = "[?occupancy=metrics.publishers]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    pub channel: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl StreamMessage {
    /// Wrap a notification payload for `channel`
    pub fn notification(
        channel: impl Into<String>,
        payload: &NotificationPayload,
        timestamp: i64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: None,
            client_id: None,
            timestamp,
            encoding: Some("json".to_string()),
            channel: channel.into(),
            data: serde_json::to_string(payload)?,
            name: None,
        })
    }

    /// Occupancy sample for a control channel
    pub fn occupancy(channel: impl Into<String>, publishers: u32, timestamp: i64) -> Self {
        let data = OccupancyData {
            metrics: OccupancyMetrics { publishers },
        };
        Self {
            id: None,
            client_id: None,
            timestamp,
            encoding: Some("json".to_string()),
            channel: channel.into(),
            data: serde_json::json!(data).to_string(),
            name: Some(OCCUPANCY_EVENT_NAME.to_string()),
        }
    }

    pub fn is_occupancy(&self) -> bool {
        self.name.as_deref() == Some(OCCUPANCY_EVENT_NAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyMetrics {
    pub publishers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyData {
    pub metrics: OccupancyMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    StreamingPaused,
    StreamingResumed,
    StreamingDisabled,
}

/// Notification body, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum NotificationPayload {
    #[serde(rename = "SPLIT_UPDATE")]
    SplitUpdate { change_number: i64 },

    #[serde(rename = "SPLIT_KILL")]
    SplitKill {
        change_number: i64,
        split_name: String,
        default_treatment: String,
    },

    #[serde(rename = "SEGMENT_UPDATE")]
    SegmentUpdate {
        change_number: i64,
        segment_name: String,
    },

    /// Per-key membership update, sent on the key's own channel
    #[serde(rename = "MY_SEGMENTS_UPDATE")]
    MySegmentsUpdate {
        change_number: i64,
        #[serde(default)]
        includes_payload: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        segment_list: Option<Vec<String>>,
    },

    /// Shared membership update with a compact encoding
    #[serde(rename = "MY_SEGMENTS_UPDATE_V2")]
    MySegmentsUpdateV2 {
        change_number: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        segment_name: Option<String>,
        /// Compression: 0 none, 1 gzip, 2 zlib
        #[serde(default)]
        c: u8,
        /// Base64 encoded, possibly compressed data
        #[serde(default, skip_serializing_if = "Option::is_none")]
        d: Option<String>,
        /// Update strategy: 0 unbounded, 1 bounded, 2 key list, 3 segment removal
        u: u8,
        /// Hash function for bounded updates
        #[serde(default, skip_serializing_if = "Option::is_none")]
        h: Option<u8>,
        /// Hash seed for bounded updates
        #[serde(default, skip_serializing_if = "Option::is_none")]
        s: Option<u32>,
    },

    #[serde(rename = "CONTROL")]
    Control { control_type: ControlType },
}

/// Body of an SSE `error` event raised by the push provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamErrorEvent {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}
