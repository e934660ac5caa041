//! Notification decoder
//!
//! Turns raw stream messages into typed [`Notification`]s. Membership payloads
//! are decompressed here so that a corrupt payload is reported as
//! [`DecodeError::Membership`] with enough routing data for the caller to fall
//! back to a full membership fetch.

pub mod membership;

use shared::stream::{OCCUPANCY_CHANNEL_PREFIX, OccupancyData};
use shared::{ControlType, NotificationPayload, StreamMessage};

use crate::error::DecodeError;
pub use membership::{
    Compression, KeyList, MembershipAction, MembershipDelta, MembershipTarget, MembershipUpdate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlChannel {
    Primary,
    Secondary,
}

impl ControlChannel {
    pub fn from_channel_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix(OCCUPANCY_CHANNEL_PREFIX).unwrap_or(name);
        if name.ends_with("control_pri") {
            Some(Self::Primary)
        } else if name.ends_with("control_sec") {
            Some(Self::Secondary)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    FlagUpdate {
        change_number: i64,
    },
    /// Flag killed upstream; carries what is needed to kill it locally
    FlagRemoved {
        change_number: i64,
        flag_name: String,
        default_treatment: String,
    },
    SegmentUpdate {
        change_number: i64,
        segment_name: String,
    },
    IdentitySegmentUpdate(MembershipUpdate),
    Occupancy {
        channel: ControlChannel,
        publishers: u32,
        timestamp: i64,
    },
    Control {
        control: ControlType,
        timestamp: i64,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FlagUpdate { .. } => "FLAG_UPDATE",
            Self::FlagRemoved { .. } => "FLAG_REMOVED",
            Self::SegmentUpdate { .. } => "SEGMENT_UPDATE",
            Self::IdentitySegmentUpdate(_) => "IDENTITY_SEGMENT_UPDATE",
            Self::Occupancy { .. } => "OCCUPANCY",
            Self::Control { .. } => "CONTROL",
        }
    }
}

/// Per-key membership channels look like `<a>_<b>_<keyHash>_mySegments`;
/// the shared one is `<a>_<b>_mySegments`.
fn membership_key_hash(channel: &str) -> Option<String> {
    let parts: Vec<&str> = channel.split('_').collect();
    if parts.len() >= 4 && parts.last() == Some(&"mySegments") {
        Some(parts[parts.len() - 2].to_string())
    } else {
        None
    }
}

/// Decode a raw SSE `data` line
pub fn decode(raw: &str) -> Result<Notification, DecodeError> {
    let message: StreamMessage = serde_json::from_str(raw)
        .map_err(|e| DecodeError::Malformed(format!("envelope: {e}")))?;
    decode_message(&message)
}

pub fn decode_message(message: &StreamMessage) -> Result<Notification, DecodeError> {
    if message.is_occupancy() {
        let channel = ControlChannel::from_channel_name(&message.channel).ok_or_else(|| {
            DecodeError::Malformed(format!(
                "occupancy on non-control channel {}",
                message.channel
            ))
        })?;
        let data: OccupancyData = serde_json::from_str(&message.data)
            .map_err(|e| DecodeError::Malformed(format!("occupancy: {e}")))?;
        return Ok(Notification::Occupancy {
            channel,
            publishers: data.metrics.publishers,
            timestamp: message.timestamp,
        });
    }

    let payload: NotificationPayload = match serde_json::from_str(&message.data) {
        Ok(payload) => payload,
        Err(e) => {
            // Still route unreadable membership updates so they degrade to a fetch
            if message.channel.ends_with("_mySegments") {
                return Err(DecodeError::Membership {
                    change_number: peek_change_number(&message.data),
                    key_hash: membership_key_hash(&message.channel),
                    reason: e.to_string(),
                });
            }
            return Err(DecodeError::Malformed(format!("payload: {e}")));
        }
    };

    match payload {
        NotificationPayload::SplitUpdate { change_number } => {
            Ok(Notification::FlagUpdate { change_number })
        }
        NotificationPayload::SplitKill {
            change_number,
            split_name,
            default_treatment,
        } => Ok(Notification::FlagRemoved {
            change_number,
            flag_name: split_name,
            default_treatment,
        }),
        NotificationPayload::SegmentUpdate {
            change_number,
            segment_name,
        } => Ok(Notification::SegmentUpdate {
            change_number,
            segment_name,
        }),
        NotificationPayload::MySegmentsUpdate {
            change_number,
            includes_payload,
            segment_list,
        } => {
            let key_hash = membership_key_hash(&message.channel).ok_or_else(|| {
                DecodeError::Membership {
                    change_number,
                    key_hash: None,
                    reason: format!("no key hash in channel {}", message.channel),
                }
            })?;
            let delta = match (includes_payload, segment_list) {
                (true, Some(list)) => MembershipDelta::Replace(list.into_iter().collect()),
                (true, None) => {
                    return Err(DecodeError::Membership {
                        change_number,
                        key_hash: Some(key_hash),
                        reason: "includesPayload without segmentList".into(),
                    });
                }
                (false, _) => MembershipDelta::Unbounded,
            };
            Ok(Notification::IdentitySegmentUpdate(MembershipUpdate {
                change_number,
                target: MembershipTarget::KeyHash(key_hash),
                delta,
            }))
        }
        NotificationPayload::MySegmentsUpdateV2 {
            change_number,
            segment_name,
            c,
            d,
            u,
            h,
            s,
        } => {
            let target = match membership_key_hash(&message.channel) {
                Some(hash) => MembershipTarget::KeyHash(hash),
                None => MembershipTarget::AllKeys,
            };
            let delta = decode_v2_delta(segment_name, c, d.as_deref(), u, h, s).map_err(
                |reason| DecodeError::Membership {
                    change_number,
                    key_hash: match &target {
                        MembershipTarget::KeyHash(hash) => Some(hash.clone()),
                        MembershipTarget::AllKeys => None,
                    },
                    reason,
                },
            )?;
            Ok(Notification::IdentitySegmentUpdate(MembershipUpdate {
                change_number,
                target,
                delta,
            }))
        }
        NotificationPayload::Control { control_type } => Ok(Notification::Control {
            control: control_type,
            timestamp: message.timestamp,
        }),
    }
}

fn decode_v2_delta(
    segment_name: Option<String>,
    compression: u8,
    data: Option<&str>,
    strategy: u8,
    hash_fn: Option<u8>,
    seed: Option<u32>,
) -> Result<MembershipDelta, String> {
    match strategy {
        0 => Ok(MembershipDelta::Unbounded),
        1 => {
            if !matches!(hash_fn, None | Some(0) | Some(1)) {
                return Err(format!("unsupported hash function {hash_fn:?}"));
            }
            let data = data.ok_or("bounded update without data")?;
            let bitmap = membership::decode_payload(data, Compression::try_from(compression)?)?;
            Ok(MembershipDelta::Bounded {
                bitmap,
                seed: seed.unwrap_or(0),
            })
        }
        2 => {
            let segment = segment_name.ok_or("key list update without segment name")?;
            let data = data.ok_or("key list update without data")?;
            let bytes = membership::decode_payload(data, Compression::try_from(compression)?)?;
            Ok(MembershipDelta::KeyList {
                segment,
                keys: KeyList::parse(&bytes)?,
            })
        }
        3 => {
            let segment = segment_name.ok_or("segment removal without segment name")?;
            Ok(MembershipDelta::SegmentRemoval { segment })
        }
        other => Err(format!("unknown update strategy {other}")),
    }
}

fn peek_change_number(data: &str) -> i64 {
    serde_json::from_str::<serde_json::Value>(data)
        .ok()
        .and_then(|v| v.get("changeNumber").and_then(|n| n.as_i64()))
        .unwrap_or(crate::storage::UNSYNCED)
}
