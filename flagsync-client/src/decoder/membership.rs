//! Compact membership payloads
//!
//! Pure functions over byte buffers: decompression, bounded bitmaps and key
//! lists. Nothing here touches storage or the network.

use std::collections::{BTreeSet, HashSet};
use std::io::Read;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::Deserialize;

use crate::hash::{hash64, murmur3_32};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zlib,
}

impl TryFrom<u8> for Compression {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Zlib),
            other => Err(format!("unknown compression {other}")),
        }
    }
}

/// Base64-decode then decompress a payload field
pub fn decode_payload(data: &str, compression: Compression) -> Result<Vec<u8>, String> {
    let raw = STANDARD
        .decode(data.trim())
        .map_err(|e| format!("invalid base64: {e}"))?;

    let mut out = Vec::new();
    match compression {
        Compression::None => return Ok(raw),
        Compression::Gzip => GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| format!("gzip: {e}"))?,
        Compression::Zlib => ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| format!("zlib: {e}"))?,
    };
    Ok(out)
}

/// Bit `hash mod (len * 8)` of `bitmap`, least significant bit first
pub fn is_in_bitmap(bitmap: &[u8], hash: u32) -> bool {
    if bitmap.is_empty() {
        return false;
    }
    let bits = bitmap.len() as u64 * 8;
    let index = (hash as u64 % bits) as usize;
    bitmap[index / 8] & (1 << (index % 8)) != 0
}

/// Whether a bounded update marks `key` as affected
pub fn bounded_affects_key(bitmap: &[u8], key: &str, seed: u32) -> bool {
    is_in_bitmap(bitmap, murmur3_32(key.as_bytes(), seed))
}

/// Added and removed key hashes of a key-list update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyList {
    pub added: HashSet<u64>,
    pub removed: HashSet<u64>,
}

#[derive(Deserialize)]
struct RawKeyList {
    #[serde(default)]
    a: Vec<serde_json::Value>,
    #[serde(default)]
    r: Vec<serde_json::Value>,
}

fn parse_hash(value: &serde_json::Value) -> Result<u64, String> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| format!("key hash {n} is not an unsigned 64-bit integer")),
        serde_json::Value::String(s) => s
            .parse()
            .map_err(|_| format!("key hash {s:?} is not an unsigned 64-bit integer")),
        other => Err(format!("unexpected key hash {other}")),
    }
}

impl KeyList {
    /// Parse the decompressed `{"a": [...], "r": [...]}` document.
    /// Hashes may be JSON numbers or decimal strings.
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        let raw: RawKeyList =
            serde_json::from_slice(bytes).map_err(|e| format!("key list: {e}"))?;
        Ok(Self {
            added: raw.a.iter().map(parse_hash).collect::<Result<_, _>>()?,
            removed: raw.r.iter().map(parse_hash).collect::<Result<_, _>>()?,
        })
    }

    /// `Some(true)` if the key joins, `Some(false)` if it leaves, `None` if untouched
    pub fn change_for(&self, key: &str) -> Option<bool> {
        let hash = hash64(key);
        if self.added.contains(&hash) {
            Some(true)
        } else if self.removed.contains(&hash) {
            Some(false)
        } else {
            None
        }
    }
}

/// Keys a membership update is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipTarget {
    /// Every tracked key sharing this channel hash
    KeyHash(String),
    AllKeys,
}

/// Membership change carried by a notification, already decompressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipDelta {
    /// Fetch the full membership of every targeted key
    Unbounded,
    /// Inline full segment list replacing the key's membership
    Replace(BTreeSet<String>),
    /// Fetch only the targeted keys whose bit is set
    Bounded { bitmap: Vec<u8>, seed: u32 },
    KeyList { segment: String, keys: KeyList },
    SegmentRemoval { segment: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipUpdate {
    pub change_number: i64,
    pub target: MembershipTarget,
    pub delta: MembershipDelta,
}

/// Storage-level effect of a membership update on one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipAction {
    Fetch { key: String },
    Replace {
        key: String,
        segments: BTreeSet<String>,
    },
    Set {
        key: String,
        segment: String,
        member: bool,
    },
}

impl MembershipUpdate {
    /// Resolve the update against the keys it targets.
    ///
    /// `keys` must already be filtered by [`MembershipTarget`].
    pub fn plan(&self, keys: &[String]) -> Vec<MembershipAction> {
        match &self.delta {
            MembershipDelta::Unbounded => keys
                .iter()
                .map(|key| MembershipAction::Fetch { key: key.clone() })
                .collect(),
            MembershipDelta::Replace(segments) => keys
                .iter()
                .map(|key| MembershipAction::Replace {
                    key: key.clone(),
                    segments: segments.clone(),
                })
                .collect(),
            MembershipDelta::Bounded { bitmap, seed } => keys
                .iter()
                .filter(|key| bounded_affects_key(bitmap, key, *seed))
                .map(|key| MembershipAction::Fetch { key: key.clone() })
                .collect(),
            MembershipDelta::KeyList { segment, keys: list } => keys
                .iter()
                .filter_map(|key| {
                    list.change_for(key).map(|member| MembershipAction::Set {
                        key: key.clone(),
                        segment: segment.clone(),
                        member,
                    })
                })
                .collect(),
            MembershipDelta::SegmentRemoval { segment } => keys
                .iter()
                .map(|key| MembershipAction::Set {
                    key: key.clone(),
                    segment: segment.clone(),
                    member: false,
                })
                .collect(),
        }
    }
}
