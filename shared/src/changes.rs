//! Catch-up fetch payloads
//!
//! Flag and segment endpoints page through changes with `since`/`till`;
//! a page where `since == till` means there is nothing left to fetch.
//! Membership responses are always a full replace.

use serde::{Deserialize, Serialize};

use crate::flag::FlagDefinition;

/// Response of `GET /splitChanges?since=N`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagChanges {
    #[serde(default)]
    pub splits: Vec<FlagDefinition>,
    pub since: i64,
    pub till: i64,
}

impl FlagChanges {
    pub fn is_converged(&self) -> bool {
        self.since == self.till
    }
}

/// Response of `GET /segmentChanges/{name}?since=N`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChanges {
    pub name: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub since: i64,
    pub till: i64,
}

impl SegmentChanges {
    pub fn is_converged(&self) -> bool {
        self.since == self.till
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub name: String,
}

/// Response of `GET /mySegments/{key}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MembershipResponse {
    #[serde(rename = "mySegments", default)]
    pub segments: Vec<SegmentRef>,
    /// Change number of the membership snapshot, when the server reports one
    #[serde(rename = "changeNumber", default, skip_serializing_if = "Option::is_none")]
    pub change_number: Option<i64>,
}

impl MembershipResponse {
    pub fn from_names<I, S>(names: I, change_number: Option<i64>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: names
                .into_iter()
                .map(|name| SegmentRef { name: name.into() })
                .collect(),
            change_number,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.name.clone()).collect()
    }
}
