//! Flag definitions as served by the flag changes endpoint
//!
//! Rule matching is not interpreted here. Conditions are kept as raw JSON so
//! that storage can hand them to an evaluator unchanged; the only thing the
//! sync runtime reads from them is which segments they reference.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_type_name: Option<String>,
    #[serde(default = "default_change_number")]
    pub change_number: i64,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub killed: bool,
    #[serde(default = "default_treatment")]
    pub default_treatment: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<serde_json::Value>,
}

fn default_change_number() -> i64 {
    -1
}

fn default_status() -> String {
    "ACTIVE".to_string()
}

fn default_treatment() -> String {
    "control".to_string()
}

impl FlagDefinition {
    /// Minimal active definition, mostly for tests and the mock control plane
    pub fn new(name: impl Into<String>, change_number: i64) -> Self {
        Self {
            name: name.into(),
            traffic_type_name: None,
            change_number,
            status: default_status(),
            killed: false,
            default_treatment: default_treatment(),
            conditions: Vec::new(),
        }
    }

    /// Archived definitions are removed from storage instead of stored
    pub fn is_archived(&self) -> bool {
        self.status == "ARCHIVED"
    }

    /// Mark the flag killed so it evaluates to `default_treatment`
    pub fn kill(&mut self, default_treatment: impl Into<String>, change_number: i64) {
        self.killed = true;
        self.default_treatment = default_treatment.into();
        self.change_number = change_number;
    }

    /// Names of segments referenced by `IN_SEGMENT` matchers in any condition
    pub fn segment_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for condition in &self.conditions {
            let Some(matchers) = condition
                .pointer("/matcherGroup/matchers")
                .and_then(|m| m.as_array())
            else {
                continue;
            };
            for matcher in matchers {
                if let Some(name) = matcher
                    .pointer("/userDefinedSegmentMatcherData/segmentName")
                    .and_then(|n| n.as_str())
                {
                    names.insert(name.to_string());
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names_from_conditions() {
        let flag: FlagDefinition = serde_json::from_value(serde_json::json!({
            "name": "new_checkout",
            "changeNumber": 1000,
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": "off",
            "conditions": [
                {
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [
                            {
                                "matcherType": "IN_SEGMENT",
                                "userDefinedSegmentMatcherData": { "segmentName": "employees" }
                            },
                            { "matcherType": "ALL_KEYS" }
                        ]
                    }
                },
                {
                    "matcherGroup": {
                        "matchers": [
                            {
                                "matcherType": "IN_SEGMENT",
                                "userDefinedSegmentMatcherData": { "segmentName": "beta" }
                            }
                        ]
                    }
                }
            ]
        }))
        .unwrap();

        let names: Vec<_> = flag.segment_names().into_iter().collect();
        assert_eq!(names, vec!["beta", "employees"]);
    }

    #[test]
    fn test_kill_and_defaults() {
        let mut flag: FlagDefinition =
            serde_json::from_str(r#"{"name":"f","changeNumber":5}"#).unwrap();
        assert_eq!(flag.default_treatment, "control");
        assert!(!flag.is_archived());
        assert!(flag.segment_names().is_empty());

        flag.kill("off", 6);
        assert!(flag.killed);
        assert_eq!(flag.default_treatment, "off");
        assert_eq!(flag.change_number, 6);
    }
}
