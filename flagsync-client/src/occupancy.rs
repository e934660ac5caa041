//! Publisher occupancy per control channel
//!
//! Pure state. The push state machine consults it; it never triggers
//! transitions itself.

use std::collections::HashMap;

use crate::decoder::ControlChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    publishers: u32,
    timestamp: i64,
}

#[derive(Debug, Default, Clone)]
pub struct OccupancyTracker {
    samples: HashMap<ControlChannel, Sample>,
}

impl OccupancyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample. Samples older than the last one seen for the same
    /// channel are ignored. Returns whether the stored count changed.
    pub fn observe(&mut self, channel: ControlChannel, publishers: u32, timestamp: i64) -> bool {
        match self.samples.get(&channel) {
            Some(last) if timestamp < last.timestamp => false,
            Some(last) => {
                let changed = last.publishers != publishers;
                self.samples.insert(
                    channel,
                    Sample {
                        publishers,
                        timestamp,
                    },
                );
                changed
            }
            None => {
                self.samples.insert(
                    channel,
                    Sample {
                        publishers,
                        timestamp,
                    },
                );
                true
            }
        }
    }

    /// Last known count; `None` until a sample arrives
    pub fn publishers(&self, channel: ControlChannel) -> Option<u32> {
        self.samples.get(&channel).map(|s| s.publishers)
    }

    /// A channel without samples counts as present
    pub fn is_publisher_present(&self, channel: ControlChannel) -> bool {
        self.publishers(channel).is_none_or(|n| n > 0)
    }

    pub fn is_any_publisher_present(&self) -> bool {
        self.is_publisher_present(ControlChannel::Primary)
            || self.is_publisher_present(ControlChannel::Secondary)
    }

    /// Forget all samples (new connection)
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
