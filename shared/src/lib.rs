//! Shared wire types for the flag synchronization runtime
//!
//! DTOs exchanged with the control plane: auth responses, catch-up fetch
//! payloads, flag definitions and push stream messages. Used by both the
//! sync client and the mock control plane.

pub mod auth;
pub mod changes;
pub mod flag;
pub mod stream;
pub mod util;

// Re-exports
pub use serde::{Deserialize, Serialize};

pub use auth::{AuthResponse, TokenClaims};
pub use changes::{FlagChanges, MembershipResponse, SegmentChanges, SegmentRef};
pub use flag::FlagDefinition;
pub use stream::{ControlType, NotificationPayload, StreamMessage};
