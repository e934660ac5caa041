//! Push orchestration
//!
//! [`state::PushMachine`] decides, [`manager::PushManager`] executes.

pub mod manager;
pub mod state;

pub use manager::{PushCommand, PushHandle, PushManager};
pub use state::{PushAction, PushInput, PushMachine, PushState};
