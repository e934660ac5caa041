//! Streaming flag synchronization client
//!
//! Keeps a local copy of flag definitions, segment membership and
//! per-identity-key membership in sync with the control plane. A push stream
//! (server-sent events) drives targeted catch-up fetches; polling takes over
//! while push is unavailable.
//!
//! ```text
//! AuthClient ──► StreamConnection ──► decoder ──► PushMachine
//!                                                   │
//!                      ┌────────────────────────────┼──────────────┐
//!                      ▼                            ▼              ▼
//!              OccupancyTracker              Synchronizer   PollingScheduler
//!                                                   │
//!                                           Storage + EventBus
//! ```

pub mod auth;
pub mod backoff;
pub mod config;
pub mod context;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod hash;
pub mod logger;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod occupancy;
pub mod poller;
pub mod push;
pub mod storage;
pub mod stream;
pub mod synchronizer;
pub mod tasks;

pub use auth::{AuthClient, AuthToken, HttpAuthClient};
pub use backoff::{Backoff, BackoffConfig};
pub use config::{SchedulerConfig, SyncConfig};
pub use context::SyncContext;
pub use decoder::{Notification, decode};
pub use engine::SyncEngine;
pub use error::{AuthError, ConnectionError, DecodeError, FetchError, SyncError, SyncResult};
pub use events::{EventBus, UpdateEvent};
pub use fetcher::{ChangesFetcher, FetchOptions, HttpFetcher};
pub use logger::{init_logger, init_logger_with_file};
pub use push::PushState;
pub use storage::{InMemoryStorage, Storage};
pub use stream::{HttpSseTransport, StreamTransport};
pub use synchronizer::Synchronizer;
