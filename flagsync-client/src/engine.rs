//! Sync engine facade
//!
//! Wires storage, context, synchronizer and the push worker together and
//! owns their background tasks.
//!
//! ```ignore
//! let engine = SyncEngine::new(SyncConfig::from_env())?;
//! let mut updates = engine.subscribe();
//! engine.start(["alice"])?;
//! while let Ok(event) = updates.recv().await {
//!     tracing::info!(?event, "Dataset changed");
//! }
//! engine.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthClient, HttpAuthClient};
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, UpdateEvent};
use crate::fetcher::{ChangesFetcher, FetchOptions, HttpFetcher};
use crate::push::{PushHandle, PushManager, PushState};
use crate::storage::{InMemoryStorage, Storage};
use crate::stream::{HttpSseTransport, StreamTransport};
use crate::synchronizer::{Synchronizer, TargetedRetry};
use crate::tasks::BackgroundTasks;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct SyncEngine {
    config: SyncConfig,
    ctx: Arc<SyncContext>,
    synchronizer: Arc<Synchronizer>,
    events: EventBus,
    auth: Arc<dyn AuthClient>,
    transport: Arc<dyn StreamTransport>,
    tasks: Mutex<Option<BackgroundTasks>>,
    push: Mutex<Option<PushHandle>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("keys", &self.ctx.identity_keys())
            .field("push_state", &self.push_state())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Engine backed by the HTTP control plane and in-memory storage
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let client = Client::builder().timeout(config.request_timeout).build()?;
        // The stream body stays open, so only the handshake is bounded
        let stream_client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;

        let auth = Arc::new(HttpAuthClient::new(
            client.clone(),
            config.auth_url.clone(),
            config.sdk_key.clone(),
        ));
        let fetcher = Arc::new(HttpFetcher::new(
            client,
            config.sdk_url.clone(),
            config.sdk_key.clone(),
        ));
        let transport = Arc::new(HttpSseTransport::new(stream_client));
        Self::with_components(
            config,
            Arc::new(InMemoryStorage::new()),
            auth,
            fetcher,
            transport,
        )
    }

    /// Engine over caller-provided collaborators
    pub fn with_components(
        config: SyncConfig,
        storage: Arc<dyn Storage>,
        auth: Arc<dyn AuthClient>,
        fetcher: Arc<dyn ChangesFetcher>,
        transport: Arc<dyn StreamTransport>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let ctx = Arc::new(SyncContext::new(storage));
        let events = EventBus::new(config.event_capacity);
        let synchronizer = Synchronizer::new(
            Arc::clone(&ctx),
            fetcher,
            events.clone(),
            TargetedRetry {
                retries: config.targeted_fetch_retries,
                backoff: config.targeted_fetch_backoff.clone(),
            },
        );
        let tasks = BackgroundTasks::new();
        let shutdown = tasks.shutdown_token();

        Ok(Self {
            config,
            ctx,
            synchronizer,
            events,
            auth,
            transport,
            tasks: Mutex::new(Some(tasks)),
            push: Mutex::new(None),
            shutdown,
        })
    }

    /// Track `keys` and start the push worker. Must run inside a tokio runtime.
    pub fn start<I, S>(&self, keys: I) -> SyncResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Terminated);
        }
        let mut push = self.push.lock();
        if push.is_some() {
            return Err(SyncError::AlreadyStarted);
        }
        for key in keys {
            self.ctx.add_identity_key(key.as_ref());
        }
        if !self.ctx.has_identity_keys() {
            return Err(SyncError::Config(
                "at least one identity key is required".into(),
            ));
        }

        let mut tasks = self.tasks.lock();
        let Some(tasks) = tasks.as_mut() else {
            return Err(SyncError::Terminated);
        };
        let (manager, handle) = PushManager::new(
            self.config.clone(),
            Arc::clone(&self.ctx),
            Arc::clone(&self.auth),
            Arc::clone(&self.transport),
            Arc::clone(&self.synchronizer),
            self.shutdown.clone(),
        );
        tasks.spawn("push_manager", manager.run());
        *push = Some(handle);

        tracing::info!(
            keys = self.ctx.identity_keys().len(),
            streaming = self.config.streaming_enabled,
            "Sync engine started"
        );
        Ok(())
    }

    /// Track another identity key. Returns false if it was already tracked.
    pub fn add_identity_key(&self, key: &str) -> bool {
        if !self.ctx.add_identity_key(key) {
            return false;
        }
        tracing::info!(key = %key, "Identity key added");
        if let Some(push) = self.push.lock().as_ref() {
            push.identity_added(key.to_string());
        }
        true
    }

    pub fn identity_keys(&self) -> Vec<String> {
        self.ctx.identity_keys()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    /// Bring every scope up to date now, outside the push worker
    pub async fn full_sync(&self) -> SyncResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Terminated);
        }
        self.synchronizer
            .full_sync(FetchOptions::cached())
            .await
            .map_err(SyncError::from)
    }

    /// `None` before `start`
    pub fn push_state(&self) -> Option<PushState> {
        self.push.lock().as_ref().map(|p| p.state())
    }

    pub fn push_handle(&self) -> Option<PushHandle> {
        self.push.lock().clone()
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(self.ctx.storage())
    }

    /// Idempotent. Stops the worker, the stream and polling.
    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().take();
        self.shutdown.cancel();
        if let Some(tasks) = tasks {
            let aborted = tasks.shutdown(SHUTDOWN_GRACE).await;
            tracing::info!(aborted, "Sync engine stopped");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
