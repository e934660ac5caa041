//! Push worker
//!
//! Single task owning the state machine, the stream connection and the
//! polling scheduler. Everything that can change push state arrives through
//! its `select!` loop: stream events, identity commands, auth results and
//! the reconnect / connect-delay / token-refresh deadlines. A cached full
//! sync is started alongside the first auth request, so data does not wait
//! on the stream.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthClient, AuthToken};
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::decoder::{self, MembershipTarget, MembershipUpdate};
use crate::error::{AuthError, ConnectionError};
use crate::fetcher::FetchOptions;
use crate::poller::PollingScheduler;
use crate::stream::{SessionEvent, StreamConnection, StreamEvent, StreamTransport, build_stream_url};
use crate::synchronizer::{Synchronizer, options_for_push};

use super::state::{PushAction, PushInput, PushMachine, PushState};

const STREAM_EVENT_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushCommand {
    /// Key already added to the context
    IdentityAdded(String),
}

/// Caller side of a running [`PushManager`]
#[derive(Debug, Clone)]
pub struct PushHandle {
    commands: mpsc::Sender<PushCommand>,
    state: watch::Receiver<PushState>,
}

impl PushHandle {
    pub fn identity_added(&self, key: String) {
        if let Err(e) = self.commands.try_send(PushCommand::IdentityAdded(key)) {
            tracing::warn!(error = %e, "Push worker not accepting commands");
        }
    }

    pub fn state(&self) -> PushState {
        *self.state.borrow()
    }

    /// Wait until the worker reports `state`
    pub async fn wait_for(&mut self, state: PushState) -> bool {
        self.state.wait_for(|s| *s == state).await.is_ok()
    }
}

enum JobOutput {
    Auth {
        generation: u64,
        result: Result<AuthToken, AuthError>,
    },
    Sync,
}

pub struct PushManager {
    config: SyncConfig,
    machine: PushMachine,
    ctx: Arc<SyncContext>,
    auth: Arc<dyn AuthClient>,
    synchronizer: Arc<Synchronizer>,
    poller: PollingScheduler,
    connection: StreamConnection,
    stream_events: mpsc::Receiver<SessionEvent>,
    commands: mpsc::Receiver<PushCommand>,
    state_tx: watch::Sender<PushState>,
    shutdown: CancellationToken,
    jobs: JoinSet<JobOutput>,
    /// Only the latest auth request's answer is used
    auth_generation: u64,
    opened_at: Option<Instant>,
    /// Token waiting out its `connDelay`
    pending_token: Option<AuthToken>,
    connect_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    refresh_at: Option<Instant>,
}

impl PushManager {
    pub fn new(
        config: SyncConfig,
        ctx: Arc<SyncContext>,
        auth: Arc<dyn AuthClient>,
        transport: Arc<dyn StreamTransport>,
        synchronizer: Arc<Synchronizer>,
        shutdown: CancellationToken,
    ) -> (Self, PushHandle) {
        let (events_tx, stream_events) = mpsc::channel(STREAM_EVENT_BUFFER);
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(PushState::Initializing);

        let manager = Self {
            machine: PushMachine::new(&config),
            poller: PollingScheduler::new(
                Arc::clone(&synchronizer),
                config.scheduler.clone(),
                shutdown.clone(),
            ),
            connection: StreamConnection::new(transport, events_tx, config.read_timeout),
            config,
            ctx,
            auth,
            synchronizer,
            stream_events,
            commands,
            state_tx,
            shutdown,
            jobs: JoinSet::new(),
            auth_generation: 0,
            opened_at: None,
            pending_token: None,
            connect_at: None,
            reconnect_at: None,
            refresh_at: None,
        };
        let handle = PushHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (manager, handle)
    }

    pub async fn run(mut self) {
        tracing::info!(
            streaming = self.config.streaming_enabled,
            "Push manager started"
        );
        self.apply(PushInput::Start);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(PushCommand::IdentityAdded(key)) => {
                        self.apply(PushInput::IdentityAdded { key });
                    }
                    None => break,
                },
                Some(event) = self.stream_events.recv() => self.on_session_event(event),
                Some(joined) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    self.on_job(joined);
                }
                _ = wait_until(self.connect_at) => {
                    self.connect_at = None;
                    if let Some(token) = self.pending_token.take() {
                        self.connect(token);
                    }
                }
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.apply(PushInput::ReconnectDue);
                }
                _ = wait_until(self.refresh_at) => {
                    self.refresh_at = None;
                    self.apply(PushInput::TokenRefreshDue);
                }
            }
        }

        tracing::debug!(
            state = ?self.machine.state(),
            polling = self.machine.is_polling(),
            permanent_fallback = self.machine.is_permanent_fallback(),
            failures = self.machine.consecutive_failures(),
            "Push manager stopping"
        );
        self.apply(PushInput::Shutdown);
        self.jobs.abort_all();
        tracing::info!("Push manager stopped");
    }

    fn apply(&mut self, input: PushInput) {
        let actions = self.machine.handle(input);
        for action in actions {
            self.execute(action);
        }
        self.state_tx.send_replace(self.machine.state());
    }

    fn execute(&mut self, action: PushAction) {
        match action {
            PushAction::Authenticate => self.authenticate(),
            PushAction::Connect(token) => {
                if token.conn_delay.is_zero() {
                    self.connect(token);
                } else {
                    tracing::debug!(delay_secs = token.conn_delay.as_secs(), "Delaying stream connection");
                    self.connect_at = Some(Instant::now() + token.conn_delay);
                    self.pending_token = Some(token);
                }
            }
            PushAction::CloseStream => {
                self.connection.close();
                self.opened_at = None;
                self.pending_token = None;
                self.connect_at = None;
            }
            PushAction::ScheduleReconnect(delay) => {
                self.reconnect_at = Some(Instant::now() + delay);
            }
            PushAction::ScheduleTokenRefresh(delay) => {
                self.refresh_at = Some(Instant::now() + delay);
            }
            PushAction::StartPolling => self.poller.start(),
            PushAction::StopPolling => self.poller.stop(),
            PushAction::FullSync => {
                let sync = Arc::clone(&self.synchronizer);
                self.spawn_sync("full", async move {
                    sync.full_sync(FetchOptions::cached()).await
                });
            }
            PushAction::SyncFlags { change_number } => {
                let sync = Arc::clone(&self.synchronizer);
                self.spawn_sync("flags", async move {
                    sync.sync_flags(Some(change_number), options_for_push())
                        .await
                        .map(|_| ())
                });
            }
            PushAction::KillFlag {
                change_number,
                flag_name,
                default_treatment,
            } => {
                let sync = Arc::clone(&self.synchronizer);
                self.spawn_sync("kill", async move {
                    sync.kill_flag(&flag_name, &default_treatment, change_number)
                        .await
                        .map(|_| ())
                });
            }
            PushAction::SyncSegment {
                segment_name,
                change_number,
            } => {
                let sync = Arc::clone(&self.synchronizer);
                self.spawn_sync("segment", async move {
                    sync.sync_segment(&segment_name, Some(change_number), options_for_push())
                        .await
                        .map(|_| ())
                });
            }
            PushAction::SyncMembership(update) => self.sync_membership(update),
            PushAction::FetchMembership { key } => {
                let sync = Arc::clone(&self.synchronizer);
                self.spawn_sync("membership", async move {
                    sync.sync_identity_membership(&key, None, FetchOptions::cached())
                        .await
                        .map(|_| ())
                });
            }
        }
    }

    fn authenticate(&mut self) {
        self.reconnect_at = None;
        self.auth_generation += 1;
        let generation = self.auth_generation;
        let keys = self.ctx.identity_keys();
        let auth = Arc::clone(&self.auth);
        tracing::debug!(generation, keys = keys.len(), "Authenticating for push");
        self.jobs.spawn(async move {
            let result = auth.authenticate(&keys).await;
            JobOutput::Auth { generation, result }
        });
    }

    fn connect(&mut self, token: AuthToken) {
        match build_stream_url(&self.config.streaming_url, &token) {
            Ok(url) => {
                self.opened_at = None;
                let generation = self.connection.open(url);
                tracing::info!(generation, channels = token.channels.len(), "Connecting push stream");
            }
            Err(error) => self.apply(PushInput::StreamFailed {
                error,
                uptime: None,
            }),
        }
    }

    fn sync_membership(&mut self, update: MembershipUpdate) {
        let keys = match &update.target {
            MembershipTarget::KeyHash(hash) => self.ctx.keys_for_hash(hash),
            MembershipTarget::AllKeys => self.ctx.identity_keys(),
        };
        let actions = update.plan(&keys);
        if actions.is_empty() {
            tracing::debug!(change_number = update.change_number, "Membership update affects no tracked key");
            return;
        }
        let sync = Arc::clone(&self.synchronizer);
        let change_number = update.change_number;
        self.spawn_sync("membership", async move {
            let results = futures::future::join_all(
                actions
                    .into_iter()
                    .map(|action| sync.apply_membership_action(action, change_number)),
            )
            .await;
            results.into_iter().try_for_each(|r| r.map(|_| ()))
        });
    }

    fn spawn_sync<F>(&mut self, scope: &'static str, job: F)
    where
        F: Future<Output = Result<(), crate::error::FetchError>> + Send + 'static,
    {
        self.jobs.spawn(async move {
            if let Err(e) = job.await {
                tracing::warn!(scope, error = %e, "Push-triggered sync failed");
            }
            JobOutput::Sync
        });
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        if event.generation != self.connection.generation() {
            tracing::trace!(generation = event.generation, "Dropping event from closed session");
            return;
        }
        match event.event {
            StreamEvent::Opened => {
                self.opened_at = Some(Instant::now());
                self.apply(PushInput::StreamOpened);
            }
            StreamEvent::Message(raw) => match decoder::decode(&raw) {
                Ok(notification) => {
                    tracing::debug!(kind = notification.kind(), "Notification received");
                    self.apply(PushInput::Notification(notification));
                }
                Err(error) => self.apply(PushInput::DecodeFailed(error)),
            },
            StreamEvent::Error(error) => {
                let uptime = self.opened_at.take().map(|t| t.elapsed());
                self.apply(PushInput::StreamFailed { error, uptime });
            }
            StreamEvent::Closed => {
                let uptime = self.opened_at.take().map(|t| t.elapsed());
                self.apply(PushInput::StreamFailed {
                    error: ConnectionError::Transport("stream closed by server".into()),
                    uptime,
                });
            }
        }
    }

    fn on_job(&mut self, joined: Result<JobOutput, JoinError>) {
        match joined {
            Ok(JobOutput::Auth { generation, result }) => {
                if generation != self.auth_generation {
                    tracing::debug!(generation, "Dropping superseded auth result");
                    return;
                }
                match result {
                    Ok(token) => self.apply(PushInput::AuthSucceeded(token)),
                    Err(error) => self.apply(PushInput::AuthFailed(error)),
                }
            }
            Ok(JobOutput::Sync) => {}
            Err(e) if e.is_panic() => {
                tracing::error!(error = %e, "Push job panicked");
            }
            Err(_) => {}
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
