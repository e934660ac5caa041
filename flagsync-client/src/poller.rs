//! Polling scheduler
//!
//! Periodic catch-up while push is unavailable. Two timers: flags on
//! `features_refresh_rate`, segments and memberships on
//! `segments_refresh_rate`. Both fire immediately on start.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::fetcher::FetchOptions;
use crate::synchronizer::Synchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollJob {
    Flags,
    SegmentsAndMemberships,
}

impl PollJob {
    fn name(&self) -> &'static str {
        match self {
            Self::Flags => "flags",
            Self::SegmentsAndMemberships => "segments",
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct PollingScheduler {
    synchronizer: Arc<Synchronizer>,
    config: SchedulerConfig,
    /// Engine-wide shutdown; every run is a child of it
    shutdown: CancellationToken,
    running: Mutex<Option<Running>>,
    starts: AtomicU64,
    stops: AtomicU64,
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("running", &self.is_running())
            .field("starts", &self.start_count())
            .field("stops", &self.stop_count())
            .finish()
    }
}

impl PollingScheduler {
    pub fn new(
        synchronizer: Arc<Synchronizer>,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            synchronizer,
            config,
            shutdown,
            running: Mutex::new(None),
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    /// Idempotent
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let cancel = self.shutdown.child_token();
        let handles = vec![
            self.spawn_loop(
                PollJob::Flags,
                self.config.features_refresh_rate,
                cancel.clone(),
            ),
            self.spawn_loop(
                PollJob::SegmentsAndMemberships,
                self.config.segments_refresh_rate,
                cancel.clone(),
            ),
        ];
        *running = Some(Running { cancel, handles });
        self.starts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            features_secs = self.config.features_refresh_rate.as_secs(),
            segments_secs = self.config.segments_refresh_rate.as_secs(),
            "Polling started"
        );
    }

    /// Idempotent. No fetch starts after this returns.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        for handle in running.handles {
            handle.abort();
        }
        self.stops.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Polling stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    fn spawn_loop(
        &self,
        job: PollJob,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let synchronizer = Arc::clone(&self.synchronizer);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let run = async {
                    match job {
                        PollJob::Flags => synchronizer
                            .sync_flags(None, FetchOptions::cached())
                            .await
                            .map(|_| ()),
                        PollJob::SegmentsAndMemberships => {
                            let (segments, memberships) = futures::join!(
                                synchronizer.sync_all_segments(FetchOptions::cached()),
                                synchronizer.sync_all_memberships(FetchOptions::cached())
                            );
                            segments.and(memberships)
                        }
                    }
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = run => {
                        if let Err(e) = result {
                            tracing::warn!(job = job.name(), error = %e, "Polling fetch failed");
                        }
                    }
                }
            }
            tracing::debug!(job = job.name(), "Polling loop exited");
        })
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SyncContext;
    use crate::events::EventBus;
    use crate::mock::{FetchRecord, MockFetcher};
    use crate::storage::InMemoryStorage;
    use crate::synchronizer::TargetedRetry;
    use shared::FlagDefinition;

    fn scheduler(fetcher: Arc<MockFetcher>, period: Duration) -> PollingScheduler {
        let ctx = Arc::new(SyncContext::new(Arc::new(InMemoryStorage::new())));
        ctx.add_identity_key("alice");
        let sync = Synchronizer::new(
            ctx,
            fetcher,
            EventBus::new(8),
            TargetedRetry {
                retries: 0,
                backoff: Default::default(),
            },
        );
        PollingScheduler::new(
            sync,
            SchedulerConfig {
                features_refresh_rate: period,
                segments_refresh_rate: period,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_first_fetch_is_immediate() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.add_flag_page(-1, 10, vec![FlagDefinition::new("f", 10)]);
        let poller = scheduler(fetcher.clone(), Duration::from_secs(3600));

        poller.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop();

        assert!(fetcher.records().contains(&FetchRecord::Flags {
            since: -1,
            no_cache: false,
            till: None,
        }));
        assert_eq!(fetcher.membership_fetches("alice"), 1);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let fetcher = Arc::new(MockFetcher::new());
        let poller = scheduler(fetcher.clone(), Duration::from_millis(10));

        poller.start();
        poller.start();
        assert!(poller.is_running());
        assert_eq!(poller.start_count(), 1);

        tokio::time::sleep(Duration::from_millis(35)).await;
        poller.stop();
        poller.stop();
        assert_eq!(poller.stop_count(), 1);
        assert!(!poller.is_running());

        let seen = fetcher.records().len();
        assert!(seen >= 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.records().len(), seen);
    }

    #[tokio::test]
    async fn test_shutdown_prevents_start() {
        let fetcher = Arc::new(MockFetcher::new());
        let shutdown = CancellationToken::new();
        let mut poller = scheduler(fetcher, Duration::from_secs(1));
        poller.shutdown = shutdown.clone();
        shutdown.cancel();
        poller.start();
        assert!(!poller.is_running());
    }
}
