//! Synchronizer
//!
//! Greedy catch-up fetches and the only place that writes to storage and
//! emits update events.
//!
//! - every loop pages `since -> till` until the server answers `since == till`
//! - writes are compare-and-apply on the scope's change number
//! - one update event per scope per round, never per page
//! - at most one loop per scope in flight; concurrent callers share its result

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;

use crate::backoff::BackoffConfig;
use crate::context::SyncContext;
use crate::decoder::MembershipAction;
use crate::error::FetchError;
use crate::events::{EventBus, UpdateEvent};
use crate::fetcher::{ChangesFetcher, FetchOptions};
use crate::storage::UNSYNCED;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Flags,
    Segment(String),
    Membership(String),
}

/// Result of one synchronization round for a scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Whether storage changed (and an event fired)
    pub applied: bool,
    /// Fetch requests issued by the round
    pub pages: u32,
    /// Stored change number once the round finished
    pub change_number: i64,
}

impl RoundOutcome {
    fn skipped(change_number: i64) -> Self {
        Self {
            applied: false,
            pages: 0,
            change_number,
        }
    }
}

pub type RoundResult = Result<RoundOutcome, FetchError>;

type SharedRound = Shared<BoxFuture<'static, RoundResult>>;

#[derive(Debug, Clone)]
pub struct TargetedRetry {
    pub retries: u32,
    pub backoff: BackoffConfig,
}

pub struct Synchronizer {
    ctx: Arc<SyncContext>,
    fetcher: Arc<dyn ChangesFetcher>,
    events: EventBus,
    retry: TargetedRetry,
    inflight: Mutex<HashMap<Scope, SharedRound>>,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("inflight", &self.inflight.lock().len())
            .finish_non_exhaustive()
    }
}

impl Synchronizer {
    pub fn new(
        ctx: Arc<SyncContext>,
        fetcher: Arc<dyn ChangesFetcher>,
        events: EventBus,
        retry: TargetedRetry,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            fetcher,
            events,
            retry,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Flags, then every referenced segment and every tracked key's membership.
    ///
    /// All scopes are attempted; the first error is returned.
    pub async fn full_sync(self: &Arc<Self>, options: FetchOptions) -> Result<(), FetchError> {
        tracing::debug!(no_cache = options.no_cache, "Full sync");
        let flags = self.sync_flags(None, options).await;

        let (segments, memberships) = futures::join!(
            self.sync_all_segments(options),
            self.sync_all_memberships(options)
        );

        flags?;
        segments?;
        memberships
    }

    /// Bring flags up to date. With a `target`, the call is a no-op when
    /// storage is already there, and retries (bounded) while the server keeps
    /// answering with older data.
    pub async fn sync_flags(
        self: &Arc<Self>,
        target: Option<i64>,
        options: FetchOptions,
    ) -> RoundResult {
        let storage = self.ctx.storage();
        let current = storage.flags_change_number();
        if let Some(target) = target
            && target <= current
        {
            tracing::debug!(target, current, "Flag notification is stale, skipping");
            return Ok(RoundOutcome::skipped(current));
        }

        let mut outcome = self.run_round(Scope::Flags, options).await?;
        if let Some(target) = target {
            let mut attempt = 0;
            while storage.flags_change_number() < target && attempt < self.retry.retries {
                attempt += 1;
                tokio::time::sleep(self.retry.backoff.delay_for_attempt(attempt)).await;
                tracing::debug!(target, attempt, "Flags behind notification, refetching");
                outcome = self
                    .run_round(Scope::Flags, options.with_till(target))
                    .await?;
            }
            if storage.flags_change_number() < target {
                tracing::warn!(
                    target,
                    current = storage.flags_change_number(),
                    "Flags did not reach notified change number"
                );
            }
        }

        if outcome.applied {
            self.sync_unsynced_segments().await?;
        }
        Ok(outcome)
    }

    /// Kill a flag locally, then fetch its new definition
    pub async fn kill_flag(
        self: &Arc<Self>,
        name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> RoundResult {
        let storage = self.ctx.storage();
        if storage.kill_flag(name, default_treatment, change_number) {
            tracing::info!(flag = %name, change_number, "Flag killed");
            self.events.emit(UpdateEvent::FlagsUpdated { change_number });
        }
        self.sync_flags(Some(change_number), options_for_push()).await
    }

    pub async fn sync_segment(
        self: &Arc<Self>,
        name: &str,
        target: Option<i64>,
        options: FetchOptions,
    ) -> RoundResult {
        let current = self.ctx.storage().segment_change_number(name);
        if let Some(target) = target
            && target <= current
        {
            tracing::debug!(segment = %name, target, current, "Segment notification is stale, skipping");
            return Ok(RoundOutcome::skipped(current));
        }
        let Some(target) = target else {
            return self.run_round(Scope::Segment(name.to_string()), options).await;
        };

        let storage = self.ctx.storage();
        let options = options.with_till(target);
        // The first round may be a joined one started without this target
        let mut outcome = self
            .run_round(Scope::Segment(name.to_string()), options)
            .await?;
        let mut attempt = 0;
        while storage.segment_change_number(name) < target && attempt < self.retry.retries {
            attempt += 1;
            tokio::time::sleep(self.retry.backoff.delay_for_attempt(attempt)).await;
            tracing::debug!(segment = %name, target, attempt, "Segment behind notification, refetching");
            outcome = self
                .run_round(Scope::Segment(name.to_string()), options)
                .await?;
        }
        if storage.segment_change_number(name) < target {
            tracing::warn!(
                segment = %name,
                target,
                current = storage.segment_change_number(name),
                "Segment did not reach notified change number"
            );
        }
        Ok(outcome)
    }

    /// Full-replace fetch of one key's membership
    pub async fn sync_identity_membership(
        self: &Arc<Self>,
        key: &str,
        target: Option<i64>,
        options: FetchOptions,
    ) -> RoundResult {
        let storage = self.ctx.storage();
        let current = storage.membership_change_number(key);
        if let Some(target) = target
            && target <= current
        {
            tracing::debug!(key = %key, target, current, "Membership notification is stale, skipping");
            return Ok(RoundOutcome::skipped(current));
        }
        let options = match target {
            Some(target) => options.with_till(target),
            None => options,
        };

        let mut outcome = self
            .run_round(Scope::Membership(key.to_string()), options)
            .await?;
        // A joined round may have been started for an older target
        if let Some(target) = target
            && storage.membership_change_number(key) < target
        {
            outcome = self
                .run_round(Scope::Membership(key.to_string()), options)
                .await?;
        }
        Ok(outcome)
    }

    /// Every segment referenced by stored flags
    pub async fn sync_all_segments(
        self: &Arc<Self>,
        options: FetchOptions,
    ) -> Result<(), FetchError> {
        let names = self.ctx.storage().referenced_segments();
        self.sync_segments(names, options).await
    }

    /// Every tracked identity key
    pub async fn sync_all_memberships(
        self: &Arc<Self>,
        options: FetchOptions,
    ) -> Result<(), FetchError> {
        let keys = self.ctx.identity_keys();
        let results = join_all(
            keys.iter()
                .map(|key| self.sync_identity_membership(key, None, options)),
        )
        .await;
        results.into_iter().try_for_each(|r| r.map(|_| ()))
    }

    /// Segments referenced by flags but never fetched
    async fn sync_unsynced_segments(self: &Arc<Self>) -> Result<(), FetchError> {
        let storage = self.ctx.storage();
        let names: BTreeSet<String> = storage
            .referenced_segments()
            .into_iter()
            .filter(|name| storage.segment_change_number(name) == UNSYNCED)
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = names.len(), "Syncing newly referenced segments");
        self.sync_segments(names, FetchOptions::cached()).await
    }

    async fn sync_segments(
        self: &Arc<Self>,
        names: BTreeSet<String>,
        options: FetchOptions,
    ) -> Result<(), FetchError> {
        let results = join_all(
            names
                .iter()
                .map(|name| self.run_round(Scope::Segment(name.clone()), options)),
        )
        .await;
        results.into_iter().try_for_each(|r| r.map(|_| ()))
    }

    /// Apply a resolved membership action. Local deltas are written directly;
    /// fetches go through the collapsed membership round.
    pub async fn apply_membership_action(
        self: &Arc<Self>,
        action: MembershipAction,
        change_number: i64,
    ) -> RoundResult {
        let storage = self.ctx.storage();
        match action {
            MembershipAction::Fetch { key } => {
                self.sync_identity_membership(&key, Some(change_number), options_for_push())
                    .await
            }
            MembershipAction::Replace { key, segments } => {
                let applied = storage.replace_memberships(&key, segments, Some(change_number));
                Ok(self.finish_local_membership(key, applied))
            }
            MembershipAction::Set {
                key,
                segment,
                member,
            } => {
                let applied = storage.update_membership(&key, &segment, member, change_number);
                Ok(self.finish_local_membership(key, applied))
            }
        }
    }

    fn finish_local_membership(&self, key: String, applied: bool) -> RoundOutcome {
        let change_number = self.ctx.storage().membership_change_number(&key);
        if applied {
            self.events.emit(UpdateEvent::MembershipUpdated {
                key,
                change_number,
            });
        }
        RoundOutcome {
            applied,
            pages: 0,
            change_number,
        }
    }

    /// Start a round for `scope` or join the one already running
    async fn run_round(self: &Arc<Self>, scope: Scope, options: FetchOptions) -> RoundResult {
        let round = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&scope) {
                tracing::trace!(?scope, "Joining in-flight round");
                existing.clone()
            } else {
                let this = Arc::clone(self);
                let key = scope.clone();
                let round = async move {
                    let result = match &key {
                        Scope::Flags => this.flags_round(options).await,
                        Scope::Segment(name) => this.segment_round(name, options).await,
                        Scope::Membership(k) => this.membership_round(k, options).await,
                    };
                    this.inflight.lock().remove(&key);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(scope, round.clone());
                round
            }
        };
        round.await
    }

    async fn flags_round(&self, options: FetchOptions) -> RoundResult {
        let storage = self.ctx.storage();
        let mut since = storage.flags_change_number();
        let mut pages = 0;
        let mut applied = false;

        let result = loop {
            let page = match self.fetcher.fetch_flag_changes(since, options).await {
                Ok(page) => page,
                Err(e) => break Err(e),
            };
            pages += 1;

            let (removed, updated): (Vec<_>, Vec<_>) =
                page.splits.into_iter().partition(|f| f.is_archived());
            let removed = removed.into_iter().map(|f| f.name).collect();
            if storage.apply_flag_changes(updated, removed, page.till) {
                applied = true;
            }

            if page.since == page.till || page.till <= since {
                break Ok(());
            }
            since = page.till;
        };

        let change_number = storage.flags_change_number();
        if applied {
            self.events
                .emit(UpdateEvent::FlagsUpdated { change_number });
        }
        match result {
            Ok(()) => {
                tracing::debug!(pages, change_number, applied, "Flags converged");
                Ok(RoundOutcome {
                    applied,
                    pages,
                    change_number,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, change_number, "Flag sync round aborted");
                Err(e)
            }
        }
    }

    async fn segment_round(&self, name: &str, options: FetchOptions) -> RoundResult {
        let storage = self.ctx.storage();
        let mut since = storage.segment_change_number(name);
        let mut pages = 0;
        let mut applied = false;

        let result = loop {
            let page = match self
                .fetcher
                .fetch_segment_changes(name, since, options)
                .await
            {
                Ok(page) => page,
                Err(e) => break Err(e),
            };
            pages += 1;

            if storage.apply_segment_changes(name, page.added, page.removed, page.till) {
                applied = true;
            }

            if page.since == page.till || page.till <= since {
                break Ok(());
            }
            since = page.till;
        };

        let change_number = storage.segment_change_number(name);
        if applied {
            self.events.emit(UpdateEvent::SegmentUpdated {
                name: name.to_string(),
                change_number,
            });
        }
        match result {
            Ok(()) => Ok(RoundOutcome {
                applied,
                pages,
                change_number,
            }),
            Err(e) => {
                tracing::warn!(segment = %name, error = %e, "Segment sync round aborted");
                Err(e)
            }
        }
    }

    async fn membership_round(&self, key: &str, options: FetchOptions) -> RoundResult {
        let storage = self.ctx.storage();
        let resp = self
            .fetcher
            .fetch_memberships(key, options)
            .await
            .inspect_err(|e| tracing::warn!(key = %key, error = %e, "Membership fetch failed"))?;

        let change_number = resp.change_number.or(options.till);
        let applied =
            storage.replace_memberships(key, resp.names().into_iter().collect(), change_number);
        let outcome = self.finish_local_membership(key.to_string(), applied);
        Ok(RoundOutcome { pages: 1, ..outcome })
    }
}

/// Push-triggered fetches bypass shared caches
pub fn options_for_push() -> FetchOptions {
    FetchOptions::no_cache()
}
