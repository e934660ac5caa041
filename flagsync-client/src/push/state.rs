//! Push/polling state machine
//!
//! Pure transition logic: inputs in, actions out. No I/O and no timers, so
//! every rule can be driven step by step from tests. The worker in
//! [`super::manager`] executes the actions.

use std::time::Duration;

use shared::ControlType;

use crate::auth::AuthToken;
use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::decoder::{MembershipDelta, MembershipTarget, MembershipUpdate, Notification};
use crate::error::{AuthError, ConnectionError, DecodeError};
use crate::occupancy::OccupancyTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Initializing,
    PushActive,
    PushPaused,
    PollingFallback,
    Terminated,
}

impl PushState {
    pub fn is_push(&self) -> bool {
        matches!(self, Self::PushActive | Self::PushPaused)
    }
}

#[derive(Debug, Clone)]
pub enum PushInput {
    Start,
    AuthSucceeded(AuthToken),
    AuthFailed(AuthError),
    StreamOpened,
    /// Session ended; `uptime` is how long it had been open, if it ever was
    StreamFailed {
        error: ConnectionError,
        uptime: Option<Duration>,
    },
    Notification(Notification),
    DecodeFailed(DecodeError),
    IdentityAdded {
        key: String,
    },
    TokenRefreshDue,
    ReconnectDue,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushAction {
    Authenticate,
    Connect(AuthToken),
    CloseStream,
    ScheduleReconnect(Duration),
    ScheduleTokenRefresh(Duration),
    StartPolling,
    StopPolling,
    FullSync,
    SyncFlags {
        change_number: i64,
    },
    KillFlag {
        change_number: i64,
        flag_name: String,
        default_treatment: String,
    },
    SyncSegment {
        segment_name: String,
        change_number: i64,
    },
    SyncMembership(MembershipUpdate),
    FetchMembership {
        key: String,
    },
}

#[derive(Debug)]
pub struct PushMachine {
    state: PushState,
    /// Push abandoned for the life of the engine
    permanent: bool,
    polling: bool,
    occupancy: OccupancyTracker,
    /// Set by STREAMING_PAUSED; occupancy cannot resume push while set
    paused_override: bool,
    last_control_ts: i64,
    backoff: Backoff,
    failures: u32,
    fallback_after: u32,
    stability_window: Duration,
    streaming_enabled: bool,
    token_refresh_margin: Duration,
    min_token_refresh: Duration,
}

impl PushMachine {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: PushState::Initializing,
            permanent: false,
            polling: false,
            occupancy: OccupancyTracker::new(),
            paused_override: false,
            last_control_ts: i64::MIN,
            backoff: Backoff::new(config.backoff.clone()),
            failures: 0,
            fallback_after: config.fallback_after_failures.max(1),
            stability_window: config.stability_window,
            streaming_enabled: config.streaming_enabled,
            token_refresh_margin: config.token_refresh_margin,
            min_token_refresh: config.min_token_refresh,
        }
    }

    pub fn state(&self) -> PushState {
        self.state
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn is_permanent_fallback(&self) -> bool {
        self.permanent
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn handle(&mut self, input: PushInput) -> Vec<PushAction> {
        if self.state == PushState::Terminated {
            return Vec::new();
        }
        let mut actions = Vec::new();
        match input {
            PushInput::Start => self.on_start(&mut actions),
            PushInput::AuthSucceeded(token) => self.on_auth_succeeded(token, &mut actions),
            PushInput::AuthFailed(error) => self.on_auth_failed(error, &mut actions),
            PushInput::StreamOpened => self.on_stream_opened(&mut actions),
            PushInput::StreamFailed { error, uptime } => {
                self.on_stream_failed(error, uptime, &mut actions)
            }
            PushInput::Notification(notification) => {
                self.on_notification(notification, &mut actions)
            }
            PushInput::DecodeFailed(error) => self.on_decode_failed(error, &mut actions),
            PushInput::IdentityAdded { key } => {
                actions.push(PushAction::FetchMembership { key });
                if !self.permanent
                    && matches!(
                        self.state,
                        PushState::Initializing | PushState::PushActive | PushState::PushPaused
                    )
                {
                    actions.push(PushAction::Authenticate);
                }
            }
            PushInput::TokenRefreshDue => {
                if self.state.is_push() {
                    tracing::info!("Push token nearing expiry, reauthenticating");
                    actions.push(PushAction::Authenticate);
                }
            }
            PushInput::ReconnectDue => {
                if !self.permanent {
                    actions.push(PushAction::Authenticate);
                }
            }
            PushInput::Shutdown => {
                self.set_state(PushState::Terminated);
                actions.push(PushAction::CloseStream);
                self.stop_polling(&mut actions);
            }
        }
        actions
    }

    fn on_start(&mut self, actions: &mut Vec<PushAction>) {
        if self.streaming_enabled {
            // Bootstrap from the CDN while the push token is being fetched
            actions.push(PushAction::FullSync);
            actions.push(PushAction::Authenticate);
        } else {
            tracing::info!("Streaming disabled by configuration, polling only");
            self.enter_permanent_fallback(actions);
        }
    }

    fn on_auth_succeeded(&mut self, token: AuthToken, actions: &mut Vec<PushAction>) {
        if self.permanent {
            return;
        }
        let refresh = token.refresh_after(self.token_refresh_margin, self.min_token_refresh);
        actions.push(PushAction::Connect(token));
        actions.push(PushAction::ScheduleTokenRefresh(refresh));
    }

    fn on_auth_failed(&mut self, error: AuthError, actions: &mut Vec<PushAction>) {
        if self.permanent {
            return;
        }
        if error.is_retryable() && self.state.is_push() {
            // Refresh or identity reauth; the open stream stays usable
            let delay = self.backoff.next_delay();
            tracing::warn!(
                error = %error,
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Push reauthentication failed, keeping current stream"
            );
            actions.push(PushAction::ScheduleReconnect(delay));
        } else if error.is_retryable() {
            tracing::warn!(error = %error, "Push authentication failed, will retry");
            self.on_retryable_failure(None, actions);
        } else {
            tracing::warn!(error = %error, "Push authentication rejected, falling back to polling");
            self.enter_permanent_fallback(actions);
        }
    }

    fn on_stream_opened(&mut self, actions: &mut Vec<PushAction>) {
        if self.permanent {
            actions.push(PushAction::CloseStream);
            return;
        }
        self.occupancy.reset();
        self.paused_override = false;
        self.set_state(PushState::PushActive);
        self.stop_polling(actions);
        actions.push(PushAction::FullSync);
    }

    fn on_stream_failed(
        &mut self,
        error: ConnectionError,
        uptime: Option<Duration>,
        actions: &mut Vec<PushAction>,
    ) {
        if self.permanent {
            return;
        }
        if !error.is_retryable() {
            tracing::warn!(error = %error, "Push stream rejected permanently, falling back to polling");
            self.enter_permanent_fallback(actions);
            return;
        }
        if error.is_token_expired() {
            if let Some(uptime) = uptime
                && uptime >= self.stability_window
            {
                self.backoff.reset();
            }
            let delay = self.backoff.next_delay();
            tracing::info!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Push token expired, reauthenticating"
            );
            actions.push(PushAction::CloseStream);
            actions.push(PushAction::ScheduleReconnect(delay));
            return;
        }
        tracing::warn!(error = %error, "Push stream failed");
        self.on_retryable_failure(uptime, actions);
    }

    fn on_retryable_failure(&mut self, uptime: Option<Duration>, actions: &mut Vec<PushAction>) {
        if let Some(uptime) = uptime
            && uptime >= self.stability_window
        {
            self.backoff.reset();
            self.failures = 0;
        }
        self.failures = self.failures.saturating_add(1);
        actions.push(PushAction::CloseStream);

        if self.failures >= self.fallback_after && self.state != PushState::PollingFallback {
            self.set_state(PushState::PollingFallback);
            self.start_polling(actions);
        }

        let delay = self.backoff.next_delay();
        tracing::debug!(
            failures = self.failures,
            attempt = self.backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling push reconnect"
        );
        actions.push(PushAction::ScheduleReconnect(delay));
    }

    fn on_notification(&mut self, notification: Notification, actions: &mut Vec<PushAction>) {
        match notification {
            Notification::Occupancy {
                channel,
                publishers,
                timestamp,
            } => {
                if !self.occupancy.observe(channel, publishers, timestamp) || self.paused_override
                {
                    return;
                }
                let present = self.occupancy.is_any_publisher_present();
                match self.state {
                    PushState::PushActive if !present => {
                        tracing::info!("No publishers on control channels, pausing push");
                        self.set_state(PushState::PushPaused);
                        self.start_polling(actions);
                    }
                    PushState::PushPaused if present => {
                        tracing::info!("Publishers back on control channels, resuming push");
                        self.resume(actions);
                    }
                    _ => {}
                }
            }
            Notification::Control { control, timestamp } => {
                self.on_control(control, timestamp, actions)
            }
            data => {
                if self.state != PushState::PushActive {
                    tracing::debug!(kind = data.kind(), state = ?self.state, "Notification discarded");
                    return;
                }
                actions.push(match data {
                    Notification::FlagUpdate { change_number } => {
                        PushAction::SyncFlags { change_number }
                    }
                    Notification::FlagRemoved {
                        change_number,
                        flag_name,
                        default_treatment,
                    } => PushAction::KillFlag {
                        change_number,
                        flag_name,
                        default_treatment,
                    },
                    Notification::SegmentUpdate {
                        change_number,
                        segment_name,
                    } => PushAction::SyncSegment {
                        segment_name,
                        change_number,
                    },
                    Notification::IdentitySegmentUpdate(update) => {
                        PushAction::SyncMembership(update)
                    }
                    Notification::Occupancy { .. } | Notification::Control { .. } => return,
                });
            }
        }
    }

    fn on_control(&mut self, control: ControlType, timestamp: i64, actions: &mut Vec<PushAction>) {
        if timestamp < self.last_control_ts {
            tracing::debug!(?control, timestamp, "Out of order control message ignored");
            return;
        }
        self.last_control_ts = timestamp;

        match control {
            ControlType::StreamingPaused => {
                if !self.state.is_push() {
                    return;
                }
                self.paused_override = true;
                if self.state == PushState::PushActive {
                    tracing::info!("Streaming paused by control message");
                    self.set_state(PushState::PushPaused);
                    self.start_polling(actions);
                }
            }
            ControlType::StreamingResumed => {
                if !self.state.is_push() {
                    return;
                }
                self.paused_override = false;
                if self.state == PushState::PushPaused {
                    tracing::info!("Streaming resumed by control message");
                    self.resume(actions);
                }
            }
            ControlType::StreamingDisabled => {
                tracing::warn!("Streaming disabled by control message, falling back to polling");
                self.enter_permanent_fallback(actions);
            }
        }
    }

    fn on_decode_failed(&mut self, error: DecodeError, actions: &mut Vec<PushAction>) {
        match error {
            DecodeError::Membership {
                change_number,
                key_hash,
                reason,
            } => {
                if self.state != PushState::PushActive {
                    return;
                }
                tracing::warn!(change_number, reason = %reason, "Unreadable membership update, fetching full membership");
                actions.push(PushAction::SyncMembership(MembershipUpdate {
                    change_number,
                    target: key_hash
                        .map(MembershipTarget::KeyHash)
                        .unwrap_or(MembershipTarget::AllKeys),
                    delta: MembershipDelta::Unbounded,
                }));
            }
            DecodeError::Malformed(reason) => {
                tracing::warn!(reason = %reason, "Dropping malformed notification");
            }
        }
    }

    fn resume(&mut self, actions: &mut Vec<PushAction>) {
        self.set_state(PushState::PushActive);
        self.stop_polling(actions);
        actions.push(PushAction::FullSync);
    }

    fn enter_permanent_fallback(&mut self, actions: &mut Vec<PushAction>) {
        self.permanent = true;
        self.paused_override = false;
        actions.push(PushAction::CloseStream);
        self.set_state(PushState::PollingFallback);
        self.start_polling(actions);
    }

    fn start_polling(&mut self, actions: &mut Vec<PushAction>) {
        if !self.polling {
            self.polling = true;
            actions.push(PushAction::StartPolling);
        }
    }

    fn stop_polling(&mut self, actions: &mut Vec<PushAction>) {
        if self.polling {
            self.polling = false;
            actions.push(PushAction::StopPolling);
        }
    }

    fn set_state(&mut self, next: PushState) {
        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "Push state changed");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::decoder::ControlChannel;
    use crate::mock::token_for;

    fn machine() -> PushMachine {
        PushMachine::new(&SyncConfig::new("key"))
    }

    fn active() -> PushMachine {
        let mut m = machine();
        m.handle(PushInput::Start);
        m.handle(PushInput::AuthSucceeded(token_for(&["a_b_splits"], 3600)));
        m.handle(PushInput::StreamOpened);
        assert_eq!(m.state(), PushState::PushActive);
        m
    }

    fn occupancy(channel: ControlChannel, publishers: u32, timestamp: i64) -> PushInput {
        PushInput::Notification(Notification::Occupancy {
            channel,
            publishers,
            timestamp,
        })
    }

    fn control(control: ControlType, timestamp: i64) -> PushInput {
        PushInput::Notification(Notification::Control { control, timestamp })
    }

    #[test]
    fn test_start_authenticates_then_connects() {
        let mut m = machine();
        assert_eq!(
            m.handle(PushInput::Start),
            vec![PushAction::FullSync, PushAction::Authenticate]
        );

        let token = token_for(&["a_b_splits"], 3600);
        let actions = m.handle(PushInput::AuthSucceeded(token.clone()));
        assert_eq!(actions[0], PushAction::Connect(token));
        assert!(matches!(actions[1], PushAction::ScheduleTokenRefresh(d) if d == Duration::from_secs(3000)));

        assert_eq!(m.handle(PushInput::StreamOpened), vec![PushAction::FullSync]);
        assert_eq!(m.state(), PushState::PushActive);
    }

    #[test]
    fn test_streaming_disabled_by_config() {
        let mut m = PushMachine::new(&SyncConfig::new("key").with_streaming_enabled(false));
        let actions = m.handle(PushInput::Start);
        assert!(actions.contains(&PushAction::StartPolling));
        assert!(!actions.contains(&PushAction::Authenticate));
        assert_eq!(m.state(), PushState::PollingFallback);
        assert!(m.handle(PushInput::ReconnectDue).is_empty());
    }

    #[test]
    fn test_unauthorized_is_permanent() {
        let mut m = machine();
        m.handle(PushInput::Start);
        let actions = m.handle(PushInput::AuthFailed(AuthError::Unauthorized(401)));
        assert!(actions.contains(&PushAction::StartPolling));
        assert_eq!(m.state(), PushState::PollingFallback);
        assert!(m.is_permanent_fallback());

        assert!(m.handle(PushInput::ReconnectDue).is_empty());
        assert_eq!(
            m.handle(PushInput::StreamOpened),
            vec![PushAction::CloseStream]
        );
        assert_eq!(m.state(), PushState::PollingFallback);
    }

    #[test]
    fn test_transport_failure_falls_back_and_retries() {
        let mut m = active();
        let actions = m.handle(PushInput::StreamFailed {
            error: ConnectionError::Transport("reset".into()),
            uptime: Some(Duration::from_secs(1)),
        });
        assert_eq!(m.state(), PushState::PollingFallback);
        assert!(!m.is_permanent_fallback());
        assert!(actions.contains(&PushAction::StartPolling));
        assert!(actions.iter().any(|a| matches!(a, PushAction::ScheduleReconnect(_))));

        assert_eq!(m.handle(PushInput::ReconnectDue), vec![PushAction::Authenticate]);
        m.handle(PushInput::AuthSucceeded(token_for(&["a_b_splits"], 3600)));
        let actions = m.handle(PushInput::StreamOpened);
        assert_eq!(actions, vec![PushAction::StopPolling, PushAction::FullSync]);
        assert_eq!(m.state(), PushState::PushActive);
    }

    #[test]
    fn test_failure_budget_delays_fallback() {
        let mut m = PushMachine::new(&SyncConfig::new("key").with_fallback_after_failures(3));
        m.handle(PushInput::Start);
        for _ in 0..2 {
            m.handle(PushInput::AuthFailed(AuthError::Network("down".into())));
            assert_eq!(m.state(), PushState::Initializing);
            assert!(!m.is_polling());
        }
        let actions = m.handle(PushInput::AuthFailed(AuthError::Network("down".into())));
        assert!(actions.contains(&PushAction::StartPolling));
        assert_eq!(m.state(), PushState::PollingFallback);
    }

    #[test]
    fn test_stable_session_resets_failures() {
        let mut m = PushMachine::new(&SyncConfig::new("key").with_fallback_after_failures(2));
        m.handle(PushInput::Start);
        m.handle(PushInput::AuthSucceeded(token_for(&["a_b_splits"], 3600)));
        m.handle(PushInput::StreamOpened);

        m.handle(PushInput::StreamFailed {
            error: ConnectionError::Timeout(Duration::from_secs(70)),
            uptime: Some(Duration::from_secs(1)),
        });
        assert_eq!(m.consecutive_failures(), 1);
        m.handle(PushInput::StreamOpened);

        m.handle(PushInput::StreamFailed {
            error: ConnectionError::Timeout(Duration::from_secs(70)),
            uptime: Some(Duration::from_secs(120)),
        });
        assert_eq!(m.consecutive_failures(), 1);
        assert_eq!(m.state(), PushState::PushActive);
    }

    #[test]
    fn test_provider_error_codes() {
        let mut m = active();
        let actions = m.handle(PushInput::StreamFailed {
            error: ConnectionError::Rejected {
                code: 40142,
                message: "Token expired".into(),
            },
            uptime: Some(Duration::from_secs(5)),
        });
        assert_eq!(actions[0], PushAction::CloseStream);
        assert_eq!(delays(&actions).len(), 1);
        assert!(!actions.contains(&PushAction::Authenticate));
        assert_eq!(m.state(), PushState::PushActive);
        assert_eq!(m.handle(PushInput::ReconnectDue), vec![PushAction::Authenticate]);

        m.handle(PushInput::StreamFailed {
            error: ConnectionError::Rejected {
                code: 40300,
                message: "Forbidden".into(),
            },
            uptime: None,
        });
        assert!(m.is_permanent_fallback());
    }

    fn no_jitter() -> PushMachine {
        PushMachine::new(
            &SyncConfig::new("key").with_backoff(BackoffConfig::default().with_jitter(0.0)),
        )
    }

    fn delays(actions: &[PushAction]) -> Vec<Duration> {
        actions
            .iter()
            .filter_map(|a| match a {
                PushAction::ScheduleReconnect(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_repeated_token_expiry_backs_off() {
        let mut m = no_jitter();
        m.handle(PushInput::Start);
        let mut seen = Vec::new();
        for _ in 0..3 {
            m.handle(PushInput::AuthSucceeded(token_for(&["a_b_splits"], 3600)));
            m.handle(PushInput::StreamOpened);
            let actions = m.handle(PushInput::StreamFailed {
                error: ConnectionError::Rejected {
                    code: 40142,
                    message: "Token expired".into(),
                },
                uptime: Some(Duration::from_millis(50)),
            });
            assert!(!actions.contains(&PushAction::Authenticate));
            seen.extend(delays(&actions));
            assert_eq!(m.handle(PushInput::ReconnectDue), vec![PushAction::Authenticate]);
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        // A session that outlived the stability window starts the curve over
        m.handle(PushInput::AuthSucceeded(token_for(&["a_b_splits"], 3600)));
        m.handle(PushInput::StreamOpened);
        let actions = m.handle(PushInput::StreamFailed {
            error: ConnectionError::Rejected {
                code: 40140,
                message: "Token error".into(),
            },
            uptime: Some(Duration::from_secs(600)),
        });
        assert_eq!(delays(&actions), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn test_reauth_failure_keeps_active_stream() {
        let mut m = PushMachine::new(
            &SyncConfig::new("key")
                .with_backoff(BackoffConfig::default().with_jitter(0.0))
                .with_fallback_after_failures(1),
        );
        m.handle(PushInput::Start);
        m.handle(PushInput::AuthSucceeded(token_for(&["a_b_splits"], 3600)));
        m.handle(PushInput::StreamOpened);

        assert_eq!(m.handle(PushInput::TokenRefreshDue), vec![PushAction::Authenticate]);
        let actions = m.handle(PushInput::AuthFailed(AuthError::Network("down".into())));
        assert_eq!(actions, vec![PushAction::ScheduleReconnect(Duration::from_secs(1))]);
        assert_eq!(m.state(), PushState::PushActive);
        assert!(!m.is_polling());
        assert_eq!(m.consecutive_failures(), 0);

        assert_eq!(m.handle(PushInput::ReconnectDue), vec![PushAction::Authenticate]);
        let actions = m.handle(PushInput::AuthFailed(AuthError::Network("down".into())));
        assert_eq!(actions, vec![PushAction::ScheduleReconnect(Duration::from_secs(2))]);

        // Paused push keeps its stream too
        m.handle(control(ControlType::StreamingPaused, 1));
        let actions = m.handle(PushInput::AuthFailed(AuthError::Network("down".into())));
        assert!(!actions.contains(&PushAction::CloseStream));
        assert_eq!(m.state(), PushState::PushPaused);

        // Rejected keys still end push for good
        m.handle(PushInput::AuthFailed(AuthError::Unauthorized(401)));
        assert!(m.is_permanent_fallback());
    }

    #[test]
    fn test_occupancy_pause_and_resume() {
        let mut m = active();
        assert!(m.handle(occupancy(ControlChannel::Primary, 0, 10)).is_empty());
        assert_eq!(m.state(), PushState::PushActive);

        let actions = m.handle(occupancy(ControlChannel::Secondary, 0, 11));
        assert_eq!(actions, vec![PushAction::StartPolling]);
        assert_eq!(m.state(), PushState::PushPaused);

        // Repeating the same sample changes nothing
        assert!(m.handle(occupancy(ControlChannel::Secondary, 0, 12)).is_empty());

        let actions = m.handle(occupancy(ControlChannel::Primary, 2, 13));
        assert_eq!(actions, vec![PushAction::StopPolling, PushAction::FullSync]);
        assert_eq!(m.state(), PushState::PushActive);
    }

    #[test]
    fn test_control_override_blocks_occupancy() {
        let mut m = active();
        let actions = m.handle(control(ControlType::StreamingPaused, 100));
        assert_eq!(actions, vec![PushAction::StartPolling]);
        assert_eq!(m.state(), PushState::PushPaused);

        m.handle(occupancy(ControlChannel::Primary, 0, 101));
        assert!(m.handle(occupancy(ControlChannel::Primary, 3, 102)).is_empty());
        assert_eq!(m.state(), PushState::PushPaused);

        // Older than the last control message
        assert!(m.handle(control(ControlType::StreamingResumed, 50)).is_empty());

        let actions = m.handle(control(ControlType::StreamingResumed, 200));
        assert_eq!(actions, vec![PushAction::StopPolling, PushAction::FullSync]);
        assert_eq!(m.state(), PushState::PushActive);
    }

    #[test]
    fn test_control_disabled_is_permanent() {
        let mut m = active();
        let actions = m.handle(control(ControlType::StreamingDisabled, 1));
        assert!(actions.contains(&PushAction::CloseStream));
        assert!(actions.contains(&PushAction::StartPolling));
        assert_eq!(m.state(), PushState::PollingFallback);

        assert!(m.handle(control(ControlType::StreamingResumed, 2)).is_empty());
        assert!(m.handle(PushInput::ReconnectDue).is_empty());
        assert!(m.handle(PushInput::TokenRefreshDue).is_empty());
        assert_eq!(m.state(), PushState::PollingFallback);
    }

    #[test]
    fn test_data_dispatch_only_when_active() {
        let mut m = active();
        let update = PushInput::Notification(Notification::FlagUpdate {
            change_number: 5,
        });
        assert_eq!(
            m.handle(update.clone()),
            vec![PushAction::SyncFlags { change_number: 5 }]
        );

        m.handle(control(ControlType::StreamingPaused, 1));
        assert!(m.handle(update).is_empty());
    }

    #[test]
    fn test_unreadable_membership_becomes_unbounded_fetch() {
        let mut m = active();
        let actions = m.handle(PushInput::DecodeFailed(DecodeError::Membership {
            change_number: 9,
            key_hash: None,
            reason: "bad gzip".into(),
        }));
        assert_eq!(
            actions,
            vec![PushAction::SyncMembership(MembershipUpdate {
                change_number: 9,
                target: MembershipTarget::AllKeys,
                delta: MembershipDelta::Unbounded,
            })]
        );
        assert!(m.handle(PushInput::DecodeFailed(DecodeError::Malformed("x".into()))).is_empty());
    }

    #[test]
    fn test_identity_growth_reauthenticates_in_push() {
        let mut m = active();
        let actions = m.handle(PushInput::IdentityAdded { key: "bob".into() });
        assert_eq!(
            actions,
            vec![
                PushAction::FetchMembership { key: "bob".into() },
                PushAction::Authenticate
            ]
        );
        assert_eq!(m.state(), PushState::PushActive);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let mut m = active();
        m.handle(control(ControlType::StreamingPaused, 1));
        let actions = m.handle(PushInput::Shutdown);
        assert_eq!(actions, vec![PushAction::CloseStream, PushAction::StopPolling]);
        assert_eq!(m.state(), PushState::Terminated);
        assert!(m.handle(PushInput::StreamOpened).is_empty());
        assert!(m.handle(PushInput::Start).is_empty());
    }
}
