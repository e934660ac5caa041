//! End-to-end push/polling behaviour with in-process collaborators

use std::sync::Arc;
use std::time::Duration;

use flagsync_client::mock::{MockAuthClient, MockFetcher, MockSession, MockTransport, token_for};
use flagsync_client::{
    AuthError, BackoffConfig, ConnectionError, InMemoryStorage, PushState, SchedulerConfig,
    Storage, SyncConfig, SyncEngine, SyncError, UpdateEvent,
};
use shared::{ControlType, FlagDefinition, NotificationPayload};
use tokio::sync::broadcast;

const SPLITS: &str = "NzM2MDI5Mzc0_MTgyNTg1MTgwNg==_splits";
const SEGMENTS: &str = "NzM2MDI5Mzc0_MTgyNTg1MTgwNg==_segments";
const MY_SEGMENTS: &str = "NzM2MDI5Mzc0_MTgyNTg1MTgwNg==_mySegments";
const WAIT: Duration = Duration::from_secs(3);

struct Env {
    engine: SyncEngine,
    auth: Arc<MockAuthClient>,
    fetcher: Arc<MockFetcher>,
    transport: Arc<MockTransport>,
}

fn config() -> SyncConfig {
    SyncConfig::new("test-key")
        .with_scheduler(SchedulerConfig {
            features_refresh_rate: Duration::from_millis(50),
            segments_refresh_rate: Duration::from_millis(50),
        })
        .with_backoff(
            BackoffConfig::default()
                .with_base(Duration::from_millis(10))
                .with_max(Duration::from_millis(50))
                .with_jitter(0.0),
        )
        .with_targeted_fetch_retries(0, BackoffConfig::default())
}

fn env_with(config: SyncConfig, auth: MockAuthClient) -> Env {
    let auth = Arc::new(auth);
    let fetcher = Arc::new(MockFetcher::new());
    let transport = Arc::new(MockTransport::new());
    let engine = SyncEngine::with_components(
        config,
        Arc::new(InMemoryStorage::new()),
        auth.clone(),
        fetcher.clone(),
        transport.clone(),
    )
    .unwrap();
    Env {
        engine,
        auth,
        fetcher,
        transport,
    }
}

fn env() -> Env {
    env_with(
        config(),
        MockAuthClient::always(token_for(
            &[SPLITS, SEGMENTS, MY_SEGMENTS, "control_pri", "control_sec"],
            3600,
        )),
    )
}

async fn wait_state(engine: &SyncEngine, state: PushState) {
    let mut handle = engine.push_handle().expect("engine started");
    let reached = tokio::time::timeout(WAIT, handle.wait_for(state))
        .await
        .unwrap_or(false);
    assert!(reached, "push state never reached {state:?}");
}

async fn next_matching(
    rx: &mut broadcast::Receiver<UpdateEvent>,
    pred: impl Fn(&UpdateEvent) -> bool,
) -> UpdateEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for update event")
}

fn drain(rx: &mut broadcast::Receiver<UpdateEvent>) -> Vec<UpdateEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn control(session: &MockSession, control_type: ControlType, timestamp: i64) {
    session.send_notification(
        "control_pri",
        &NotificationPayload::Control { control_type },
        timestamp,
    );
}

/// Start with `alice`, wait for the bootstrap and post-open full syncs
async fn start_alice(env: &Env, updates: &mut broadcast::Receiver<UpdateEvent>) -> MockSession {
    env.fetcher
        .add_flag_page(-1, 1000, vec![FlagDefinition::new("checkout", 1000)]);
    env.fetcher.set_memberships("alice", &["beta"], None);
    let session = env.transport.push_session();

    env.engine.start(["alice"]).unwrap();
    wait_state(&env.engine, PushState::PushActive).await;
    next_matching(updates, |e| {
        matches!(e, UpdateEvent::FlagsUpdated { change_number: 1000 })
    })
    .await;
    next_matching(updates, |e| matches!(e, UpdateEvent::MembershipUpdated { key, .. } if key == "alice")).await;
    // The post-open round repeats the bootstrap one and changes nothing
    tokio::time::sleep(Duration::from_millis(50)).await;
    session
}

#[tokio::test]
async fn data_arrives_before_stream_opens() {
    let env = env();
    env.auth.set_delay(Duration::from_millis(500));
    let mut updates = env.engine.subscribe();
    env.fetcher
        .add_flag_page(-1, 1000, vec![FlagDefinition::new("checkout", 1000)]);
    env.fetcher.set_memberships("alice", &["beta"], None);
    let _session = env.transport.push_session();

    env.engine.start(["alice"]).unwrap();
    next_matching(&mut updates, |e| {
        matches!(e, UpdateEvent::FlagsUpdated { change_number: 1000 })
    })
    .await;
    next_matching(&mut updates, |e| matches!(e, UpdateEvent::MembershipUpdated { key, .. } if key == "alice")).await;

    assert_eq!(env.engine.push_state(), Some(PushState::Initializing));
    assert_eq!(env.transport.connect_count(), 0);
    assert_eq!(env.engine.storage().flags_change_number(), 1000);

    wait_state(&env.engine, PushState::PushActive).await;
    assert_eq!(env.auth.call_count(), 1);

    env.engine.shutdown().await;
}

#[tokio::test]
async fn alice_flag_update_and_stale_notification() {
    let env = env();
    let mut updates = env.engine.subscribe();
    let session = start_alice(&env, &mut updates).await;

    env.fetcher
        .add_flag_page(1000, 2000, vec![FlagDefinition::new("checkout", 2000)]);
    session.send_notification(
        SPLITS,
        &NotificationPayload::SplitUpdate {
            change_number: 2000,
        },
        1,
    );
    let event = next_matching(&mut updates, |e| matches!(e, UpdateEvent::FlagsUpdated { .. })).await;
    assert_eq!(event, UpdateEvent::FlagsUpdated { change_number: 2000 });
    assert_eq!(env.engine.storage().flags_change_number(), 2000);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !drain(&mut updates)
            .iter()
            .any(|e| matches!(e, UpdateEvent::FlagsUpdated { .. }))
    );

    env.fetcher.clear_records();
    session.send_notification(
        SPLITS,
        &NotificationPayload::SplitUpdate {
            change_number: 1500,
        },
        2,
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(env.fetcher.flag_fetches().is_empty());
    assert_eq!(env.engine.storage().flags_change_number(), 2000);

    env.engine.shutdown().await;
}

#[tokio::test]
async fn unreadable_membership_update_fetches_full_membership() {
    let env = env();
    let mut updates = env.engine.subscribe();
    let session = start_alice(&env, &mut updates).await;
    let before = env.fetcher.membership_fetches("alice");

    env.fetcher.set_memberships("alice", &["beta", "gamma"], None);
    session.send_notification(
        MY_SEGMENTS,
        &NotificationPayload::MySegmentsUpdateV2 {
            change_number: 3000,
            segment_name: None,
            c: 1,
            // base64("not gzip")
            d: Some("bm90IGd6aXA=".into()),
            u: 1,
            h: None,
            s: None,
        },
        1,
    );

    let event = next_matching(&mut updates, |e| {
        matches!(e, UpdateEvent::MembershipUpdated { key, .. } if key == "alice")
    })
    .await;
    assert_eq!(
        event,
        UpdateEvent::MembershipUpdated {
            key: "alice".into(),
            change_number: 3000,
        }
    );
    assert_eq!(env.fetcher.membership_fetches("alice"), before + 1);
    let segments = env.engine.storage().memberships("alice").unwrap();
    assert!(segments.contains("gamma"));

    env.engine.shutdown().await;
}

#[tokio::test]
async fn streaming_disabled_control_is_permanent() {
    let env = env();
    let mut updates = env.engine.subscribe();
    let session = start_alice(&env, &mut updates).await;

    control(&session, ControlType::StreamingDisabled, 10);
    wait_state(&env.engine, PushState::PollingFallback).await;

    // Polling picks up new data without any notification
    env.fetcher
        .add_flag_page(1000, 1100, vec![FlagDefinition::new("late", 1100)]);
    next_matching(&mut updates, |e| {
        matches!(e, UpdateEvent::FlagsUpdated { change_number: 1100 })
    })
    .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(env.transport.connect_count(), 1);
    assert_eq!(env.auth.call_count(), 1);
    assert_eq!(env.engine.push_state(), Some(PushState::PollingFallback));

    env.engine.shutdown().await;
}

#[tokio::test]
async fn occupancy_pauses_and_resumes_push() {
    let env = env();
    let mut updates = env.engine.subscribe();
    let session = start_alice(&env, &mut updates).await;

    session.send_occupancy("control_pri", 0, 10);
    session.send_occupancy("control_sec", 0, 10);
    wait_state(&env.engine, PushState::PushPaused).await;

    // Notifications are ignored while paused; polling carries the data
    env.fetcher.clear_records();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!env.fetcher.flag_fetches().is_empty());

    session.send_occupancy("control_pri", 2, 20);
    wait_state(&env.engine, PushState::PushActive).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    env.fetcher.clear_records();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(env.fetcher.flag_fetches().is_empty());

    env.engine.shutdown().await;
}

#[tokio::test]
async fn paused_control_overrides_occupancy() {
    let env = env();
    let mut updates = env.engine.subscribe();
    let session = start_alice(&env, &mut updates).await;

    control(&session, ControlType::StreamingPaused, 10);
    wait_state(&env.engine, PushState::PushPaused).await;

    session.send_occupancy("control_pri", 3, 11);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.engine.push_state(), Some(PushState::PushPaused));

    control(&session, ControlType::StreamingResumed, 12);
    wait_state(&env.engine, PushState::PushActive).await;

    env.engine.shutdown().await;
}

#[tokio::test]
async fn transport_failure_falls_back_then_reconnects() {
    // Slow enough reconnect to observe the fallback state
    let env = env_with(
        config().with_backoff(
            BackoffConfig::default()
                .with_base(Duration::from_millis(300))
                .with_jitter(0.0),
        ),
        MockAuthClient::always(token_for(&[SPLITS, "control_pri", "control_sec"], 3600)),
    );
    let mut updates = env.engine.subscribe();
    let session = start_alice(&env, &mut updates).await;
    let _second = env.transport.push_session();

    session.fail(ConnectionError::Transport("connection reset".into()));
    wait_state(&env.engine, PushState::PollingFallback).await;
    wait_state(&env.engine, PushState::PushActive).await;

    assert_eq!(env.auth.call_count(), 2);
    assert_eq!(env.transport.connect_count(), 2);

    env.engine.shutdown().await;
}

#[tokio::test]
async fn expired_token_reauthenticates() {
    let env = env();
    let mut updates = env.engine.subscribe();
    let session = start_alice(&env, &mut updates).await;
    let _second = env.transport.push_session();

    session.send_error_event(40142, "Token expired");
    tokio::time::timeout(WAIT, async {
        while env.transport.connect_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    wait_state(&env.engine, PushState::PushActive).await;
    assert_eq!(env.auth.call_count(), 2);

    env.engine.shutdown().await;
}

#[tokio::test]
async fn identity_growth_reauthenticates_with_all_keys() {
    let env = env();
    let mut updates = env.engine.subscribe();
    let _session = start_alice(&env, &mut updates).await;
    let _second = env.transport.push_session();
    env.fetcher.set_memberships("bob", &["beta"], None);

    assert!(env.engine.add_identity_key("bob"));
    assert!(!env.engine.add_identity_key("bob"));

    next_matching(&mut updates, |e| {
        matches!(e, UpdateEvent::MembershipUpdated { key, .. } if key == "bob")
    })
    .await;
    tokio::time::timeout(WAIT, async {
        while env.transport.connect_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let calls = env.auth.calls();
    assert_eq!(calls.last().unwrap(), &vec!["alice".to_string(), "bob".to_string()]);
    assert_eq!(env.engine.identity_keys(), vec!["alice", "bob"]);

    env.engine.shutdown().await;
}

#[tokio::test]
async fn unauthorized_key_polls_forever() {
    let env = env_with(config(), MockAuthClient::always_fail(AuthError::Unauthorized(401)));
    let mut updates = env.engine.subscribe();
    env.fetcher
        .add_flag_page(-1, 10, vec![FlagDefinition::new("a", 10)]);

    env.engine.start(["alice"]).unwrap();
    wait_state(&env.engine, PushState::PollingFallback).await;
    next_matching(&mut updates, |e| matches!(e, UpdateEvent::FlagsUpdated { .. })).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(env.auth.call_count(), 1);
    assert_eq!(env.transport.connect_count(), 0);

    env.engine.shutdown().await;
}

#[tokio::test]
async fn streaming_disabled_by_config_never_authenticates() {
    let env = env_with(config().with_streaming_enabled(false), MockAuthClient::new());
    env.engine.start(["alice"]).unwrap();
    wait_state(&env.engine, PushState::PollingFallback).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.auth.call_count(), 0);
    assert!(!env.fetcher.flag_fetches().is_empty());

    env.engine.shutdown().await;
}

#[tokio::test]
async fn engine_lifecycle_errors() {
    let env = env();
    let _session = env.transport.push_session();
    assert!(matches!(
        env.engine.start(Vec::<String>::new()),
        Err(SyncError::Config(_))
    ));
    assert_eq!(env.engine.push_state(), None);

    env.engine.start(["alice"]).unwrap();
    assert!(matches!(
        env.engine.start(["bob"]),
        Err(SyncError::AlreadyStarted)
    ));

    env.engine.shutdown().await;
    env.engine.shutdown().await;
    assert!(matches!(env.engine.full_sync().await, Err(SyncError::Terminated)));
    assert!(matches!(env.engine.start(["alice"]), Err(SyncError::Terminated)));
}

#[tokio::test]
async fn shutdown_stops_polling() {
    let env = env_with(config().with_streaming_enabled(false), MockAuthClient::new());
    env.engine.start(["alice"]).unwrap();
    wait_state(&env.engine, PushState::PollingFallback).await;

    env.engine.shutdown().await;
    env.fetcher.clear_records();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(env.fetcher.records().is_empty());
}
