//! Watch a dataset stay in sync
//!
//! Run against the mock control plane:
//!
//! ```text
//! cargo run -p flagsync-mock
//! FLAGSYNC_SDK_KEY=demo-key FLAGSYNC_SDK_URL=http://127.0.0.1:3999 \
//! FLAGSYNC_AUTH_URL=http://127.0.0.1:3999 FLAGSYNC_STREAMING_URL=http://127.0.0.1:3999 \
//! cargo run --example watch -- alice
//! ```

use flagsync_client::{SyncConfig, SyncEngine, UpdateEvent, init_logger_with_file};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let log_dir = std::env::var("FLAGSYNC_LOG_DIR").ok();
    init_logger_with_file("info,flagsync_client=debug", false, log_dir.as_deref())?;

    let keys: Vec<String> = std::env::args().skip(1).collect();
    let keys = if keys.is_empty() {
        vec!["alice".to_string()]
    } else {
        keys
    };

    let engine = SyncEngine::new(SyncConfig::from_env())?;
    let mut updates = engine.subscribe();
    engine.start(&keys)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = updates.recv() => match event {
                Ok(UpdateEvent::FlagsUpdated { change_number }) => {
                    let storage = engine.storage();
                    tracing::info!(change_number, flags = ?storage.flag_names(), "Flags updated");
                }
                Ok(UpdateEvent::SegmentUpdated { name, change_number }) => {
                    tracing::info!(segment = %name, change_number, "Segment updated");
                }
                Ok(UpdateEvent::MembershipUpdated { key, change_number }) => {
                    let segments = engine.storage().memberships(&key).unwrap_or_default();
                    tracing::info!(key = %key, change_number, ?segments, "Membership updated");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Update listener lagged");
                }
                Err(_) => break,
            },
        }
        if let Some(state) = engine.push_state() {
            tracing::debug!(?state, "Push state");
        }
    }

    engine.shutdown().await;
    Ok(())
}
