//! Standalone mock control plane
//!
//! Serves a small demo dataset and publishes a flag update every
//! `FLAGSYNC_MOCK_PUBLISH_SECS` seconds so a client can be watched live.

use std::time::Duration;

use flagsync_mock::{ControlPlane, MockServer};
use serde_json::json;
use shared::{FlagDefinition, NotificationPayload};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let addr = std::env::var("FLAGSYNC_MOCK_ADDR").unwrap_or_else(|_| "127.0.0.1:3999".into());
    let sdk_key = std::env::var("FLAGSYNC_SDK_KEY").unwrap_or_else(|_| "demo-key".into());
    let publish_every = std::env::var("FLAGSYNC_MOCK_PUBLISH_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(10));

    let plane = ControlPlane::new(sdk_key);
    let mut checkout = FlagDefinition::new("new_checkout", 1000);
    checkout.conditions = vec![json!({
        "matcherGroup": {
            "matchers": [{
                "matcherType": "IN_SEGMENT",
                "userDefinedSegmentMatcherData": { "segmentName": "beta_testers" }
            }]
        }
    })];
    plane.add_flag_page(-1, 1000, vec![checkout]);
    plane.add_segment_page("beta_testers", -1, 500, &["alice"], &[]);
    plane.set_memberships("alice", &["beta_testers"], Some(500));

    let server = MockServer::bind(&addr, plane.clone()).await?;
    tracing::info!(url = %server.base_url(), "Mock control plane ready");

    let splits_channel = plane
        .channels()
        .into_iter()
        .find(|c| c.ends_with("_splits"))
        .unwrap_or_default();
    let mut ticker = tokio::time::interval(publish_every);
    ticker.tick().await;
    let mut change_number = 1000;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let next = change_number + 1000;
                plane.add_flag_page(
                    change_number,
                    next,
                    vec![FlagDefinition::new(format!("flag_{next}"), next)],
                );
                change_number = next;
                let receivers = plane.publish_notification(
                    &splits_channel,
                    &NotificationPayload::SplitUpdate { change_number },
                );
                tracing::info!(change_number, receivers, "Published flag update");
            }
        }
    }

    tracing::info!("Mock control plane shutting down");
    Ok(())
}
