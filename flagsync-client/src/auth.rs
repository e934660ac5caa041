//! Auth client
//!
//! Exchanges the SDK key and the tracked identity keys for a short-lived push
//! token. The token's capability claim lists the channels the stream may
//! subscribe to.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use shared::stream::OCCUPANCY_CHANNEL_PREFIX;
use shared::{AuthResponse, TokenClaims};

use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Flags,
    Segments,
    /// Per-key channel (`Some(hash)`) or the shared membership channel
    Memberships(Option<String>),
    ControlPrimary,
    ControlSecondary,
    Other,
}

pub fn classify_channel(name: &str) -> ChannelKind {
    if name.ends_with("control_pri") {
        return ChannelKind::ControlPrimary;
    }
    if name.ends_with("control_sec") {
        return ChannelKind::ControlSecondary;
    }
    if name.ends_with("_splits") {
        return ChannelKind::Flags;
    }
    if name.ends_with("_segments") {
        return ChannelKind::Segments;
    }
    if name.ends_with("_mySegments") {
        let parts: Vec<&str> = name.split('_').collect();
        let hash = (parts.len() >= 4).then(|| parts[parts.len() - 2].to_string());
        return ChannelKind::Memberships(hash);
    }
    ChannelKind::Other
}

/// Push credential plus the channels it grants
#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    pub token: String,
    pub channels: Vec<String>,
    /// Seconds since epoch
    pub issued_at: i64,
    /// Seconds since epoch
    pub expires_at: i64,
    /// Delay requested by the server before connecting
    pub conn_delay: Duration,
}

impl AuthToken {
    pub fn from_response(resp: AuthResponse) -> Result<Self, AuthError> {
        if !resp.push_enabled {
            return Err(AuthError::PushDisabled);
        }
        let claims =
            TokenClaims::decode(&resp.token).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let channels = claims
            .channels()
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        if channels.is_empty() {
            return Err(AuthError::Malformed("token grants no channels".into()));
        }
        Ok(Self {
            token: resp.token,
            channels,
            issued_at: claims.iat,
            expires_at: claims.exp,
            conn_delay: Duration::from_secs(resp.conn_delay.unwrap_or(0)),
        })
    }

    /// Channel list for the stream URL; control channels request occupancy
    pub fn stream_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|name| match classify_channel(name) {
                ChannelKind::ControlPrimary | ChannelKind::ControlSecondary => {
                    format!("{OCCUPANCY_CHANNEL_PREFIX}{name}")
                }
                _ => name.clone(),
            })
            .collect()
    }

    /// When to reauthenticate, counted from issue: lifetime minus `margin`,
    /// never sooner than `min`
    pub fn refresh_after(&self, margin: Duration, min: Duration) -> Duration {
        let lifetime = (self.expires_at - self.issued_at).max(0) as u64;
        Duration::from_secs(lifetime.saturating_sub(margin.as_secs())).max(min)
    }
}

#[async_trait]
pub trait AuthClient: Send + Sync + std::fmt::Debug {
    /// `keys` is the full, ordered set of tracked identity keys
    async fn authenticate(&self, keys: &[String]) -> Result<AuthToken, AuthError>;
}

/// `GET {auth_url}/v2/auth?users=...` with the SDK key as bearer
#[derive(Debug, Clone)]
pub struct HttpAuthClient {
    client: Client,
    auth_url: String,
    sdk_key: String,
}

impl HttpAuthClient {
    pub fn new(client: Client, auth_url: impl Into<String>, sdk_key: impl Into<String>) -> Self {
        Self {
            client,
            auth_url: auth_url.into().trim_end_matches('/').to_string(),
            sdk_key: sdk_key.into(),
        }
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn authenticate(&self, keys: &[String]) -> Result<AuthToken, AuthError> {
        let url = format!("{}/v2/auth", self.auth_url);
        let query: Vec<(&str, &str)> = keys.iter().map(|k| ("users", k.as_str())).collect();

        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.sdk_key)
            .query(&query)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = resp.status();
        if status.is_client_error() {
            return Err(AuthError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(AuthError::Network(format!("auth returned HTTP {status}")));
        }

        let body: AuthResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let token = AuthToken::from_response(body)?;
        tracing::debug!(
            channels = token.channels.len(),
            expires_at = token.expires_at,
            "Push token issued"
        );
        Ok(token)
    }
}
