//! Error types of the sync runtime
//!
//! None of these reach consumer reads. They drive retry and fallback
//! decisions inside the push worker and are logged.

use thiserror::Error;

/// Auth endpoint failure
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Credentials rejected; push is abandoned for the life of the engine
    #[error("auth rejected the SDK key (HTTP {0})")]
    Unauthorized(u16),

    /// Auth succeeded but the account has push turned off
    #[error("push is disabled for this SDK key")]
    PushDisabled,

    #[error("auth request failed: {0}")]
    Network(String),

    #[error("malformed auth response: {0}")]
    Malformed(String),
}

impl AuthError {
    /// Whether the push worker may try again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Malformed(_))
    }
}

/// Stream transport failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    #[error("stream transport error: {0}")]
    Transport(String),

    /// No bytes (heartbeats included) within the read timeout
    #[error("stream read timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Error event raised by the push provider
    #[error("push provider rejected the stream (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

impl ConnectionError {
    /// Provider codes 40140..=40149 mean the token expired
    pub fn is_token_expired(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if (40140..=40149).contains(code))
    }

    /// Any other 4xxxx provider code is permanent
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Rejected { code, .. } => {
                self.is_token_expired() || !(40000..=49999).contains(code)
            }
        }
    }
}

/// Notification decode failure
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("malformed notification: {0}")]
    Malformed(String),

    /// A membership update whose compact payload could not be read.
    /// Carries enough routing data to degrade to a full membership fetch.
    #[error("unreadable membership payload at change {change_number}: {reason}")]
    Membership {
        change_number: i64,
        /// Key hash of the targeted key, `None` for shared-channel updates
        key_hash: Option<String>,
        reason: String,
    },
}

/// Catch-up fetch failure
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("fetch request failed: {0}")]
    Network(String),

    #[error("fetch rejected by server (HTTP {status}): {message}")]
    Server { status: u16, message: String },
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Server {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => Self::Network(e.to_string()),
        }
    }
}

/// Engine facade errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine is shut down")]
    Terminated,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_code_classification() {
        let expired = ConnectionError::Rejected {
            code: 40142,
            message: "Token expired".into(),
        };
        assert!(expired.is_token_expired());
        assert!(expired.is_retryable());

        let forbidden = ConnectionError::Rejected {
            code: 40300,
            message: "Forbidden".into(),
        };
        assert!(!forbidden.is_token_expired());
        assert!(!forbidden.is_retryable());

        let internal = ConnectionError::Rejected {
            code: 50000,
            message: "Internal".into(),
        };
        assert!(internal.is_retryable());
        assert!(ConnectionError::Transport("reset".into()).is_retryable());
    }

    #[test]
    fn test_auth_retryability() {
        assert!(!AuthError::Unauthorized(401).is_retryable());
        assert!(!AuthError::PushDisabled.is_retryable());
        assert!(AuthError::Network("refused".into()).is_retryable());
        assert!(AuthError::Malformed("bad token".into()).is_retryable());
    }
}
