//! Auth endpoint payloads and push token claims

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Response of `GET /v2/auth`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    /// Whether the push channel may be used at all
    #[serde(default)]
    pub push_enabled: bool,
    /// Signed JWT, empty when push is disabled
    #[serde(default)]
    pub token: String,
    /// Seconds to wait before opening the stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_delay: Option<u64>,
}

/// Payload section of the push token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// JSON object mapping channel name to granted operations, serialized as a string
    #[serde(rename = "x-ably-capability")]
    pub capability: String,
    /// Expiry, seconds since epoch
    pub exp: i64,
    /// Issued at, seconds since epoch
    pub iat: i64,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid push token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("capability claim is not a JSON object: {0}")]
    Capability(#[from] serde_json::Error),
}

impl TokenClaims {
    /// Read the claims of a push token without checking its signature or expiry.
    ///
    /// The client only needs the channel list and the lifetime; the streaming
    /// service verifies the token itself.
    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        let data = decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)?;
        Ok(data.claims)
    }

    /// Channel names granted by the capability claim, in sorted order
    pub fn channels(&self) -> Result<Vec<String>, TokenError> {
        let capability: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&self.capability)?;
        Ok(capability.into_iter().map(|(name, _)| name).collect())
    }

    /// Token lifetime in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.exp - self.iat
    }

    /// HS256-sign the claims. Used by the mock control plane and tests.
    pub fn sign(&self, secret: &[u8]) -> Result<String, TokenError> {
        Ok(encode(
            &Header::default(),
            self,
            &EncodingKey::from_secret(secret),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> TokenClaims {
        TokenClaims {
            capability: r#"{"xxxx_xxxx_splits":["subscribe"],"control_pri":["subscribe"]}"#
                .to_string(),
            exp: 1_700_003_600,
            iat: 1_700_000_000,
        }
    }

    #[test]
    fn test_decode_ignores_signature_and_expiry() {
        // expired long ago and signed with a key the client never sees
        let token = claims().sign(b"server-side-secret").unwrap();
        let decoded = TokenClaims::decode(&token).unwrap();
        assert_eq!(decoded, claims());
        assert_eq!(decoded.lifetime_secs(), 3600);
        assert_eq!(
            decoded.channels().unwrap(),
            vec!["control_pri".to_string(), "xxxx_xxxx_splits".to_string()]
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            TokenClaims::decode("not-a-jwt"),
            Err(TokenError::Jwt(_))
        ));
        assert!(matches!(
            TokenClaims::decode("a.!!!.c"),
            Err(TokenError::Jwt(_))
        ));

        let bad_capability = TokenClaims {
            capability: "[]".into(),
            ..claims()
        };
        assert!(matches!(
            bad_capability.channels(),
            Err(TokenError::Capability(_))
        ));
    }

    #[test]
    fn test_auth_response_defaults() {
        let resp: AuthResponse = serde_json::from_str(r#"{"pushEnabled":false}"#).unwrap();
        assert!(!resp.push_enabled);
        assert!(resp.token.is_empty());
        assert_eq!(resp.conn_delay, None);
    }
}
