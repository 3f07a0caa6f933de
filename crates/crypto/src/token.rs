use crate::CryptoError;
use crate::decode_fixed;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

pub const PURPOSE_SESSION: &str = "session";
pub const PURPOSE_COMPLETE_REGISTRATION: &str = "complete_registration";

const MIN_SECRET_LEN: usize = 32;
const KEY_CONTEXT: &str = "sotto bearer token v1";

#[derive(Debug, Deserialize)]
struct TokenClaims {
    user_id: Uuid,
    purpose: String,
    issued_at: i64,
    expires_at: i64,
}

/// Stateless bearer token mint.
///
/// Tokens are `hex(claims_json).hex(mac)` where the MAC is a BLAKE3 keyed
/// hash of the claims under a key derived from the configured secret.
/// Validation requires the expected purpose, so a handoff token can never
/// authenticate a session and vice versa.
#[derive(Clone)]
pub struct TokenIssuer {
    key: [u8; 32],
}

impl TokenIssuer {
    pub fn new(secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CryptoError::InvalidKey);
        }
        Ok(Self {
            key: blake3::derive_key(KEY_CONTEXT, secret),
        })
    }

    pub fn issue(&self, user_id: Uuid, purpose: &str, ttl: Duration) -> String {
        let now = Utc::now();
        self.issue_at(user_id, purpose, now, now + ttl)
    }

    fn issue_at(
        &self,
        user_id: Uuid,
        purpose: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> String {
        let payload = serde_json::json!({
            "user_id": user_id,
            "purpose": purpose,
            "issued_at": issued_at.timestamp(),
            "expires_at": expires_at.timestamp(),
        })
        .to_string()
        .into_bytes();
        let mac = blake3::keyed_hash(&self.key, &payload);
        format!("{}.{}", hex::encode(&payload), hex::encode(mac.as_bytes()))
    }

    /// Validates a token for the expected purpose and returns the bound
    /// user. Every failure mode collapses into the single `Token` error so
    /// callers cannot leak which check rejected the bearer.
    pub fn validate(&self, token: &str, purpose: &str) -> Result<Uuid, CryptoError> {
        let (payload_hex, mac_hex) = token.split_once('.').ok_or(CryptoError::Token)?;
        let payload = hex::decode(payload_hex).map_err(|_| CryptoError::Token)?;
        let mac = decode_fixed::<32>(mac_hex).ok_or(CryptoError::Token)?;
        if blake3::keyed_hash(&self.key, &payload) != blake3::Hash::from(mac) {
            return Err(CryptoError::Token);
        }
        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| CryptoError::Token)?;
        if claims.purpose != purpose {
            return Err(CryptoError::Token);
        }
        if claims.expires_at <= Utc::now().timestamp() {
            return Err(CryptoError::Token);
        }
        Ok(claims.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(b"0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn rejects_short_secret() {
        assert!(TokenIssuer::new(b"too-short").is_err());
    }

    #[test]
    fn roundtrip_session_token() {
        let issuer = issuer();
        let user = Uuid::new_v4();
        let token = issuer.issue(user, PURPOSE_SESSION, Duration::hours(24));
        assert_eq!(issuer.validate(&token, PURPOSE_SESSION).unwrap(), user);
    }

    #[test]
    fn purpose_mismatch_is_rejected() {
        let issuer = issuer();
        let token = issuer.issue(Uuid::new_v4(), PURPOSE_COMPLETE_REGISTRATION, Duration::minutes(5));
        assert!(issuer.validate(&token, PURPOSE_SESSION).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = issuer();
        let user = Uuid::new_v4();
        let now = Utc::now();
        let token = issuer.issue_at(user, PURPOSE_SESSION, now - Duration::hours(2), now - Duration::hours(1));
        assert!(issuer.validate(&token, PURPOSE_SESSION).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let issuer = issuer();
        let token = issuer.issue(Uuid::new_v4(), PURPOSE_SESSION, Duration::hours(1));
        let mut chars: Vec<char> = token.chars().collect();
        chars[2] = if chars[2] == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();
        assert!(issuer.validate(&tampered, PURPOSE_SESSION).is_err());
    }

    #[test]
    fn foreign_key_is_rejected() {
        let issuer = issuer();
        let other = TokenIssuer::new(b"ffffffffffffffffffffffffffffffff").unwrap();
        let token = issuer.issue(Uuid::new_v4(), PURPOSE_SESSION, Duration::hours(1));
        assert!(other.validate(&token, PURPOSE_SESSION).is_err());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let issuer = issuer();
        assert!(issuer.validate("", PURPOSE_SESSION).is_err());
        assert!(issuer.validate("not-a-token", PURPOSE_SESSION).is_err());
        assert!(issuer.validate("abcd.ef", PURPOSE_SESSION).is_err());
    }
}
