use chrono::{Duration, Utc};
use sotto_crypto::token::{PURPOSE_COMPLETE_REGISTRATION, PURPOSE_SESSION};
use sotto_crypto::{DEFAULT_CODE_DIGITS, TokenIssuer, generate_code, verify_code};
use sotto_storage::{Storage, StorageError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub const MIN_IDENTIFIER_LEN: usize = 3;

/// Delivery capability for registration codes. The server core never
/// talks to an SMS or email provider directly; whoever constructs the
/// service injects the transport.
pub trait CodeNotifier: Send + Sync {
    fn send(&self, identifier: &str, code: &str);
}

/// Default sink: records that a code was issued without disclosing it.
pub struct LogNotifier;

impl CodeNotifier for LogNotifier {
    fn send(&self, identifier: &str, _code: &str) {
        info!(identifier = identifier, "registration code issued");
    }
}

#[derive(Debug)]
pub enum RegistrationError {
    InvalidIdentifier,
    IdentifierTaken,
    InvalidCode,
    InvalidKey,
    MissingIdentityKey,
    Token,
    Store,
}

impl Display for RegistrationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier => {
                write!(f, "identifier must be at least {} characters", MIN_IDENTIFIER_LEN)
            }
            Self::IdentifierTaken => write!(f, "identifier already taken"),
            Self::InvalidCode => write!(f, "invalid code"),
            Self::InvalidKey => write!(f, "invalid identity key"),
            Self::MissingIdentityKey => write!(f, "identity key required for new users"),
            Self::Token => write!(f, "invalid token"),
            Self::Store => write!(f, "storage failure"),
        }
    }
}

impl Error for RegistrationError {}

impl From<StorageError> for RegistrationError {
    fn from(_: StorageError) -> Self {
        RegistrationError::Store
    }
}

/// Drives the identifier -> code -> identity-bound transitions.
///
/// The exposed surface is the one-phase variant: `verify_2fa` performs
/// code verification, first identity binding, and session issuance in a
/// single call. Internally it still moves through a handoff token
/// between the verify and finalize halves, so both token purposes stay
/// on the same code path as a two-phase deployment would use.
pub struct RegistrationService {
    storage: Arc<Storage>,
    tokens: TokenIssuer,
    notifier: Box<dyn CodeNotifier>,
    code_ttl: Duration,
    handoff_ttl: Duration,
    session_ttl: Duration,
}

impl RegistrationService {
    pub fn new(
        storage: Arc<Storage>,
        tokens: TokenIssuer,
        notifier: Box<dyn CodeNotifier>,
        code_ttl: Duration,
        handoff_ttl: Duration,
        session_ttl: Duration,
    ) -> Self {
        RegistrationService {
            storage,
            tokens,
            notifier,
            code_ttl,
            handoff_ttl,
            session_ttl,
        }
    }

    /// Opens a registration session and hands the raw code to the
    /// notification sink. Only the salted hash is stored. The raw code is
    /// returned so dev builds can echo it; release handlers discard it.
    pub async fn start(&self, identifier: &str) -> Result<String, RegistrationError> {
        validate_identifier(identifier)?;
        match self.storage.find_user_by_identifier(identifier).await {
            Ok(_) => return Err(RegistrationError::IdentifierTaken),
            Err(StorageError::Missing) => {}
            Err(_) => return Err(RegistrationError::Store),
        }
        let (code, code_hash) = generate_code(DEFAULT_CODE_DIGITS);
        let expires_at = Utc::now() + self.code_ttl;
        self.storage
            .create_registration_session(identifier, &code_hash, expires_at)
            .await?;
        self.notifier.send(identifier, &code);
        Ok(code)
    }

    /// Checks a claimed code against the newest unexpired session for the
    /// identifier. On success the session is deleted and a short-lived
    /// handoff token is issued for the (possibly new) user.
    async fn verify(
        &self,
        identifier: &str,
        code: &str,
        identity_public_key: Option<&[u8]>,
    ) -> Result<String, RegistrationError> {
        let session = match self.storage.latest_unexpired_session(identifier).await {
            Ok(session) => session,
            Err(StorageError::Missing) => return Err(RegistrationError::InvalidCode),
            Err(_) => return Err(RegistrationError::Store),
        };
        if !verify_code(&session.code_hash, code) {
            debug!(identifier = identifier, "code verification failed");
            return Err(RegistrationError::InvalidCode);
        }
        self.storage.delete_registration_session(session.id).await?;
        let user_id = self.resolve_user(identifier, identity_public_key).await?;
        Ok(self
            .tokens
            .issue(user_id, PURPOSE_COMPLETE_REGISTRATION, self.handoff_ttl))
    }

    /// Exchanges a valid handoff token for a session token.
    async fn finalize(&self, handoff_token: &str) -> Result<(Uuid, String), RegistrationError> {
        let user_id = self
            .tokens
            .validate(handoff_token, PURPOSE_COMPLETE_REGISTRATION)
            .map_err(|_| RegistrationError::Token)?;
        let session = self.tokens.issue(user_id, PURPOSE_SESSION, self.session_ttl);
        Ok((user_id, session))
    }

    /// One-phase surface: verify -> finalize with the handoff elided from
    /// the wire.
    pub async fn verify_2fa(
        &self,
        identifier: &str,
        code: &str,
        identity_public_key: Option<&[u8]>,
    ) -> Result<(Uuid, String), RegistrationError> {
        let handoff = self.verify(identifier, code, identity_public_key).await?;
        self.finalize(&handoff).await
    }

    async fn resolve_user(
        &self,
        identifier: &str,
        identity_public_key: Option<&[u8]>,
    ) -> Result<Uuid, RegistrationError> {
        match self.storage.find_user_by_identifier(identifier).await {
            Ok(user) => Ok(user.id),
            Err(StorageError::Missing) => {
                let key = identity_public_key.ok_or(RegistrationError::MissingIdentityKey)?;
                if key.len() != 32 {
                    return Err(RegistrationError::InvalidKey);
                }
                let user_id = match self.storage.create_user(identifier, key).await {
                    Ok(id) => id,
                    // Lost a race with a concurrent verification; the row
                    // that won carries the binding.
                    Err(StorageError::Conflict) => {
                        self.storage.find_user_by_identifier(identifier).await?.id
                    }
                    Err(_) => return Err(RegistrationError::Store),
                };
                info!(identifier = identifier, user = %user_id, "identity bound");
                Ok(user_id)
            }
            Err(_) => Err(RegistrationError::Store),
        }
    }
}

fn validate_identifier(identifier: &str) -> Result<(), RegistrationError> {
    if identifier.trim().len() < MIN_IDENTIFIER_LEN {
        return Err(RegistrationError::InvalidIdentifier);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_length_gate() {
        assert!(validate_identifier("ab").is_err());
        assert!(validate_identifier("  a  ").is_err());
        assert!(validate_identifier("abc").is_ok());
        assert!(validate_identifier("alice").is_ok());
    }
}
