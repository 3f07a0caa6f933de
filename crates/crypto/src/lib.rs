use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::convert::TryFrom;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod code;
pub mod envelope;
pub mod token;

pub use code::{DEFAULT_CODE_DIGITS, generate_code, verify_code};
pub use envelope::{decrypt_envelope, private_key_from_pem, public_key_pem};
pub use token::{PURPOSE_COMPLETE_REGISTRATION, PURPOSE_SESSION, TokenIssuer};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug)]
pub enum CryptoError {
    InvalidKey,
    Signature,
    Token,
    Envelope,
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "invalid key material"),
            Self::Signature => write!(f, "signature error"),
            Self::Token => write!(f, "token invalid"),
            Self::Envelope => write!(f, "envelope decryption failure"),
        }
    }
}

impl Error for CryptoError {}

/// Decodes a hex string that must carry exactly `N` bytes.
pub(crate) fn decode_fixed<const N: usize>(value: &str) -> Option<[u8; N]> {
    let bytes = hex::decode(value).ok()?;
    bytes.try_into().ok()
}

/// Verifies ownership of a signed pre-key.
///
/// Returns true only when the signing key is 32 bytes, the pre-key is
/// 32 bytes, the signature is 64 bytes, and the Ed25519 verification of
/// the pre-key bytes under the signing key succeeds. Every malformed
/// input yields false; this function never panics.
pub fn verify_signed_prekey(signing_pub: &[u8], prekey_pub: &[u8], signature: &[u8]) -> bool {
    if signing_pub.len() != PUBLIC_KEY_LEN
        || prekey_pub.len() != PUBLIC_KEY_LEN
        || signature.len() != SIGNATURE_LEN
    {
        return false;
    }
    let mut key_bytes = [0u8; PUBLIC_KEY_LEN];
    key_bytes.copy_from_slice(signing_pub);
    let verifying = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let parsed = match Signature::try_from(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    verifying.verify(prekey_pub, &parsed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn accepts_valid_signature() {
        let signing = keypair();
        let prekey = [3u8; 32];
        let signature = signing.sign(&prekey).to_bytes();
        assert!(verify_signed_prekey(
            signing.verifying_key().as_bytes(),
            &prekey,
            &signature,
        ));
    }

    #[test]
    fn rejects_forged_signature() {
        let signing = keypair();
        let prekey = [3u8; 32];
        let mut signature = signing.sign(&prekey).to_bytes();
        signature[17] ^= 0x01;
        assert!(!verify_signed_prekey(
            signing.verifying_key().as_bytes(),
            &prekey,
            &signature,
        ));
    }

    #[test]
    fn rejects_wrong_signing_key() {
        let signing = keypair();
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let prekey = [3u8; 32];
        let signature = signing.sign(&prekey).to_bytes();
        assert!(!verify_signed_prekey(
            other.verifying_key().as_bytes(),
            &prekey,
            &signature,
        ));
    }

    #[test]
    fn fixed_hex_decode_enforces_length() {
        assert_eq!(decode_fixed::<2>("beef"), Some([0xbe, 0xef]));
        assert!(decode_fixed::<2>("be").is_none());
        assert!(decode_fixed::<2>("zzzz").is_none());
    }

    #[test]
    fn rejects_malformed_lengths() {
        let signing = keypair();
        let prekey = [3u8; 32];
        let signature = signing.sign(&prekey).to_bytes();
        let public = signing.verifying_key();
        assert!(!verify_signed_prekey(&public.as_bytes()[..31], &prekey, &signature));
        assert!(!verify_signed_prekey(public.as_bytes(), &prekey[..31], &signature));
        assert!(!verify_signed_prekey(public.as_bytes(), &prekey, &signature[..63]));
        assert!(!verify_signed_prekey(&[], &[], &[]));
    }
}
