use crate::CryptoError;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::{Oaep, RsaPrivateKey};

/// Parses a PEM-encoded RSA private key, accepting both the PKCS#1 and
/// PKCS#8 container formats.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|_| CryptoError::InvalidKey)
}

/// Exports the public half as a PEM SubjectPublicKeyInfo block, the form
/// browser clients feed into Web Crypto.
pub fn public_key_pem(key: &RsaPrivateKey) -> Result<String, CryptoError> {
    key.to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|_| CryptoError::InvalidKey)
}

/// Unwraps an RSA-OAEP-SHA256 envelope produced by a client that chose to
/// encrypt its bundle upload to the server.
pub fn decrypt_envelope(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    key.decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|_| CryptoError::Envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::RsaPublicKey;

    #[test]
    fn envelope_roundtrip() {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).expect("keygen");
        let public = RsaPublicKey::from(&key);
        let ciphertext = public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), b"bundle bytes")
            .expect("encrypt");
        let plaintext = decrypt_envelope(&key, &ciphertext).expect("decrypt");
        assert_eq!(plaintext, b"bundle bytes");
    }

    #[test]
    fn public_pem_is_spki() {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).expect("keygen");
        let pem = public_key_pem(&key).expect("pem");
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));
    }

    #[test]
    fn garbage_ciphertext_fails() {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).expect("keygen");
        assert!(decrypt_envelope(&key, &[0u8; 16]).is_err());
    }

    #[test]
    fn garbage_pem_fails() {
        assert!(private_key_from_pem("not a pem").is_err());
    }
}
