use crate::decode_fixed;
use blake3::Hasher;
use rand::RngCore;
use rand::rngs::OsRng;

pub const DEFAULT_CODE_DIGITS: usize = 6;

const SALT_LEN: usize = 16;

/// Generates a numeric one-time code together with the salted digest to
/// store in its place. The raw code leaves the process only through the
/// notification sink.
pub fn generate_code(digits: usize) -> (String, String) {
    let digits = digits.max(1);
    let mut code = String::with_capacity(digits);
    for _ in 0..digits {
        let digit = (OsRng.next_u32() % 10) as u8;
        code.push(char::from(b'0' + digit));
    }
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let digest = digest_code(&salt, &code);
    let stored = format!("{}:{}", hex::encode(salt), hex::encode(digest.as_bytes()));
    (code, stored)
}

/// Checks a claimed code against a stored salted digest.
///
/// The digest comparison goes through `blake3::Hash`, whose equality is
/// constant-time. Any shape mismatch in the stored value yields false.
pub fn verify_code(stored: &str, claimed: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once(':') else {
        return false;
    };
    let Some(salt) = decode_fixed::<SALT_LEN>(salt_hex) else {
        return false;
    };
    let Some(expected) = decode_fixed::<32>(digest_hex) else {
        return false;
    };
    digest_code(&salt, claimed) == blake3::Hash::from(expected)
}

fn digest_code(salt: &[u8; SALT_LEN], code: &str) -> blake3::Hash {
    let mut hasher = Hasher::new();
    hasher.update(salt);
    hasher.update(code.as_bytes());
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_verifies() {
        let (code, stored) = generate_code(DEFAULT_CODE_DIGITS);
        assert_eq!(code.len(), DEFAULT_CODE_DIGITS);
        assert!(code.bytes().all(|b| b.is_ascii_digit()));
        assert!(verify_code(&stored, &code));
    }

    #[test]
    fn wrong_code_fails() {
        let (code, stored) = generate_code(DEFAULT_CODE_DIGITS);
        let wrong = if code == "000000" { "000001" } else { "000000" };
        assert!(!verify_code(&stored, wrong));
    }

    #[test]
    fn malformed_stored_value_fails_closed() {
        assert!(!verify_code("", "123456"));
        assert!(!verify_code("nosalt", "123456"));
        assert!(!verify_code("ab:cd", "123456"));
    }

    #[test]
    fn salts_differ_between_codes() {
        let (_, first) = generate_code(DEFAULT_CODE_DIGITS);
        let (_, second) = generate_code(DEFAULT_CODE_DIGITS);
        assert_ne!(first, second);
    }
}
