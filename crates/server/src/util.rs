use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Encodes opaque key material for JSON transport.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(value: &str) -> Result<Vec<u8>, &'static str> {
    STANDARD.decode(value).map_err(|_| "invalid base64")
}

/// Decodes a base64 field that must carry exactly `expected_len` bytes.
pub fn decode_opaque(value: &str, expected_len: usize) -> Result<Vec<u8>, &'static str> {
    let bytes = decode_base64(value)?;
    if bytes.len() != expected_len {
        return Err("invalid key length");
    }
    Ok(bytes)
}

/// Extracts a query parameter from a raw query string. Values are taken
/// verbatim; the callers only read token and label parameters that never
/// carry percent escapes.
pub fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        if name == key {
            return Some(parts.next().unwrap_or(""));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip() {
        let data = [1u8, 2, 3, 255];
        let encoded = encode_base64(&data);
        assert_eq!(decode_base64(&encoded).unwrap(), data);
    }

    #[test]
    fn opaque_length_is_enforced() {
        let encoded = encode_base64(&[0u8; 31]);
        assert!(decode_opaque(&encoded, 32).is_err());
        let encoded = encode_base64(&[0u8; 32]);
        assert_eq!(decode_opaque(&encoded, 32).unwrap().len(), 32);
    }

    #[test]
    fn query_param_lookup() {
        let query = Some("token=abc.def&device=laptop");
        assert_eq!(query_param(query, "token"), Some("abc.def"));
        assert_eq!(query_param(query, "device"), Some("laptop"));
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(query_param(None, "token"), None);
    }
}
