use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Upper bound for a single serialized envelope, newline excluded.
pub const MAX_ENVELOPE_LEN: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    InvalidJson,
    EnvelopeTooLarge,
    UnexpectedEof,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid envelope json"),
            Self::EnvelopeTooLarge => write!(f, "envelope exceeds limits"),
            Self::UnexpectedEof => write!(f, "unexpected end of envelope"),
        }
    }
}

impl Error for CodecError {}

/// Frames received from a client. The relay payload is opaque; the server
/// forwards it without interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Message { to: Uuid, payload: String },
    Ping,
    /// Any frame type this codec does not recognize. Receivers log and
    /// ignore these instead of dropping the connection.
    #[serde(other)]
    Unknown,
}

/// Frames written to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Message {
        from: Uuid,
        payload: String,
        timestamp: i64,
    },
    Pong,
    Notice {
        text: String,
    },
}

impl ClientEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_line(self)
    }

    /// Parses one already-framed line.
    pub fn parse(line: &[u8]) -> Result<Self, CodecError> {
        parse_line(line)
    }

    /// Attempts to decode one envelope from a contiguous buffer, returning
    /// the envelope and the number of bytes consumed.
    pub fn decode(buffer: &[u8]) -> Result<(Self, usize), CodecError> {
        decode_line(buffer)
    }
}

impl ServerEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_line(self)
    }

    pub fn parse(line: &[u8]) -> Result<Self, CodecError> {
        parse_line(line)
    }

    pub fn decode(buffer: &[u8]) -> Result<(Self, usize), CodecError> {
        decode_line(buffer)
    }
}

/// Extracts the next newline-terminated line from a buffer.
///
/// Returns the line slice (terminator excluded) and the total number of
/// bytes to drain. `Ok(None)` means the buffer holds an incomplete frame.
pub fn next_line(buffer: &[u8]) -> Result<Option<(&[u8], usize)>, CodecError> {
    match buffer.iter().position(|byte| *byte == b'\n') {
        Some(index) => {
            if index > MAX_ENVELOPE_LEN {
                return Err(CodecError::EnvelopeTooLarge);
            }
            let mut line = &buffer[..index];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            Ok(Some((line, index + 1)))
        }
        None => {
            if buffer.len() > MAX_ENVELOPE_LEN {
                return Err(CodecError::EnvelopeTooLarge);
            }
            Ok(None)
        }
    }
}

fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut encoded = serde_json::to_vec(value).map_err(|_| CodecError::InvalidJson)?;
    if encoded.len() > MAX_ENVELOPE_LEN {
        return Err(CodecError::EnvelopeTooLarge);
    }
    encoded.push(b'\n');
    Ok(encoded)
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Result<T, CodecError> {
    if line.len() > MAX_ENVELOPE_LEN {
        return Err(CodecError::EnvelopeTooLarge);
    }
    serde_json::from_slice(line).map_err(|_| CodecError::InvalidJson)
}

fn decode_line<T: DeserializeOwned>(buffer: &[u8]) -> Result<(T, usize), CodecError> {
    match next_line(buffer)? {
        Some((line, consumed)) => Ok((parse_line(line)?, consumed)),
        None => Err(CodecError::UnexpectedEof),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_roundtrip() {
        let to = Uuid::new_v4();
        let envelope = ClientEnvelope::Message {
            to,
            payload: "b2s=".to_string(),
        };
        let encoded = envelope.encode().unwrap();
        assert_eq!(*encoded.last().unwrap(), b'\n');
        let (decoded, consumed) = ClientEnvelope::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn server_roundtrip() {
        let from = Uuid::new_v4();
        let envelope = ServerEnvelope::Message {
            from,
            payload: "opaque".to_string(),
            timestamp: 1_700_000_000,
        };
        let encoded = envelope.encode().unwrap();
        let (decoded, _) = ServerEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn ping_pong_tags() {
        let encoded = ClientEnvelope::Ping.encode().unwrap();
        assert_eq!(encoded, b"{\"type\":\"ping\"}\n".to_vec());
        let encoded = ServerEnvelope::Pong.encode().unwrap();
        assert_eq!(encoded, b"{\"type\":\"pong\"}\n".to_vec());
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let (decoded, _) = ClientEnvelope::decode(b"{\"type\":\"typing\"}\n").unwrap();
        assert_eq!(decoded, ClientEnvelope::Unknown);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = ClientEnvelope::decode(b"{\"type\":\n").unwrap_err();
        assert_eq!(err, CodecError::InvalidJson);
    }

    #[test]
    fn partial_frame_reports_eof() {
        let err = ClientEnvelope::decode(b"{\"type\":\"ping\"}").unwrap_err();
        assert_eq!(err, CodecError::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut oversized = vec![b'x'; MAX_ENVELOPE_LEN + 1];
        oversized.push(b'\n');
        let err = ClientEnvelope::decode(&oversized).unwrap_err();
        assert_eq!(err, CodecError::EnvelopeTooLarge);
        let unterminated = vec![b'x'; MAX_ENVELOPE_LEN + 1];
        let err = ClientEnvelope::decode(&unterminated).unwrap_err();
        assert_eq!(err, CodecError::EnvelopeTooLarge);
    }

    #[test]
    fn consumes_one_frame_at_a_time() {
        let mut buffer = ClientEnvelope::Ping.encode().unwrap();
        let second = ClientEnvelope::Message {
            to: Uuid::new_v4(),
            payload: "x".to_string(),
        };
        buffer.extend_from_slice(&second.encode().unwrap());
        let (first, consumed) = ClientEnvelope::decode(&buffer).unwrap();
        assert_eq!(first, ClientEnvelope::Ping);
        let (next, _) = ClientEnvelope::decode(&buffer[consumed..]).unwrap();
        assert_eq!(next, second);
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let (line, consumed) = next_line(b"{\"type\":\"ping\"}\r\nrest").unwrap().unwrap();
        assert_eq!(line, b"{\"type\":\"ping\"}");
        assert_eq!(consumed, 17);
    }
}
