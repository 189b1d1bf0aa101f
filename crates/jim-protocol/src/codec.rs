//! Codec for encoding and decoding JIM frames.
//!
//! A frame is one JSON object encoded as UTF-8. JSON values are
//! self-delimiting, so frames need no length prefix: the streaming decoder
//! buffers partial reads and splits frames that arrive coalesced.

use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum frame size in bytes.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Payload is not valid JSON.
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Payload is valid JSON but not a record.
    #[error("Frame is not a record")]
    NotARecord,

    /// Record does not match any envelope.
    #[error("Invalid envelope: {0}")]
    Invalid(#[source] serde_json::Error),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Whether the peer can keep its connection after this error.
    ///
    /// Only a well-formed record with a bad shape qualifies; anything else
    /// leaves the stream in an unknown state.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::Invalid(_))
    }
}

/// Encode an envelope to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Encode an envelope into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = encode(envelope)?;
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Decode exactly one frame.
///
/// # Errors
///
/// Returns an error if the data is too large, not a JSON record, or not an
/// envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let value: Value = serde_json::from_slice(data).map_err(ProtocolError::Malformed)?;
    into_envelope(value)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(envelope))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error. An
/// [`ProtocolError::Invalid`] frame is consumed, so decoding can resume.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    let (parsed, consumed) = {
        let mut stream = serde_json::Deserializer::from_slice(&buf[..]).into_iter::<Value>();
        let parsed = stream.next();
        (parsed, stream.byte_offset())
    };

    match parsed {
        None => {
            // Only whitespace was buffered.
            buf.clear();
            Ok(None)
        }
        Some(Ok(value)) => {
            buf.advance(consumed);
            if consumed > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(consumed));
            }
            into_envelope(value).map(Some)
        }
        Some(Err(e)) if e.is_eof() => {
            if buf.len() > MAX_FRAME_SIZE {
                Err(ProtocolError::FrameTooLarge(buf.len()))
            } else {
                Ok(None)
            }
        }
        Some(Err(e)) => Err(ProtocolError::Malformed(e)),
    }
}

fn into_envelope(value: Value) -> Result<Envelope, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::NotARecord);
    }
    serde_json::from_value(value).map_err(ProtocolError::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Request, Response};

    #[test]
    fn test_encode_decode_roundtrip() {
        let envelopes = vec![
            Envelope::presence("alice"),
            Envelope::message("alice", "bob", "Hello, world!"),
            Envelope::exit("alice"),
            Envelope::get_contacts("alice"),
            Envelope::add_contact("alice", "bob"),
            Envelope::remove_contact("alice", "bob"),
            Envelope::get_users("alice"),
            Envelope::from(Response::ok()),
            Envelope::from(Response::accepted(vec!["alice".into(), "bob".into()])),
            Envelope::from(Response::bad_request("Bad Request")),
        ];

        for envelope in envelopes {
            let encoded = encode(&envelope).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(envelope, decoded);
        }
    }

    #[test]
    fn test_decode_non_record() {
        for payload in [&b"[1, 2, 3]"[..], b"\"presence\"", b"42", b"null"] {
            match decode(payload) {
                Err(ProtocolError::NotARecord) => {}
                other => panic!("Expected NotARecord error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_garbage() {
        match decode(b"{not json") {
            Err(ProtocolError::Malformed(_)) => {}
            other => panic!("Expected Malformed error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_action_is_recoverable() {
        let err = decode(br#"{"action": "shout", "time": 1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Invalid(_)));
        assert!(err.is_recoverable());
        assert!(!ProtocolError::NotARecord.is_recoverable());
    }

    #[test]
    fn test_frame_too_large() {
        let envelope = Envelope::message("alice", "bob", "x".repeat(MAX_FRAME_SIZE));

        match encode(&envelope) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode_coalesced() {
        let first = Envelope::presence("alice");
        let second = Envelope::message("alice", "bob", "hi");

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        assert_eq!(decode_from(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
        assert_eq!(decode_from(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_streaming_decode_partial() {
        let envelope = Envelope::get_users("alice");
        let encoded = encode(&envelope).unwrap();
        let (head, tail) = encoded.split_at(encoded.len() / 2);

        let mut buf = BytesMut::from(head);
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.extend_from_slice(tail);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(envelope));
    }

    #[test]
    fn test_streaming_decode_resumes_after_invalid() {
        let mut buf = BytesMut::from(&br#"{"action": "shout"}{"response": 200}"#[..]);

        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::Invalid(_))
        ));
        assert_eq!(
            decode_from(&mut buf).unwrap(),
            Some(Envelope::Response(Response::ok()))
        );
    }

    #[test]
    fn test_streaming_decode_oversized_partial() {
        let mut buf = BytesMut::from(&b"{\"action\": \"message\", \"message_text\": \""[..]);
        buf.extend_from_slice("x".repeat(MAX_FRAME_SIZE).as_bytes());

        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_request_payload_survives_roundtrip() {
        let request = Request::Message {
            from: "alice".into(),
            to: "bob".into(),
            time: 1_700_000_000u64.into(),
            text: "{\"nested\": true}".into(),
        };
        let decoded = decode(&encode(&request.clone().into()).unwrap()).unwrap();
        assert_eq!(decoded, Envelope::Request(request));
    }
}
