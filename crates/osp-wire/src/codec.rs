//! Opaque per-message CBOR codec (spec §1 non-goal: "CBOR codec, treated as
//! an opaque encode/decode function per message type"). Backed by
//! `serde_cbor`, the corpus-adjacent CBOR crate, so the workspace depends on
//! a real codec rather than a hand-rolled stub.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("cbor encode failed: {0}")]
    Encode(#[source] serde_cbor::Error),
    #[error("cbor decode failed: {0}")]
    Decode(#[source] serde_cbor::Error),
}

/// Encode `body` to CBOR bytes. Framing (the leading varint tag) is the
/// demuxer's concern, not this function's.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, WireError> {
    serde_cbor::to_vec(body).map_err(WireError::Encode)
}

/// Decode a CBOR-encoded body from `bytes`. `serde_cbor` reports how many
/// bytes of `bytes` it actually consumed; callers that parse a body out of a
/// larger buffer should use [`decode_body_prefix`] instead.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    serde_cbor::from_slice(bytes).map_err(WireError::Decode)
}

/// Decode one CBOR value from the front of `bytes`, returning the value and
/// the number of bytes it occupied. Used by the demuxer, which must know how
/// much of the stream buffer to advance past (spec §4.D step 4).
pub fn decode_body_prefix<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), WireError> {
    let mut deserializer = serde_cbor::Deserializer::from_slice(bytes);
    let value = T::deserialize(&mut deserializer).map_err(WireError::Decode)?;
    Ok((value, deserializer.byte_offset()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{PresentationTerminationEvent, TerminationReason, TerminationSource};

    #[test]
    fn encode_decode_round_trips() {
        let event = PresentationTerminationEvent {
            presentation_id: "p-0123456789abcdef".to_owned(),
            reason: TerminationReason::UserTerminated,
            source: TerminationSource::Controller,
        };
        let bytes = encode_body(&event).unwrap();
        let decoded: PresentationTerminationEvent = decode_body(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn decode_body_prefix_reports_consumed_length() {
        let event = PresentationTerminationEvent {
            presentation_id: "p-0123456789abcdef".to_owned(),
            reason: TerminationReason::ReceiverShuttingDown,
            source: TerminationSource::Receiver,
        };
        let mut bytes = encode_body(&event).unwrap();
        let body_len = bytes.len();
        bytes.extend_from_slice(b"trailing-garbage-from-the-next-message");

        let (decoded, consumed): (PresentationTerminationEvent, usize) =
            decode_body_prefix(&bytes).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(consumed, body_len);
    }
}
