//! Closed `u64`-tag enumeration of CBOR message schemas (spec §3, §6) and the
//! `varint(msg_type) || cbor(body)` framing helpers the demuxer builds on.

use thiserror::Error;

/// One tag per CBOR schema on the wire. The discriminants are part of the
/// wire format and must never be renumbered once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u64)]
pub enum MessageType {
    PresentationUrlAvailabilityRequest = 1,
    PresentationUrlAvailabilityResponse = 2,
    PresentationUrlAvailabilityEvent = 3,
    PresentationInitiationRequest = 4,
    PresentationInitiationResponse = 5,
    PresentationConnectionOpenRequest = 6,
    PresentationConnectionOpenResponse = 7,
    PresentationConnectionMessage = 8,
    PresentationConnectionCloseRequest = 9,
    PresentationConnectionCloseResponse = 10,
    PresentationConnectionCloseEvent = 11,
    PresentationTerminationRequest = 12,
    PresentationTerminationResponse = 13,
    PresentationTerminationEvent = 14,
}

impl MessageType {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    #[must_use]
    pub fn from_u64(tag: u64) -> Option<Self> {
        Some(match tag {
            1 => Self::PresentationUrlAvailabilityRequest,
            2 => Self::PresentationUrlAvailabilityResponse,
            3 => Self::PresentationUrlAvailabilityEvent,
            4 => Self::PresentationInitiationRequest,
            5 => Self::PresentationInitiationResponse,
            6 => Self::PresentationConnectionOpenRequest,
            7 => Self::PresentationConnectionOpenResponse,
            8 => Self::PresentationConnectionMessage,
            9 => Self::PresentationConnectionCloseRequest,
            10 => Self::PresentationConnectionCloseResponse,
            11 => Self::PresentationConnectionCloseEvent,
            12 => Self::PresentationTerminationRequest,
            13 => Self::PresentationTerminationResponse,
            14 => Self::PresentationTerminationEvent,
            _ => return None,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VarintError {
    #[error("varint truncated: need more bytes")]
    Incomplete,
    #[error("varint exceeds 64 bits")]
    Overflow,
}

/// Encode `value` as an LEB128 varint, appending to `out`.
pub fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a leading LEB128 varint from `buf`, returning the value and the
/// number of bytes consumed. Returns [`VarintError::Incomplete`] if `buf`
/// doesn't yet contain a full varint — the demuxer interprets this the same
/// way it interprets `CborIncompleteMessage` (spec §4.D): keep the bytes,
/// wait for more.
pub fn read_varint(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(VarintError::Overflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(VarintError::Incomplete)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrips_small_and_large_values() {
        for v in [0u64, 1, 127, 128, 300, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(v, &mut buf);
            let (decoded, consumed) = read_varint(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn varint_reports_incomplete_on_truncated_buffer() {
        let mut buf = Vec::new();
        write_varint(300, &mut buf);
        assert_eq!(read_varint(&buf[..1]), Err(VarintError::Incomplete));
    }

    #[test]
    fn message_type_round_trips_through_u64() {
        for mt in [
            MessageType::PresentationUrlAvailabilityRequest,
            MessageType::PresentationTerminationEvent,
        ] {
            assert_eq!(MessageType::from_u64(mt.as_u64()), Some(mt));
        }
        assert_eq!(MessageType::from_u64(9999), None);
    }
}
