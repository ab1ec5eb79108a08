use thiserror::Error;

/// Outcome a registered [`crate::MessageCallback`] reports back to the
/// demuxer, or the demuxer produces itself while framing (spec §4.D step 3,
/// spec §7's "Transport/framing" error kinds).
#[derive(Debug, Error)]
pub enum DemuxError {
    /// Not enough bytes yet to decode a full body. The demuxer leaves the
    /// buffer untouched and retries on the next delivery.
    #[error("incomplete message, need more bytes")]
    Incomplete,

    /// The body failed to parse. `consumed` is how many bytes the parser
    /// identified as the malformed span; the demuxer drains exactly that
    /// many bytes (plus the leading varint) and keeps the stream alive.
    #[error("message parse error: {detail}")]
    Parsing { consumed: usize, detail: String },

    /// The leading varint decoded to a tag outside the closed
    /// [`osp_wire::MessageType`] enumeration. There is no way to know how
    /// many bytes the unrecognized body occupies, so this behaves like
    /// [`DemuxError::Incomplete`]: the buffer is kept and retried, in case a
    /// watch for a newer message type is registered before more bytes
    /// arrive that would otherwise parse correctly by coincidence.
    #[error("unknown message type tag {0}")]
    UnknownMessageType(u64),
}
