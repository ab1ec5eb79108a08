use osp_wire::codec::WireError;
use thiserror::Error;

/// Request-lifecycle error kinds (spec §7 "Request lifecycle"), surfaced to
/// the calling delegate rather than unwound as a panic.
#[derive(Debug, Error)]
pub enum PresentationError {
    #[error("request was cancelled before it completed")]
    RequestCancelled,
    #[error("no presentation found for this id")]
    NoPresentationFound,
    #[error("presentation id is invalid: {0}")]
    InvalidPresentationId(#[source] osp_wire::PresentationIdError),
    #[error("unknown presentation id")]
    UnknownPresentationId,
    #[error("unknown message type")]
    UnknownMessageType,
    #[error("unknown error starting the presentation")]
    UnknownStartError,
    #[error("presentation initiation failed: {0}")]
    InitiationFailed(String),
    #[error("failed to encode or decode a message body: {0}")]
    Wire(#[source] WireError),
    #[error("write to the underlying stream failed: {0}")]
    Write(String),
}
