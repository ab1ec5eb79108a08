//! Opaque handles the substrate hands out; the underlying `Transport` fills
//! in what they mean (spec §4.E).

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream is closed")]
    StreamClosed,
    #[error("no connection exists for this endpoint")]
    NoConnection,
    #[error("transport error: {0}")]
    Other(String),
}
