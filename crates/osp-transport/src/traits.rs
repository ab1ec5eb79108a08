//! The abstraction a concrete QUIC/TLS implementation fills in (spec §1
//! non-goal: "out of scope: a concrete QUIC/TLS transport implementation
//! ... only the abstraction it must expose is in scope").

use osp_wire::Endpoint;

use crate::types::{ConnectionHandle, StreamHandle, TransportError};

/// Per-connection multi-stream transport with asynchronous connect. Every
/// method here is a one-shot control call; completion is reported back to
/// [`crate::ProtocolConnectionSubstrate`] through its `on_*` methods, which
/// the transport implementation calls once the underlying work finishes
/// (spec §4.A: always from the single logical task-runner thread).
pub trait Transport: Send {
    /// Begin an outbound connection attempt. Exactly one of
    /// `ProtocolConnectionSubstrate::on_connection_established` or
    /// `on_connection_failed` must eventually be called with this
    /// `attempt_id`, unless [`Transport::cancel_connect`] is called first.
    fn start_connect(&mut self, endpoint: Endpoint, attempt_id: u64);

    /// Cancel a connection attempt already passed to `start_connect`. A
    /// no-op if it already completed.
    fn cancel_connect(&mut self, attempt_id: u64);

    /// Open a new stream on an already-established connection.
    fn open_stream(&mut self, connection: ConnectionHandle) -> Option<StreamHandle>;

    /// Write bytes to a stream. Buffered by the transport if the peer is
    /// slow (spec §4.E: no backpressure is surfaced here).
    fn write(&mut self, stream: StreamHandle, bytes: &[u8]) -> Result<(), TransportError>;

    /// Close a stream from the local side.
    fn close_stream(&mut self, stream: StreamHandle);
}

/// Delivered exactly once per [`Transport::start_connect`] call that isn't
/// cancelled first (spec §4.E: "the callback fires exactly once").
pub trait ConnectionRequestCallback: Send {
    fn on_connection_opened(&mut self, stream: StreamHandle);
    fn on_connection_failed(&mut self);
}

impl<F> ConnectionRequestCallback for F
where
    F: FnMut(Result<StreamHandle, ()>) + Send,
{
    fn on_connection_opened(&mut self, stream: StreamHandle) {
        self(Ok(stream));
    }
    fn on_connection_failed(&mut self) {
        self(Err(()));
    }
}
