//! An in-memory [`Transport`] double, shared across crates instead of each
//! one hand-rolling its own (grounded on `rt-test-utils`'s
//! `MockWsServer`/`MockWsClient` being one shared fake instead of a
//! per-caller copy).
//!
//! Connection attempts never complete on their own: callers drive
//! [`ProtocolConnectionSubstrate::on_connection_established`] /
//! `on_connection_failed` themselves, inspecting [`FakeTransport::attempts`]
//! to see what's pending. This matches the existing convention in every
//! crate's own tests, just without the duplicated struct.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use osp_transport::{ConnectionHandle, StreamHandle, Transport, TransportError};
use osp_wire::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub attempt_id: u64,
    pub endpoint: Endpoint,
}

#[derive(Default)]
struct Inner {
    next_stream: u64,
    open_streams: HashMap<StreamHandle, ConnectionHandle>,
    attempts: Vec<ConnectAttempt>,
    cancelled: Vec<u64>,
    writes: Vec<(StreamHandle, Vec<u8>)>,
    closed: Vec<StreamHandle>,
}

/// Cheap to clone; every clone shares the same recorded state, so a test can
/// hand one to [`osp_transport::ProtocolConnectionSubstrate::new`] and keep
/// another to inspect what happened.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<Inner>>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection attempts started since the last call, oldest first.
    #[must_use]
    pub fn take_attempts(&self) -> Vec<ConnectAttempt> {
        std::mem::take(&mut self.inner.lock().expect("poisoned").attempts)
    }

    #[must_use]
    pub fn cancelled_attempts(&self) -> Vec<u64> {
        self.inner.lock().expect("poisoned").cancelled.clone()
    }

    /// Bytes written since the last call, in write order.
    #[must_use]
    pub fn take_writes(&self) -> Vec<(StreamHandle, Vec<u8>)> {
        std::mem::take(&mut self.inner.lock().expect("poisoned").writes)
    }

    #[must_use]
    pub fn is_stream_open(&self, stream: StreamHandle) -> bool {
        self.inner.lock().expect("poisoned").open_streams.contains_key(&stream)
    }

    #[must_use]
    pub fn closed_streams(&self) -> Vec<StreamHandle> {
        self.inner.lock().expect("poisoned").closed.clone()
    }
}

impl Transport for FakeTransport {
    fn start_connect(&mut self, endpoint: Endpoint, attempt_id: u64) {
        self.inner
            .lock()
            .expect("poisoned")
            .attempts
            .push(ConnectAttempt { attempt_id, endpoint });
    }

    fn cancel_connect(&mut self, attempt_id: u64) {
        self.inner.lock().expect("poisoned").cancelled.push(attempt_id);
    }

    fn open_stream(&mut self, connection: ConnectionHandle) -> Option<StreamHandle> {
        let mut inner = self.inner.lock().expect("poisoned");
        let stream = StreamHandle(inner.next_stream);
        inner.next_stream += 1;
        inner.open_streams.insert(stream, connection);
        Some(stream)
    }

    fn write(&mut self, stream: StreamHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().expect("poisoned");
        if !inner.open_streams.contains_key(&stream) {
            return Err(TransportError::StreamClosed);
        }
        inner.writes.push((stream, bytes.to_vec()));
        Ok(())
    }

    fn close_stream(&mut self, stream: StreamHandle) {
        let mut inner = self.inner.lock().expect("poisoned");
        inner.open_streams.remove(&stream);
        inner.closed.push(stream);
    }
}
