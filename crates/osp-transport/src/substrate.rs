//! [`ProtocolConnectionSubstrate`]: endpoint/connection bookkeeping over an
//! opaque [`Transport`] (spec §4.E).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use osp_wire::{Endpoint, EndpointId};

use crate::traits::{ConnectionRequestCallback, Transport};
use crate::types::{ConnectionHandle, StreamHandle, TransportError};

struct PendingConnectionData {
    attempt_id: u64,
    callbacks: Vec<(u64, Box<dyn ConnectionRequestCallback>)>,
}

struct ConnectionRecord {
    handle: ConnectionHandle,
    endpoint: Endpoint,
}

struct Inner<T: Transport> {
    transport: T,
    endpoint_map: HashMap<Endpoint, EndpointId>,
    next_endpoint_id: u64,
    connections: HashMap<EndpointId, ConnectionRecord>,
    connection_by_handle: HashMap<ConnectionHandle, EndpointId>,
    pending_connections: HashMap<Endpoint, PendingConnectionData>,
    next_request_id: u64,
    next_attempt_id: u64,
    next_endpoint_request_id: HashMap<EndpointId, u64>,
    stream_closed_watches: HashMap<StreamHandle, Box<dyn FnOnce() + Send>>,
}

/// Owns the endpoint/connection/pending-connection maps from
/// `original_source/api/impl/quic/quic_client.h` and `quic_server.h`, over
/// an opaque [`Transport`]. Cheap to clone (shared `Arc<Mutex<_>>`), matching
/// `osp_demux::MessageDemuxer`'s sharing model.
pub struct ProtocolConnectionSubstrate<T: Transport> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Transport> Clone for ProtocolConnectionSubstrate<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Scoped handle for an in-flight [`ProtocolConnectionSubstrate::connect`]
/// call. Dropping it before completion cancels the callback (spec §4.E);
/// if it was the last callback waiting on that connection attempt, the
/// attempt itself is cancelled on the transport too.
pub struct ConnectRequest {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for ConnectRequest {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T: Transport> Default for ProtocolConnectionSubstrate<T>
where
    T: Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Transport> ProtocolConnectionSubstrate<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                transport,
                endpoint_map: HashMap::new(),
                next_endpoint_id: 1,
                connections: HashMap::new(),
                connection_by_handle: HashMap::new(),
                pending_connections: HashMap::new(),
                next_request_id: 1,
                next_attempt_id: 1,
                next_endpoint_request_id: HashMap::new(),
                stream_closed_watches: HashMap::new(),
            })),
        }
    }

    /// Look up or assign the stable [`EndpointId`] for `endpoint` (spec
    /// §4.E: "the first observed peer address gets a fresh id").
    pub fn endpoint_id_for(&self, endpoint: Endpoint) -> EndpointId {
        let mut inner = self.inner.lock().expect("substrate mutex poisoned");
        if let Some(&id) = inner.endpoint_map.get(&endpoint) {
            return id;
        }
        let id = EndpointId::new(inner.next_endpoint_id);
        inner.next_endpoint_id += 1;
        inner.endpoint_map.insert(endpoint, id);
        id
    }

    /// The monotonically increasing per-endpoint request-id generator
    /// handed to the request/response handler (spec §4.E "RequestIds").
    pub fn next_request_id(&self, endpoint_id: EndpointId) -> u64 {
        let mut inner = self.inner.lock().expect("substrate mutex poisoned");
        let counter = inner.next_endpoint_request_id.entry(endpoint_id).or_insert(1);
        let id = *counter;
        *counter += 1;
        id
    }

    /// `CreateProtocolConnection(endpoint_id)` (spec §4.E): a new stream on
    /// an already-established connection, or `None` if there isn't one.
    pub fn create_protocol_connection(&self, endpoint_id: EndpointId) -> Option<StreamHandle> {
        let mut inner = self.inner.lock().expect("substrate mutex poisoned");
        let handle = inner.connections.get(&endpoint_id)?.handle;
        inner.transport.open_stream(handle)
    }

    /// `Connect(endpoint, callback)` (spec §4.E): reuse an existing
    /// connection by opening a new stream on it immediately, or start (or
    /// join) an outbound connection attempt.
    pub fn connect(
        &self,
        endpoint: Endpoint,
        mut callback: Box<dyn ConnectionRequestCallback>,
    ) -> ConnectRequest {
        let mut inner = self.inner.lock().expect("substrate mutex poisoned");

        if let Some(&endpoint_id) = inner.endpoint_map.get(&endpoint) {
            if let Some(record) = inner.connections.get(&endpoint_id) {
                let handle = record.handle;
                if let Some(stream) = inner.transport.open_stream(handle) {
                    drop(inner);
                    callback.on_connection_opened(stream);
                    return ConnectRequest { cancel: None };
                }
            }
        }

        let request_id = inner.next_request_id;
        inner.next_request_id += 1;

        if let Some(pending) = inner.pending_connections.get_mut(&endpoint) {
            pending.callbacks.push((request_id, callback));
        } else {
            let attempt_id = inner.next_attempt_id;
            inner.next_attempt_id += 1;
            inner.pending_connections.insert(
                endpoint,
                PendingConnectionData {
                    attempt_id,
                    callbacks: vec![(request_id, callback)],
                },
            );
            inner.transport.start_connect(endpoint, attempt_id);
        }

        let weak = Arc::downgrade(&self.inner);
        ConnectRequest {
            cancel: Some(Box::new(move || cancel_connect_request(&weak, endpoint, request_id))),
        }
    }

    /// Write to a stream (spec §4.E: buffered by the transport, no
    /// backpressure surfaced here).
    pub fn write(&self, stream: StreamHandle, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner
            .lock()
            .expect("substrate mutex poisoned")
            .transport
            .write(stream, bytes)
    }

    /// Register a one-shot callback for when `stream` closes (spec §4.E
    /// `Stream::Observer::OnStreamClosed`).
    pub fn watch_stream_closed(&self, stream: StreamHandle, on_closed: impl FnOnce() + Send + 'static) {
        self.inner
            .lock()
            .expect("substrate mutex poisoned")
            .stream_closed_watches
            .insert(stream, Box::new(on_closed));
    }

    /// Called by the transport once an outbound attempt succeeds. Assigns
    /// the endpoint's id if this is the first connection to it, stores the
    /// connection, and drains every callback waiting on this attempt by
    /// opening one fresh stream per caller.
    pub fn on_connection_established(
        &self,
        attempt_id: u64,
        endpoint: Endpoint,
        connection: ConnectionHandle,
    ) -> EndpointId {
        let mut inner = self.inner.lock().expect("substrate mutex poisoned");

        let endpoint_id = match inner.endpoint_map.get(&endpoint) {
            Some(&id) => id,
            None => {
                let id = EndpointId::new(inner.next_endpoint_id);
                inner.next_endpoint_id += 1;
                inner.endpoint_map.insert(endpoint, id);
                id
            }
        };
        inner.connections.insert(
            endpoint_id,
            ConnectionRecord { handle: connection, endpoint },
        );
        inner.connection_by_handle.insert(connection, endpoint_id);

        let pending = inner
            .pending_connections
            .remove(&endpoint)
            .filter(|p| p.attempt_id == attempt_id);
        if let Some(pending) = pending {
            for (_, mut callback) in pending.callbacks {
                match inner.transport.open_stream(connection) {
                    Some(stream) => callback.on_connection_opened(stream),
                    None => callback.on_connection_failed(),
                }
            }
        }
        endpoint_id
    }

    /// Called by the transport once an outbound attempt fails. Fires
    /// `on_connection_failed` for every caller still waiting on it.
    pub fn on_connection_failed(&self, attempt_id: u64, endpoint: Endpoint) {
        let mut inner = self.inner.lock().expect("substrate mutex poisoned");
        let pending = inner
            .pending_connections
            .remove(&endpoint)
            .filter(|p| p.attempt_id == attempt_id);
        if let Some(pending) = pending {
            for (_, mut callback) in pending.callbacks {
                callback.on_connection_failed();
            }
        }
    }

    /// Called by the transport when `stream` closes, from either side.
    pub fn on_stream_closed(&self, stream: StreamHandle) {
        let watch = self
            .inner
            .lock()
            .expect("substrate mutex poisoned")
            .stream_closed_watches
            .remove(&stream);
        if let Some(on_closed) = watch {
            on_closed();
        }
    }

    /// Called by the transport when the underlying connection itself is
    /// gone. Drops the connection record so a later `connect` to the same
    /// endpoint starts a fresh attempt.
    pub fn on_connection_closed(&self, connection: ConnectionHandle) {
        let mut inner = self.inner.lock().expect("substrate mutex poisoned");
        if let Some(endpoint_id) = inner.connection_by_handle.remove(&connection) {
            inner.connections.remove(&endpoint_id);
        }
    }

    #[must_use]
    pub fn is_connected(&self, endpoint_id: EndpointId) -> bool {
        self.inner
            .lock()
            .expect("substrate mutex poisoned")
            .connections
            .contains_key(&endpoint_id)
    }

    #[must_use]
    pub fn connected_peer(&self, endpoint_id: EndpointId) -> Option<Endpoint> {
        self.inner
            .lock()
            .expect("substrate mutex poisoned")
            .connections
            .get(&endpoint_id)
            .map(|record| record.endpoint)
    }
}

fn cancel_connect_request<T: Transport>(
    weak: &Weak<Mutex<Inner<T>>>,
    endpoint: Endpoint,
    request_id: u64,
) {
    let Some(inner_arc) = weak.upgrade() else {
        return;
    };
    let mut inner = inner_arc.lock().expect("substrate mutex poisoned");
    let Some(pending) = inner.pending_connections.get_mut(&endpoint) else {
        return;
    };
    pending.callbacks.retain(|(id, _)| *id != request_id);
    if pending.callbacks.is_empty() {
        let attempt_id = pending.attempt_id;
        inner.pending_connections.remove(&endpoint);
        inner.transport.cancel_connect(attempt_id);
    }
}
