//! [`ConnectionManager`]: routes the four connection-scoped message types
//! to the right [`Connection`] (spec §4.H). Grounded on
//! `original_source/api/impl/presentation/presentation_connection.cc`'s
//! `ConnectionManager::OnStreamMessage`, which registers exactly four
//! default watches — `Message`, `CloseRequest`, `CloseResponse`,
//! `CloseEvent` — deliberately *not* `ConnectionOpenRequest/Response`,
//! whose request/response flow the original itself leaves unimplemented.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use osp_demux::{DemuxError, MessageCallback, MessageWatch};
use osp_transport::StreamHandle;
use osp_wire::codec::{decode_body_prefix, encode_body};
use osp_wire::{
    EndpointId, MessageType, PresentationConnectionCloseEvent, PresentationConnectionCloseRequest,
    PresentationConnectionCloseResponse, PresentationConnectionMessage, write_varint,
};

use crate::connection::ConnectionRef;
use crate::types::CloseReason;

#[derive(Clone)]
pub struct ConnectionManagerIo {
    pub set_default_watch: Arc<dyn Fn(MessageType, MessageCallback) -> MessageWatch + Send + Sync>,
    pub write: Arc<dyn Fn(StreamHandle, &[u8]) -> Result<(), String> + Send + Sync>,
    pub open_stream: Arc<dyn Fn(EndpointId) -> Option<StreamHandle> + Send + Sync>,
}

struct Inner {
    connections: HashMap<String, HashMap<u64, ConnectionRef>>,
}

pub struct ConnectionManager {
    inner: Arc<Mutex<Inner>>,
    _message_watch: MessageWatch,
    _close_request_watch: MessageWatch,
    _close_response_watch: MessageWatch,
    _close_event_watch: MessageWatch,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(io: ConnectionManagerIo) -> Self {
        let inner = Arc::new(Mutex::new(Inner { connections: HashMap::new() }));

        let message_watch = {
            let inner = inner.clone();
            let callback: MessageCallback = Box::new(move |_endpoint, _msg_type, body| {
                let (message, consumed): (PresentationConnectionMessage, usize) = decode_prefix(body)?;
                let guard = inner.lock().expect("connection manager mutex poisoned");
                if let Some(conn) = lookup(&guard, &message.presentation_id, message.connection_id) {
                    conn.lock().expect("connection mutex poisoned").on_message(message.payload);
                } else {
                    tracing::warn!(presentation_id = %message.presentation_id, connection_id = message.connection_id, "message for unknown connection, ignoring");
                }
                Ok(consumed)
            });
            (io.set_default_watch)(MessageType::PresentationConnectionMessage, callback)
        };

        let close_request_watch = {
            let inner = inner.clone();
            let io = io.clone();
            let callback: MessageCallback = Box::new(move |endpoint, _msg_type, body| {
                let (request, consumed): (PresentationConnectionCloseRequest, usize) = decode_prefix(body)?;
                let found = {
                    let guard = inner.lock().expect("connection manager mutex poisoned");
                    lookup(&guard, &request.presentation_id, request.connection_id).cloned()
                };
                if let Some(conn) = found {
                    conn.lock().expect("connection mutex poisoned").on_closed_by_remote();
                    let response = PresentationConnectionCloseResponse {
                        request_id: request.request_id,
                        presentation_id: request.presentation_id,
                        connection_id: request.connection_id,
                    };
                    reply(&io, endpoint, MessageType::PresentationConnectionCloseResponse, &response);
                } else {
                    tracing::warn!(presentation_id = %request.presentation_id, connection_id = request.connection_id, "close request for unknown connection, ignoring");
                }
                Ok(consumed)
            });
            (io.set_default_watch)(MessageType::PresentationConnectionCloseRequest, callback)
        };

        let close_response_watch = {
            let callback: MessageCallback = Box::new(move |_endpoint, _msg_type, body| {
                let (response, consumed): (PresentationConnectionCloseResponse, usize) = decode_prefix(body)?;
                tracing::debug!(presentation_id = %response.presentation_id, connection_id = response.connection_id, "close response received");
                Ok(consumed)
            });
            (io.set_default_watch)(MessageType::PresentationConnectionCloseResponse, callback)
        };

        let close_event_watch = {
            let inner = inner.clone();
            let callback: MessageCallback = Box::new(move |_endpoint, _msg_type, body| {
                let (event, consumed): (PresentationConnectionCloseEvent, usize) = decode_prefix(body)?;
                let guard = inner.lock().expect("connection manager mutex poisoned");
                if let Some(conn) = lookup(&guard, &event.presentation_id, event.connection_id) {
                    conn.lock().expect("connection mutex poisoned").on_closed_by_remote();
                } else {
                    tracing::warn!(presentation_id = %event.presentation_id, connection_id = event.connection_id, "close event for unknown connection, ignoring");
                }
                Ok(consumed)
            });
            (io.set_default_watch)(MessageType::PresentationConnectionCloseEvent, callback)
        };

        Self {
            inner,
            _message_watch: message_watch,
            _close_request_watch: close_request_watch,
            _close_response_watch: close_response_watch,
            _close_event_watch: close_event_watch,
        }
    }

    pub fn add_connection(&self, conn: ConnectionRef) {
        let (presentation_id, connection_id) = {
            let conn = conn.lock().expect("connection mutex poisoned");
            (conn.presentation_id().as_str().to_owned(), conn.connection_id())
        };
        self.inner
            .lock()
            .expect("connection manager mutex poisoned")
            .connections
            .entry(presentation_id)
            .or_default()
            .insert(connection_id, conn);
    }

    pub fn remove_connection(&self, presentation_id: &str, connection_id: u64) -> Option<ConnectionRef> {
        let mut inner = self.inner.lock().expect("connection manager mutex poisoned");
        let removed = inner.connections.get_mut(presentation_id)?.remove(&connection_id);
        if inner.connections.get(presentation_id).is_some_and(HashMap::is_empty) {
            inner.connections.remove(presentation_id);
        }
        removed
    }

    pub fn connections_for(&self, presentation_id: &str) -> Vec<ConnectionRef> {
        self.inner
            .lock()
            .expect("connection manager mutex poisoned")
            .connections
            .get(presentation_id)
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Terminates and drops every connection under `presentation_id` (spec
    /// §4.H `OnPresentationTerminated`: "for every Connection under `id`,
    /// invoke `Connection::OnTerminated`").
    pub fn terminate_presentation(&self, presentation_id: &str) {
        let connections = {
            let mut inner = self.inner.lock().expect("connection manager mutex poisoned");
            inner.connections.remove(presentation_id).unwrap_or_default()
        };
        for conn in connections.into_values() {
            conn.lock().expect("connection mutex poisoned").on_terminated();
        }
    }

    /// `Connection::Close(reason)` plus bookkeeping removal, for the owner
    /// that decided to close a connection it still holds.
    pub fn close_connection(&self, presentation_id: &str, connection_id: u64, reason: CloseReason) {
        if let Some(conn) = self.remove_connection(presentation_id, connection_id) {
            let _ = conn.lock().expect("connection mutex poisoned").close(reason);
        }
    }
}

fn lookup<'a>(inner: &'a Inner, presentation_id: &str, connection_id: u64) -> Option<&'a ConnectionRef> {
    inner.connections.get(presentation_id)?.get(&connection_id)
}

fn decode_prefix<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<(T, usize), DemuxError> {
    decode_body_prefix(body).map_err(|err| DemuxError::Parsing {
        consumed: body.len(),
        detail: err.to_string(),
    })
}

fn reply<T: serde::Serialize>(io: &ConnectionManagerIo, endpoint: EndpointId, msg_type: MessageType, message: &T) {
    let Some(stream) = (io.open_stream)(endpoint) else {
        tracing::warn!(?endpoint, "no connection available to reply on");
        return;
    };
    let Ok(body) = encode_body(message) else {
        tracing::warn!(?msg_type, "failed to encode reply");
        return;
    };
    let mut framed = Vec::with_capacity(body.len() + 10);
    write_varint(msg_type.as_u64(), &mut framed);
    framed.extend_from_slice(&body);
    if let Err(err) = (io.write)(stream, &framed) {
        tracing::warn!(?msg_type, %err, "reply write failed");
    }
}
