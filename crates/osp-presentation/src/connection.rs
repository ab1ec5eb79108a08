//! [`Connection`]: one controller-receiver data channel for a presentation
//! (spec §4.H). Grounded on `original_source/api/public/presentation/
//! presentation_connection.h`'s `Connection`/`Connection::Delegate` pair —
//! `SendString`/`SendBinary`/`Close` plus the `OnConnected`/
//! `OnClosedByRemote`/`OnTerminated`/`OnDiscarded` delegate callbacks.

use std::sync::{Arc, Mutex};

use osp_transport::StreamHandle;
use osp_wire::codec::encode_body;
use osp_wire::{ConnectionMessagePayload, EndpointId, MessageType, PresentationConnectionCloseEvent, PresentationConnectionMessage, PresentationId, write_varint};

use crate::error::PresentationError;
use crate::types::{CloseReason, ConnectionRole, ConnectionState};

/// Callbacks a [`Connection`] fires on its owner (spec §4.H "invoke
/// `delegate.On...`"). Implementors decide what "owner" means — a
/// controller-side application handle, or the receiver's presentation
/// object.
pub trait ConnectionDelegate: Send {
    fn on_connected(&mut self) {}
    fn on_closed_by_remote(&mut self) {}
    fn on_terminated(&mut self) {}
    fn on_discarded(&mut self) {}
    fn on_string_message(&mut self, message: String) {
        let _ = message;
    }
    fn on_binary_message(&mut self, data: Vec<u8>) {
        let _ = data;
    }
}

/// Injected capabilities a [`Connection`] needs from its owning endpoint:
/// a way to write framed bytes to its stream, and (receiver role only) a
/// way to open a fresh stream to send a close event once its own stream is
/// already gone.
#[derive(Clone)]
pub struct ConnectionIo {
    pub write: Arc<dyn Fn(StreamHandle, &[u8]) -> Result<(), String> + Send + Sync>,
    pub create_protocol_connection: Arc<dyn Fn(EndpointId) -> Option<StreamHandle> + Send + Sync>,
}

pub struct Connection {
    presentation_id: PresentationId,
    connection_id: u64,
    role: ConnectionRole,
    endpoint_id: EndpointId,
    state: ConnectionState,
    stream: Option<StreamHandle>,
    io: ConnectionIo,
    delegate: Arc<Mutex<dyn ConnectionDelegate>>,
}

pub type ConnectionRef = Arc<Mutex<Connection>>;

impl Connection {
    #[must_use]
    pub fn new(
        presentation_id: PresentationId,
        connection_id: u64,
        role: ConnectionRole,
        endpoint_id: EndpointId,
        delegate: Arc<Mutex<dyn ConnectionDelegate>>,
        io: ConnectionIo,
    ) -> Self {
        Self {
            presentation_id,
            connection_id,
            role,
            endpoint_id,
            state: ConnectionState::Connecting,
            stream: None,
            io,
            delegate,
        }
    }

    #[must_use]
    pub fn presentation_id(&self) -> &PresentationId {
        &self.presentation_id
    }

    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[must_use]
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    #[must_use]
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The stream transitioned to open (spec §4.H `OpenConnection`).
    pub fn on_connected(&mut self, stream: StreamHandle) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        self.delegate.lock().expect("connection delegate mutex poisoned").on_connected();
    }

    /// A `PresentationConnectionCloseEvent`/stream closure arrived from the
    /// peer.
    pub fn on_closed_by_remote(&mut self) {
        if matches!(self.state, ConnectionState::Closed | ConnectionState::Terminated) {
            return;
        }
        self.stream = None;
        self.state = ConnectionState::Closed;
        self.delegate.lock().expect("connection delegate mutex poisoned").on_closed_by_remote();
    }

    /// The owning presentation terminated (spec §4.H `OnPresentationTerminated`).
    pub fn on_terminated(&mut self) {
        if self.state == ConnectionState::Terminated {
            return;
        }
        self.stream = None;
        self.state = ConnectionState::Terminated;
        self.delegate.lock().expect("connection delegate mutex poisoned").on_terminated();
    }

    /// An inbound `PresentationConnectionMessage` for this connection.
    pub fn on_message(&mut self, payload: ConnectionMessagePayload) {
        let mut delegate = self.delegate.lock().expect("connection delegate mutex poisoned");
        match payload {
            ConnectionMessagePayload::String(message) => delegate.on_string_message(message),
            ConnectionMessagePayload::Binary(data) => delegate.on_binary_message(data),
        }
    }

    pub fn send_string(&self, message: impl Into<String>) -> Result<(), PresentationError> {
        self.send_payload(ConnectionMessagePayload::String(message.into()))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), PresentationError> {
        self.send_payload(ConnectionMessagePayload::Binary(data))
    }

    fn send_payload(&self, payload: ConnectionMessagePayload) -> Result<(), PresentationError> {
        let Some(stream) = self.stream else {
            return Err(PresentationError::Write("connection has no open stream".to_owned()));
        };
        let message = PresentationConnectionMessage {
            presentation_id: self.presentation_id.as_str().to_owned(),
            connection_id: self.connection_id,
            payload,
        };
        let body = encode_body(&message).map_err(PresentationError::Wire)?;
        let mut framed = Vec::with_capacity(body.len() + 10);
        write_varint(MessageType::PresentationConnectionMessage.as_u64(), &mut framed);
        framed.extend_from_slice(&body);
        (self.io.write)(stream, &framed).map_err(PresentationError::Write)
    }

    /// `Connection::Close(reason)` (spec §4.H): transitions to Closed, drops
    /// the stream, and — receiver role only — sends a
    /// `PresentationConnectionCloseEvent` over a freshly opened stream (the
    /// old one may already be gone).
    pub fn close(&mut self, reason: CloseReason) -> Result<(), PresentationError> {
        if matches!(self.state, ConnectionState::Closed | ConnectionState::Terminated) {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        self.stream = None;

        if self.role == ConnectionRole::Receiver {
            let stream = (self.io.create_protocol_connection)(self.endpoint_id)
                .ok_or_else(|| PresentationError::Write("no connection available to send close event".to_owned()))?;
            let (wire_reason, error_message) = reason.as_wire();
            let event = PresentationConnectionCloseEvent {
                presentation_id: self.presentation_id.as_str().to_owned(),
                connection_id: self.connection_id,
                reason: wire_reason,
                error_message,
            };
            let body = encode_body(&event).map_err(PresentationError::Wire)?;
            let mut framed = Vec::with_capacity(body.len() + 10);
            write_varint(MessageType::PresentationConnectionCloseEvent.as_u64(), &mut framed);
            framed.extend_from_slice(&body);
            (self.io.write)(stream, &framed).map_err(PresentationError::Write)?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            let _ = self.close(CloseReason::Discarded);
            self.delegate.lock().expect("connection delegate mutex poisoned").on_discarded();
        }
    }
}
