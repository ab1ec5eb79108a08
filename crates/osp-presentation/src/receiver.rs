//! [`PresentationReceiver`] (spec §4.H, receiver side). Grounded on
//! `original_source/api/impl/presentation/presentation_receiver.cc`'s
//! `Receiver`: same `queued_initiation_responses`/`presentations` maps,
//! delegate-gated `StartPresentation`, and termination bookkeeping.
//!
//! `PresentationConnectionOpenRequest`/`Response` (the original's
//! `ConnectToPresentation` path for a second connection joining an
//! existing presentation) is left unhandled here for the same reason
//! [`crate::connection_manager`] never wires those two message types: the
//! narrative spec this crate follows never describes that flow as an
//! operation, only as a catalogue entry. One connection per presentation,
//! established at initiation time, is all that's implemented.
//!
//! The original also registers its `PresentationTerminationRequest` watch
//! per-endpoint, scoped to the lifetime of one started presentation. Here
//! it's a single default watch shared by every presentation, since the
//! request always carries its own `presentation_id` to look up — simpler
//! and observably equivalent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use osp_demux::{DemuxError, MessageCallback, MessageWatch};
use osp_transport::StreamHandle;
use osp_wire::codec::{decode_body_prefix, encode_body};
use osp_wire::{
    EndpointId, InitiationResult, MessageType, PresentationId, PresentationInitiationRequest, PresentationInitiationResponse,
    PresentationTerminationRequest, PresentationTerminationResponse, PresentationUrlAvailabilityRequest, PresentationUrlAvailabilityResponse,
    TerminationReason, TerminationResult, UrlAvailability, write_varint,
};

use crate::connection::{Connection, ConnectionDelegate, ConnectionIo, ConnectionRef};
use crate::connection_manager::ConnectionManager;
use crate::error::PresentationError;
use crate::types::{ConnectionRole, PresentationInfo};

/// Injected capabilities the receiver needs from the owning endpoint.
#[derive(Clone)]
pub struct ReceiverIo {
    pub write: Arc<dyn Fn(StreamHandle, &[u8]) -> Result<(), String> + Send + Sync>,
    pub set_default_watch: Arc<dyn Fn(MessageType, MessageCallback) -> MessageWatch + Send + Sync>,
    pub connection_for_endpoint: Arc<dyn Fn(EndpointId) -> Option<StreamHandle> + Send + Sync>,
}

/// Embedder hooks gating and reacting to inbound presentation requests
/// (spec §4.H "Receiver side (same code, delegate callbacks in the
/// opposite direction)").
pub trait ReceiverDelegate: Send {
    /// Answers a `PresentationUrlAvailabilityRequest` (spec §4.G/§6). The
    /// returned vector must have exactly one verdict per input URL, in
    /// order.
    fn on_url_availability_request(&mut self, urls: &[String]) -> Vec<UrlAvailability> {
        urls.iter().map(|_| UrlAvailability::NotCompatible).collect()
    }

    /// `StartPresentation(info, endpoint_id, headers) -> bool` (spec §4.H):
    /// `false` rejects the request immediately with `kUnknownError`; `true`
    /// means the delegate will call [`PresentationReceiver::on_presentation_started`]
    /// once it knows the outcome.
    fn start_presentation(&mut self, info: &PresentationInfo, endpoint_id: EndpointId, headers: &[(String, String)]) -> bool;

    fn on_terminate_requested(&mut self, presentation_id: &str, reason: TerminationReason) {
        let _ = (presentation_id, reason);
    }
}

struct QueuedInitiation {
    request_id: u64,
    connection_id: u64,
    endpoint_id: EndpointId,
    stream: StreamHandle,
}

struct PresentationEntry {
    endpoint_id: EndpointId,
    connections: Vec<ConnectionRef>,
}

struct Inner {
    queued_initiation_responses: HashMap<String, QueuedInitiation>,
    presentations: HashMap<String, PresentationEntry>,
}

#[derive(Clone)]
pub struct PresentationReceiver {
    inner: Arc<Mutex<Inner>>,
    io: ReceiverIo,
    connection_manager: Arc<ConnectionManager>,
    delegate: Arc<Mutex<dyn ReceiverDelegate>>,
    _availability_watch: Arc<MessageWatch>,
    _initiation_watch: Arc<MessageWatch>,
    _termination_watch: Arc<MessageWatch>,
}

impl PresentationReceiver {
    #[must_use]
    pub fn new(io: ReceiverIo, connection_manager: Arc<ConnectionManager>, delegate: Arc<Mutex<dyn ReceiverDelegate>>) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            queued_initiation_responses: HashMap::new(),
            presentations: HashMap::new(),
        }));

        let availability_watch = {
            let io = io.clone();
            let delegate = delegate.clone();
            let callback: MessageCallback = Box::new(move |endpoint, _msg_type, body| {
                handle_availability_request(&io, &delegate, endpoint, body)
            });
            (io.set_default_watch)(MessageType::PresentationUrlAvailabilityRequest, callback)
        };

        let initiation_watch = {
            let inner = inner.clone();
            let io = io.clone();
            let delegate = delegate.clone();
            let callback: MessageCallback = Box::new(move |endpoint, _msg_type, body| {
                handle_initiation_request(&inner, &io, &delegate, endpoint, body)
            });
            (io.set_default_watch)(MessageType::PresentationInitiationRequest, callback)
        };

        let termination_watch = {
            let inner = inner.clone();
            let io = io.clone();
            let delegate = delegate.clone();
            let connection_manager = connection_manager.clone();
            let callback: MessageCallback = Box::new(move |endpoint, _msg_type, body| {
                handle_termination_request(&inner, &io, &delegate, &connection_manager, endpoint, body)
            });
            (io.set_default_watch)(MessageType::PresentationTerminationRequest, callback)
        };

        Self {
            inner,
            io,
            connection_manager,
            delegate,
            _availability_watch: Arc::new(availability_watch),
            _initiation_watch: Arc::new(initiation_watch),
            _termination_watch: Arc::new(termination_watch),
        }
    }

    #[must_use]
    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connection_manager
    }

    /// `OnPresentationStarted(id, connection, result)` (spec §4.H): finishes
    /// a queued initiation, attaching `connection` and replying to the
    /// controller on success.
    pub fn on_presentation_started(&self, presentation_id: &str, conn_delegate: Arc<Mutex<dyn ConnectionDelegate>>, success: bool) -> Result<(), PresentationError> {
        let queued = {
            let mut inner = self.inner.lock().expect("receiver mutex poisoned");
            inner.queued_initiation_responses.remove(presentation_id)
        };
        let Some(queued) = queued else {
            return Ok(());
        };

        let presentation_id_owned = PresentationId::new(presentation_id.to_owned()).map_err(PresentationError::InvalidPresentationId)?;

        let response = if success {
            let connection_io = ConnectionIo {
                write: self.io.write.clone(),
                create_protocol_connection: self.io.connection_for_endpoint.clone(),
            };
            let connection = Arc::new(Mutex::new(Connection::new(
                presentation_id_owned,
                queued.connection_id,
                ConnectionRole::Receiver,
                queued.endpoint_id,
                conn_delegate,
                connection_io,
            )));
            connection.lock().expect("connection mutex poisoned").on_connected(queued.stream);
            self.connection_manager.add_connection(connection.clone());

            let mut inner = self.inner.lock().expect("receiver mutex poisoned");
            inner
                .presentations
                .entry(presentation_id.to_owned())
                .or_insert_with(|| PresentationEntry { endpoint_id: queued.endpoint_id, connections: Vec::new() })
                .connections
                .push(connection);

            PresentationInitiationResponse {
                request_id: queued.request_id,
                result: InitiationResult::Success,
                connection_result: Some(osp_wire::ConnectionResult::Success),
            }
        } else {
            PresentationInitiationResponse {
                request_id: queued.request_id,
                result: InitiationResult::UnknownError,
                connection_result: None,
            }
        };

        write_message(&self.io, queued.stream, MessageType::PresentationInitiationResponse, &response);
        Ok(())
    }

    /// The embedder tore down a [`Connection`] it owned; stop tracking it
    /// (spec §4.H `OnConnectionDestroyed`, mirrored from
    /// `Connection`'s `Drop`).
    pub fn on_connection_destroyed(&self, presentation_id: &str, connection_id: u64) {
        self.connection_manager.remove_connection(presentation_id, connection_id);
        let mut inner = self.inner.lock().expect("receiver mutex poisoned");
        if let Some(entry) = inner.presentations.get_mut(presentation_id) {
            entry.connections.retain(|conn| conn.lock().expect("connection mutex poisoned").connection_id() != connection_id);
        }
    }

    /// `OnPresentationTerminated(id, reason)` driven from the receiver side:
    /// terminates every connection, erases the presentation, and reports
    /// the outcome via `PresentationTerminationEvent` rather than a
    /// response, since this path has no pending request to answer.
    pub fn on_presentation_terminated(&self, presentation_id: &str, reason: TerminationReason) -> Result<(), PresentationError> {
        let entry = {
            let mut inner = self.inner.lock().expect("receiver mutex poisoned");
            inner.presentations.remove(presentation_id)
        };
        let Some(entry) = entry else {
            return Ok(());
        };
        self.connection_manager.terminate_presentation(presentation_id);

        let Some(stream) = (self.io.connection_for_endpoint)(entry.endpoint_id) else {
            return Ok(());
        };
        let event = osp_wire::PresentationTerminationEvent {
            presentation_id: presentation_id.to_owned(),
            reason,
            source: osp_wire::TerminationSource::Receiver,
        };
        write_message(&self.io, stream, MessageType::PresentationTerminationEvent, &event);
        Ok(())
    }
}

fn handle_availability_request(io: &ReceiverIo, delegate: &Arc<Mutex<dyn ReceiverDelegate>>, endpoint: EndpointId, body: &[u8]) -> Result<usize, DemuxError> {
    let (request, consumed): (PresentationUrlAvailabilityRequest, usize) = decode_prefix(body)?;
    let url_availabilities = delegate.lock().expect("receiver delegate mutex poisoned").on_url_availability_request(&request.urls);
    let response = PresentationUrlAvailabilityResponse {
        request_id: request.request_id,
        url_availabilities,
    };
    let Some(stream) = (io.connection_for_endpoint)(endpoint) else {
        return Ok(consumed);
    };
    write_message(io, stream, MessageType::PresentationUrlAvailabilityResponse, &response);
    Ok(consumed)
}

fn handle_initiation_request(
    inner: &Arc<Mutex<Inner>>,
    io: &ReceiverIo,
    delegate: &Arc<Mutex<dyn ReceiverDelegate>>,
    endpoint: EndpointId,
    body: &[u8],
) -> Result<usize, DemuxError> {
    let (request, consumed): (PresentationInitiationRequest, usize) = decode_prefix(body)?;
    let Some(stream) = (io.connection_for_endpoint)(endpoint) else {
        return Ok(consumed);
    };

    let already_queued = {
        let mut guard = inner.lock().expect("receiver mutex poisoned");
        if guard.queued_initiation_responses.contains_key(&request.presentation_id) {
            true
        } else {
            guard.queued_initiation_responses.insert(
                request.presentation_id.clone(),
                QueuedInitiation {
                    request_id: request.request_id,
                    connection_id: request.connection_id,
                    endpoint_id: endpoint,
                    stream,
                },
            );
            false
        }
    };

    if already_queued {
        let response = PresentationInitiationResponse {
            request_id: request.request_id,
            result: InitiationResult::InvalidPresentationId,
            connection_result: None,
        };
        write_message(io, stream, MessageType::PresentationInitiationResponse, &response);
        return Ok(consumed);
    }

    let info = PresentationInfo {
        id: PresentationId::new(request.presentation_id.clone()).map_err(|err| DemuxError::Parsing {
            consumed,
            detail: err.to_string(),
        })?,
        url: request.url.clone(),
    };
    let starting = delegate
        .lock()
        .expect("receiver delegate mutex poisoned")
        .start_presentation(&info, endpoint, &request.headers);

    if !starting {
        inner.lock().expect("receiver mutex poisoned").queued_initiation_responses.remove(&request.presentation_id);
        let response = PresentationInitiationResponse {
            request_id: request.request_id,
            result: InitiationResult::UnknownError,
            connection_result: None,
        };
        write_message(io, stream, MessageType::PresentationInitiationResponse, &response);
    }
    Ok(consumed)
}

fn handle_termination_request(
    inner: &Arc<Mutex<Inner>>,
    io: &ReceiverIo,
    delegate: &Arc<Mutex<dyn ReceiverDelegate>>,
    connection_manager: &Arc<ConnectionManager>,
    endpoint: EndpointId,
    body: &[u8],
) -> Result<usize, DemuxError> {
    let (request, consumed): (PresentationTerminationRequest, usize) = decode_prefix(body)?;
    let Some(stream) = (io.connection_for_endpoint)(endpoint) else {
        return Ok(consumed);
    };

    let found = inner.lock().expect("receiver mutex poisoned").presentations.remove(&request.presentation_id);
    let Some(entry) = found else {
        let response = PresentationTerminationResponse {
            request_id: request.request_id,
            presentation_id: request.presentation_id,
            result: TerminationResult::UnknownPresentationId,
        };
        write_message(io, stream, MessageType::PresentationTerminationResponse, &response);
        return Ok(consumed);
    };

    for conn in &entry.connections {
        conn.lock().expect("connection mutex poisoned").on_terminated();
    }
    connection_manager.terminate_presentation(&request.presentation_id);
    delegate
        .lock()
        .expect("receiver delegate mutex poisoned")
        .on_terminate_requested(&request.presentation_id, TerminationReason::UserTerminated);

    let response = PresentationTerminationResponse {
        request_id: request.request_id,
        presentation_id: request.presentation_id,
        result: TerminationResult::Success,
    };
    write_message(io, stream, MessageType::PresentationTerminationResponse, &response);
    Ok(consumed)
}

fn decode_prefix<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<(T, usize), DemuxError> {
    decode_body_prefix(body).map_err(|err| DemuxError::Parsing {
        consumed: body.len(),
        detail: err.to_string(),
    })
}

fn write_message<T: serde::Serialize>(io: &ReceiverIo, stream: StreamHandle, msg_type: MessageType, message: &T) {
    let Ok(body) = encode_body(message) else {
        tracing::warn!(?msg_type, "failed to encode receiver reply");
        return;
    };
    let mut framed = Vec::with_capacity(body.len() + 10);
    write_varint(msg_type.as_u64(), &mut framed);
    framed.extend_from_slice(&body);
    if let Err(err) = (io.write)(stream, &framed) {
        tracing::warn!(?msg_type, %err, "receiver reply write failed");
    }
}
