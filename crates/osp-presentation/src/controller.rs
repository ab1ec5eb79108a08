//! [`PresentationController`] (spec §4.H). Grounded on
//! `original_source/api/impl/presentation/presentation_controller.cc`'s
//! `Controller` class: `presentations`/`receiver_endpoints`/
//! `group_streams`/`terminate_listeners` maps, `StartPresentation`,
//! `OnPresentationTerminated`, and the inbound
//! `PresentationTerminationEvent` handler that performs the same mapping
//! from the receiver side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use osp_availability::AvailabilityListener;
use osp_demux::{DemuxError, MessageCallback, MessageWatch};
use osp_rr::{RequestDelegate, RequestIo, RequestResponder};
use osp_time::TimePoint;
use osp_transport::{ConnectRequest, ConnectionRequestCallback, StreamHandle};
use osp_wire::codec::decode_body_prefix;
use osp_wire::{Endpoint, EndpointId, MessageType, PresentationId, PresentationTerminationEvent, TerminationReason};

use crate::connection::{Connection, ConnectionDelegate, ConnectionIo, ConnectionRef};
use crate::connection_manager::ConnectionManager;
use crate::error::PresentationError;
use crate::group_streams::{Initiation, InitiationRequestData, MessageGroupStreams, Termination, TerminationRequestData};
use crate::types::ConnectionRole;

/// Injected capabilities the controller needs from the owning endpoint.
#[derive(Clone)]
pub struct ControllerIo {
    pub connect: Arc<dyn Fn(Endpoint, Box<dyn ConnectionRequestCallback>) -> ConnectRequest + Send + Sync>,
    pub write: Arc<dyn Fn(StreamHandle, &[u8]) -> Result<(), String> + Send + Sync>,
    pub watch_message: Arc<dyn Fn(EndpointId, MessageType, MessageCallback) -> MessageWatch + Send + Sync>,
    pub endpoint_id_for: Arc<dyn Fn(Endpoint) -> EndpointId + Send + Sync>,
    pub next_request_id: Arc<dyn Fn(EndpointId) -> u64 + Send + Sync>,
    pub create_protocol_connection: Arc<dyn Fn(EndpointId) -> Option<StreamHandle> + Send + Sync>,
}

/// `StartPresentation`'s result/error delegate (spec §4.H `delegate`).
pub trait StartPresentationDelegate: Send {
    fn on_connection(&mut self, connection: ConnectionRef);
    fn on_error(&mut self, error: PresentationError);
}

pub trait ReceiverObserver: Send {
    fn on_receiver_added(&mut self, service_id: &str) {
        let _ = service_id;
    }
    fn on_receiver_removed(&mut self, service_id: &str) {
        let _ = service_id;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverObserverId(u64);

/// Scoped handle for a registered [`ReceiverObserver`] (spec §4.H/§6
/// "Scoped handles exposed to the embedder: `ReceiverWatch`"). Dropping it
/// removes the registration.
pub struct ReceiverWatch {
    inner: Weak<Mutex<Inner>>,
    id: ReceiverObserverId,
}

impl Drop for ReceiverWatch {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().expect("controller mutex poisoned").receiver_observers.retain(|(id, _)| *id != self.id);
        }
    }
}

struct PresentationEntry {
    service_id: String,
    #[allow(dead_code)]
    url: String,
    connections: Vec<ConnectionRef>,
}

struct PendingInitiation {
    presentation_id: PresentationId,
    endpoint_id: EndpointId,
    connection_id: u64,
    delegate: Arc<Mutex<dyn StartPresentationDelegate>>,
    conn_delegate: Arc<Mutex<dyn ConnectionDelegate>>,
}

struct GroupStreamsEntry {
    streams: MessageGroupStreams,
    connect_request: Option<ConnectRequest>,
    stream: Option<StreamHandle>,
}

struct Inner {
    presentations: HashMap<String, PresentationEntry>,
    receiver_endpoints: HashMap<String, Endpoint>,
    group_streams: HashMap<String, GroupStreamsEntry>,
    terminate_listeners: HashMap<String, MessageWatch>,
    pending_initiations: HashMap<u64, PendingInitiation>,
    receiver_observers: Vec<(ReceiverObserverId, Arc<Mutex<dyn ReceiverObserver>>)>,
    next_connection_id: u64,
    next_caller_local_id: u64,
    next_observer_id: u64,
}

/// Scoped handle for an in-flight `StartPresentation` call (spec §4.H
/// "`StartPresentation(...) -> ConnectRequest`"). Dropping it before the
/// initiation response arrives cancels the request.
pub struct StartPresentationRequest {
    responder: RequestResponder<Initiation>,
    caller_local_id: u64,
}

impl Drop for StartPresentationRequest {
    fn drop(&mut self) {
        self.responder.cancel_message(self.caller_local_id);
    }
}

#[derive(Clone)]
pub struct PresentationController {
    inner: Arc<Mutex<Inner>>,
    io: ControllerIo,
    connection_manager: Arc<ConnectionManager>,
    availability: AvailabilityListener,
}

impl PresentationController {
    #[must_use]
    pub fn new(io: ControllerIo, connection_manager: Arc<ConnectionManager>, availability: AvailabilityListener) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                presentations: HashMap::new(),
                receiver_endpoints: HashMap::new(),
                group_streams: HashMap::new(),
                terminate_listeners: HashMap::new(),
                pending_initiations: HashMap::new(),
                receiver_observers: Vec::new(),
                next_connection_id: 1,
                next_caller_local_id: 1,
                next_observer_id: 1,
            })),
            io,
            connection_manager,
            availability,
        }
    }

    #[must_use]
    pub fn availability(&self) -> &AvailabilityListener {
        &self.availability
    }

    pub fn register_receiver_watch(&self, observer: Arc<Mutex<dyn ReceiverObserver>>) -> ReceiverWatch {
        let mut inner = self.inner.lock().expect("controller mutex poisoned");
        let id = ReceiverObserverId(inner.next_observer_id);
        inner.next_observer_id += 1;
        inner.receiver_observers.push((id, observer));
        ReceiverWatch {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// A receiver became known (fed by the discovery aggregator's
    /// `on_service_added`, translated to a `service_id`/[`Endpoint`] pair by
    /// the caller).
    pub fn on_receiver_added(&self, service_id: impl Into<String>, endpoint: Endpoint, now: TimePoint) {
        let service_id = service_id.into();
        let observers = {
            let mut inner = self.inner.lock().expect("controller mutex poisoned");
            inner.receiver_endpoints.insert(service_id.clone(), endpoint);
            inner.receiver_observers.clone()
        };
        self.availability.on_receiver_added(&service_id, endpoint, now);
        for (_, observer) in observers {
            observer.lock().expect("receiver observer mutex poisoned").on_receiver_added(&service_id);
        }
    }

    pub fn on_receiver_removed(&self, service_id: &str) {
        let observers = {
            let mut inner = self.inner.lock().expect("controller mutex poisoned");
            inner.receiver_endpoints.remove(service_id);
            if let Some(entry) = inner.group_streams.remove(service_id) {
                entry.streams.initiation.reset();
                entry.streams.termination.reset();
            }
            inner.receiver_observers.clone()
        };
        self.availability.on_receiver_removed(service_id);
        for (_, observer) in observers {
            observer.lock().expect("receiver observer mutex poisoned").on_receiver_removed(service_id);
        }
    }

    /// `StartPresentation(url, service_id, delegate, conn_delegate)` (spec
    /// §4.H).
    pub fn start_presentation(
        &self,
        url: impl Into<String>,
        service_id: &str,
        delegate: Arc<Mutex<dyn StartPresentationDelegate>>,
        conn_delegate: Arc<Mutex<dyn ConnectionDelegate>>,
    ) -> Result<StartPresentationRequest, PresentationError> {
        let url = url.into();
        let presentation_id = osp_wire::make_presentation_id();

        let (responder, caller_local_id, needs_connect, endpoint, connection_id) = {
            let mut inner = self.inner.lock().expect("controller mutex poisoned");
            let endpoint = *inner
                .receiver_endpoints
                .get(service_id)
                .ok_or(PresentationError::NoPresentationFound)?;
            let (streams, needs_connect) = self.ensure_group_streams(&mut inner, service_id, endpoint);

            let connection_id = inner.next_connection_id;
            inner.next_connection_id += 1;
            let caller_local_id = inner.next_caller_local_id;
            inner.next_caller_local_id += 1;

            inner.presentations.insert(
                presentation_id.as_str().to_owned(),
                PresentationEntry {
                    service_id: service_id.to_owned(),
                    url: url.clone(),
                    connections: Vec::new(),
                },
            );
            let endpoint_id = (self.io.endpoint_id_for)(endpoint);
            inner.pending_initiations.insert(
                caller_local_id,
                PendingInitiation {
                    presentation_id: presentation_id.clone(),
                    endpoint_id,
                    connection_id,
                    delegate,
                    conn_delegate,
                },
            );
            (streams.initiation.clone(), caller_local_id, needs_connect, endpoint, connection_id)
        };

        if needs_connect {
            self.start_connecting(service_id, endpoint);
        }

        responder
            .write_message(
                caller_local_id,
                InitiationRequestData {
                    presentation_id,
                    url,
                    headers: Vec::new(),
                    connection_id,
                },
            )
            .map_err(|err| PresentationError::Write(err.to_string()))?;

        Ok(StartPresentationRequest { responder, caller_local_id })
    }

    /// Lazily creates the initiation+termination channel pair for
    /// `service_id`. Returns whether the caller must now start connecting —
    /// that call happens once `inner`'s lock is dropped, never from in here
    /// (see the module-level discipline `osp-availability`'s listener
    /// documents for the same reentrancy hazard).
    fn ensure_group_streams(&self, inner: &mut Inner, service_id: &str, endpoint: Endpoint) -> (MessageGroupStreams, bool) {
        if let Some(entry) = inner.group_streams.get(service_id) {
            return (entry.streams.clone(), false);
        }

        let endpoint_id = (self.io.endpoint_id_for)(endpoint);
        let initiation_io = self.request_io::<Initiation>(endpoint_id);
        let termination_io = self.request_io::<Termination>(endpoint_id);
        let rr_delegate: Arc<Mutex<ControllerRrDelegate>> = Arc::new(Mutex::new(ControllerRrDelegate {
            inner: Arc::downgrade(&self.inner),
            io: self.io.clone(),
            connection_manager: self.connection_manager.clone(),
        }));

        let streams = MessageGroupStreams {
            initiation: RequestResponder::new(initiation_io, rr_delegate.clone()),
            termination: RequestResponder::new(termination_io, rr_delegate),
        };

        inner.group_streams.insert(
            service_id.to_owned(),
            GroupStreamsEntry {
                streams: streams.clone(),
                connect_request: None,
                stream: None,
            },
        );

        (streams, true)
    }

    fn request_io<T: osp_rr::RequestResponse>(&self, endpoint_id: EndpointId) -> RequestIo {
        let substrate_next_id = self.io.next_request_id.clone();
        let substrate_write = self.io.write.clone();
        let demuxer_watch = self.io.watch_message.clone();
        RequestIo {
            next_request_id: Arc::new(move || (substrate_next_id)(endpoint_id)),
            write: Arc::new(move |stream, bytes| (substrate_write)(stream, bytes).map_err(osp_rr::RrError::Write)),
            watch_response: Arc::new(move |callback| (demuxer_watch)(endpoint_id, T::RESPONSE_TYPE, callback)),
        }
    }

    fn start_connecting(&self, service_id: &str, endpoint: Endpoint) {
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let service_id_owned = service_id.to_owned();
        let callback = move |result: Result<StreamHandle, ()>| {
            let Some(inner) = weak.upgrade() else { return };
            let mut guard = inner.lock().expect("controller mutex poisoned");
            let Some(entry) = guard.group_streams.get_mut(&service_id_owned) else {
                return;
            };
            entry.connect_request = None;
            match result {
                Ok(stream) => {
                    entry.stream = Some(stream);
                    let streams = entry.streams.clone();
                    drop(guard);
                    let _ = streams.initiation.set_connection(stream);
                    let _ = streams.termination.set_connection(stream);
                }
                Err(()) => {
                    tracing::warn!(service_id = %service_id_owned, "presentation channel connect failed");
                }
            }
        };
        let connect_request = (self.io.connect)(endpoint, Box::new(callback));
        let mut inner = self.inner.lock().expect("controller mutex poisoned");
        if let Some(entry) = inner.group_streams.get_mut(service_id) {
            entry.connect_request = Some(connect_request);
        }
    }

    /// `OnPresentationTerminated(id, reason)` (spec §4.H): terminates every
    /// connection, sends a `PresentationTerminationRequest`, then forgets
    /// the presentation.
    pub fn on_presentation_terminated(&self, presentation_id: &str, reason: TerminationReason) -> Result<(), PresentationError> {
        let (service_id, caller_local_id, responder) = {
            let mut inner = self.inner.lock().expect("controller mutex poisoned");
            let entry = inner.presentations.remove(presentation_id).ok_or(PresentationError::UnknownPresentationId)?;
            inner.terminate_listeners.remove(presentation_id);
            let caller_local_id = inner.next_caller_local_id;
            inner.next_caller_local_id += 1;
            let responder = inner.group_streams.get(&entry.service_id).map(|g| g.streams.termination.clone());
            (entry.service_id, caller_local_id, responder)
        };
        self.connection_manager.terminate_presentation(presentation_id);

        let Some(responder) = responder else {
            return Ok(());
        };
        let presentation_id = PresentationId::new(presentation_id.to_owned()).map_err(PresentationError::InvalidPresentationId)?;
        responder
            .write_message(caller_local_id, TerminationRequestData { presentation_id, reason })
            .map_err(|err| PresentationError::Write(err.to_string()))?;
        tracing::debug!(%service_id, "sent termination request");
        Ok(())
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connection_manager
    }
}

/// `RequestDelegate` for both the initiation and termination channels,
/// completing `StartPresentation` and finishing the `OpenConnection` step
/// spec §4.H describes.
struct ControllerRrDelegate {
    inner: Weak<Mutex<Inner>>,
    io: ControllerIo,
    connection_manager: Arc<ConnectionManager>,
}

impl RequestDelegate<Initiation> for ControllerRrDelegate {
    fn on_matched_response(&mut self, caller_local_id: u64, _data: InitiationRequestData, response: osp_wire::PresentationInitiationResponse) {
        let Some(inner_arc) = self.inner.upgrade() else { return };
        let pending = {
            let mut inner = inner_arc.lock().expect("controller mutex poisoned");
            inner.pending_initiations.remove(&caller_local_id)
        };
        let Some(pending) = pending else {
            return;
        };

        if response.result != osp_wire::InitiationResult::Success {
            pending
                .delegate
                .lock()
                .expect("start-presentation delegate mutex poisoned")
                .on_error(PresentationError::InitiationFailed(format!("{:?}", response.result)));
            let mut inner = inner_arc.lock().expect("controller mutex poisoned");
            inner.presentations.remove(pending.presentation_id.as_str());
            return;
        }

        let Some(stream) = (self.io.create_protocol_connection)(pending.endpoint_id) else {
            pending
                .delegate
                .lock()
                .expect("start-presentation delegate mutex poisoned")
                .on_error(PresentationError::Write("no connection available to open the presentation stream".to_owned()));
            return;
        };

        let connection_io = ConnectionIo {
            write: self.io.write.clone(),
            create_protocol_connection: self.io.create_protocol_connection.clone(),
        };
        let connection = Arc::new(Mutex::new(Connection::new(
            pending.presentation_id.clone(),
            pending.connection_id,
            ConnectionRole::Controller,
            pending.endpoint_id,
            pending.conn_delegate,
            connection_io,
        )));
        connection.lock().expect("connection mutex poisoned").on_connected(stream);
        self.connection_manager.add_connection(connection.clone());

        {
            let mut inner = inner_arc.lock().expect("controller mutex poisoned");
            if let Some(entry) = inner.presentations.get_mut(pending.presentation_id.as_str()) {
                entry.connections.push(connection.clone());
            }
            if !inner.terminate_listeners.contains_key(pending.presentation_id.as_str()) {
                let watch = register_terminate_listener(&inner_arc, &self.connection_manager, &self.io, pending.endpoint_id, pending.presentation_id.as_str());
                inner.terminate_listeners.insert(pending.presentation_id.as_str().to_owned(), watch);
            }
        }

        pending
            .delegate
            .lock()
            .expect("start-presentation delegate mutex poisoned")
            .on_connection(connection);
    }

    fn on_request_cancelled(&mut self, caller_local_id: u64, _data: InitiationRequestData) {
        let Some(inner_arc) = self.inner.upgrade() else { return };
        let pending = {
            let mut inner = inner_arc.lock().expect("controller mutex poisoned");
            inner.pending_initiations.remove(&caller_local_id)
        };
        if let Some(pending) = pending {
            pending
                .delegate
                .lock()
                .expect("start-presentation delegate mutex poisoned")
                .on_error(PresentationError::RequestCancelled);
        }
    }
}

impl RequestDelegate<Termination> for ControllerRrDelegate {
    fn on_matched_response(&mut self, _caller_local_id: u64, data: TerminationRequestData, response: osp_wire::PresentationTerminationResponse) {
        if response.result != osp_wire::TerminationResult::Success {
            tracing::warn!(presentation_id = %data.presentation_id, result = ?response.result, "termination request rejected by receiver");
        }
    }

    fn on_request_cancelled(&mut self, _caller_local_id: u64, data: TerminationRequestData) {
        tracing::warn!(presentation_id = %data.presentation_id, "termination request cancelled before completion");
    }
}

/// Registers the controller-side listener for an inbound
/// `PresentationTerminationEvent` from `endpoint_id` (spec §4.H: "Inbound
/// `PresentationTerminationEvent` for `presentation_id` reaches the
/// relevant terminate-listener, which performs the same mapping from the
/// receiver side").
fn register_terminate_listener(
    inner: &Arc<Mutex<Inner>>,
    connection_manager: &Arc<ConnectionManager>,
    io: &ControllerIo,
    endpoint_id: EndpointId,
    presentation_id: &str,
) -> MessageWatch {
    let weak: Weak<Mutex<Inner>> = Arc::downgrade(inner);
    let connection_manager = connection_manager.clone();
    let presentation_id = presentation_id.to_owned();
    let callback: MessageCallback = Box::new(move |_endpoint, _msg_type, body| {
        let (event, consumed): (PresentationTerminationEvent, usize) = match decode_body_prefix(body) {
            Ok(v) => v,
            Err(err) => {
                return Err(DemuxError::Parsing {
                    consumed: body.len(),
                    detail: err.to_string(),
                });
            }
        };
        if event.presentation_id != presentation_id {
            return Ok(consumed);
        }
        if let Some(inner) = weak.upgrade() {
            let mut guard = inner.lock().expect("controller mutex poisoned");
            guard.presentations.remove(&presentation_id);
            guard.terminate_listeners.remove(&presentation_id);
        }
        connection_manager.terminate_presentation(&presentation_id);
        tracing::debug!(%presentation_id, reason = ?event.reason, source = ?event.source, "presentation terminated by receiver");
        Ok(consumed)
    });
    (io.watch_message)(endpoint_id, MessageType::PresentationTerminationEvent, callback)
}
