//! Thin manager facade wiring the endpoint-core subsystems together (spec
//! §9): the mDNS discovery aggregator, the protocol-connection substrate,
//! and the presentation controller/receiver/availability stack, generic
//! over a concrete [`Transport`] the embedder supplies (a `quinn`-backed
//! one lives behind `osp-transport`'s `quinn-transport` feature).
//!
//! A concrete mDNS responder, a QUIC accept loop, and the per-role
//! `ServiceStateMachine`'s start/stop delegate are embedder concerns (spec
//! §1 non-goals): this facade owns everything downstream of "a receiver
//! was discovered" and "bytes arrived on a stream", the same boundary
//! `server::state::AppState` draws around the HTTP/DB layer it owns versus
//! the forwarder hardware it doesn't.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use osp_availability::{AvailabilityIo, AvailabilityListener};
use osp_demux::MessageDemuxer;
use osp_discovery::{DiscoveredService, DiscoveryAggregator, DiscoveryObserver, MdnsEventSource, QueryController};
use osp_presentation::{ConnectionManager, ConnectionManagerIo, ControllerIo, PresentationController, PresentationReceiver, ReceiverDelegate, ReceiverIo};
use osp_time::{Clock, TaskRunner, TimePoint};
use osp_transport::{ConnectionRequestCallback, ProtocolConnectionSubstrate, Transport};
use osp_wire::{Endpoint, EndpointId, InstanceKey, StreamId};

/// Re-exported so embedders constructing a listener or publisher role's
/// own `ServiceStateMachine` (spec §4.B) — each needs its own concrete
/// start/stop delegate, which this facade has no default for (spec §1
/// non-goals: no concrete mDNS responder or QUIC accept loop) — don't need
/// a second dependency on `osp-service-state` just for that.
pub use osp_service_state::{NullObserver, ServiceDelegate, ServiceObserver, ServiceState, ServiceStateMachine};

/// Hex-encodes an `InstanceKey`'s raw bytes into the `&str` service id
/// `osp-availability`/`osp-presentation` key everything by (DESIGN.md Open
/// Question 5: the two crates never need to agree on a representation,
/// only their shared caller does).
#[must_use]
pub fn service_id_for(instance: &InstanceKey) -> String {
    instance.as_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

/// Picks a discovered service's IPv4 endpoint over its IPv6 one when both
/// are present (DESIGN.md Open Question 5).
#[must_use]
pub fn endpoint_for(service: &DiscoveredService) -> Option<Endpoint> {
    service
        .v4_endpoint
        .map(|(addr, port)| Endpoint::new(IpAddr::V4(addr), port))
        .or_else(|| service.v6_endpoint.map(|(addr, port)| Endpoint::new(IpAddr::V6(addr), port)))
}

/// Everything needed to speak Open Screen Protocol over one transport:
/// discover receivers, start/answer presentations, and exchange connection
/// messages. Cloning a `&OspEndpoint` is unnecessary — every field it owns
/// is already cheaply `Clone` internally (shared `Arc<Mutex<_>>` state),
/// so embedder code reaches it through `&OspEndpoint` or wraps one instance
/// in its own `Arc`.
pub struct OspEndpoint<T: Transport> {
    clock: Arc<dyn Clock>,
    task_runner: Arc<dyn TaskRunner>,
    substrate: ProtocolConnectionSubstrate<T>,
    demuxer: MessageDemuxer,
    discovery: Mutex<DiscoveryAggregator>,
    availability: AvailabilityListener,
    connection_manager: Arc<ConnectionManager>,
    controller: PresentationController,
    receiver: PresentationReceiver,
}

impl<T: Transport> OspEndpoint<T> {
    /// Wires a fresh endpoint over `transport`. `receiver_delegate` answers
    /// inbound `PresentationUrlAvailabilityRequest`/`StartPresentation`
    /// calls from remote controllers (spec §4.H receiver side).
    pub fn new(
        transport: T,
        clock: Arc<dyn Clock>,
        task_runner: Arc<dyn TaskRunner>,
        receiver_delegate: Arc<Mutex<dyn ReceiverDelegate>>,
    ) -> Self {
        let substrate = ProtocolConnectionSubstrate::new(transport);
        let demuxer = MessageDemuxer::new();

        let availability = AvailabilityListener::new(AvailabilityIo {
            connect: Arc::new({
                let substrate = substrate.clone();
                move |endpoint, callback: Box<dyn ConnectionRequestCallback>| substrate.connect(endpoint, callback)
            }),
            write: Arc::new({
                let substrate = substrate.clone();
                move |stream, bytes| substrate.write(stream, bytes).map_err(|e| e.to_string())
            }),
            watch_message: Arc::new({
                let demuxer = demuxer.clone();
                move |endpoint_id, msg_type, callback| demuxer.watch_message_type(endpoint_id, msg_type, callback)
            }),
            endpoint_id_for: Arc::new({
                let substrate = substrate.clone();
                move |endpoint| substrate.endpoint_id_for(endpoint)
            }),
            next_request_id: Arc::new({
                let substrate = substrate.clone();
                move |endpoint_id| substrate.next_request_id(endpoint_id)
            }),
        });

        let connection_manager = Arc::new(ConnectionManager::new(ConnectionManagerIo {
            set_default_watch: Arc::new({
                let demuxer = demuxer.clone();
                move |msg_type, callback| demuxer.set_default_message_type_watch(msg_type, callback)
            }),
            write: Arc::new({
                let substrate = substrate.clone();
                move |stream, bytes| substrate.write(stream, bytes).map_err(|e| e.to_string())
            }),
            open_stream: Arc::new({
                let substrate = substrate.clone();
                move |endpoint_id| substrate.create_protocol_connection(endpoint_id)
            }),
        }));

        let controller = PresentationController::new(
            ControllerIo {
                connect: Arc::new({
                    let substrate = substrate.clone();
                    move |endpoint, callback: Box<dyn ConnectionRequestCallback>| substrate.connect(endpoint, callback)
                }),
                write: Arc::new({
                    let substrate = substrate.clone();
                    move |stream, bytes| substrate.write(stream, bytes).map_err(|e| e.to_string())
                }),
                watch_message: Arc::new({
                    let demuxer = demuxer.clone();
                    move |endpoint_id, msg_type, callback| demuxer.watch_message_type(endpoint_id, msg_type, callback)
                }),
                endpoint_id_for: Arc::new({
                    let substrate = substrate.clone();
                    move |endpoint| substrate.endpoint_id_for(endpoint)
                }),
                next_request_id: Arc::new({
                    let substrate = substrate.clone();
                    move |endpoint_id| substrate.next_request_id(endpoint_id)
                }),
                create_protocol_connection: Arc::new({
                    let substrate = substrate.clone();
                    move |endpoint_id| substrate.create_protocol_connection(endpoint_id)
                }),
            },
            connection_manager.clone(),
            availability.clone(),
        );

        let receiver = PresentationReceiver::new(
            ReceiverIo {
                write: Arc::new({
                    let substrate = substrate.clone();
                    move |stream, bytes| substrate.write(stream, bytes).map_err(|e| e.to_string())
                }),
                set_default_watch: Arc::new({
                    let demuxer = demuxer.clone();
                    move |msg_type, callback| demuxer.set_default_message_type_watch(msg_type, callback)
                }),
                connection_for_endpoint: Arc::new({
                    let substrate = substrate.clone();
                    move |endpoint_id| substrate.create_protocol_connection(endpoint_id)
                }),
            },
            connection_manager.clone(),
            receiver_delegate,
        );

        Self {
            clock,
            task_runner,
            substrate,
            demuxer,
            discovery: Mutex::new(DiscoveryAggregator::new()),
            availability,
            connection_manager,
            controller,
            receiver,
        }
    }

    #[must_use]
    pub fn substrate(&self) -> &ProtocolConnectionSubstrate<T> {
        &self.substrate
    }

    #[must_use]
    pub fn demuxer(&self) -> &MessageDemuxer {
        &self.demuxer
    }

    #[must_use]
    pub fn availability(&self) -> &AvailabilityListener {
        &self.availability
    }

    #[must_use]
    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection_manager
    }

    #[must_use]
    pub fn controller(&self) -> &PresentationController {
        &self.controller
    }

    #[must_use]
    pub fn receiver(&self) -> &PresentationReceiver {
        &self.receiver
    }

    #[must_use]
    pub fn task_runner(&self) -> &Arc<dyn TaskRunner> {
        &self.task_runner
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Feeds newly arrived bytes on `stream` into the demuxer, once the
    /// caller (typically the concrete transport) has resolved which
    /// endpoint and logical stream they belong to (spec §4.D).
    pub fn on_inbound_bytes(&self, endpoint_id: EndpointId, stream: StreamId, bytes: &[u8]) {
        self.demuxer.on_bytes(endpoint_id, stream, bytes);
    }

    /// Drains `source` into the discovery aggregator, bridging every
    /// add/remove straight into the presentation controller (which in turn
    /// notifies the availability requester) — the facade's one piece of
    /// real "management" logic (spec §9).
    pub fn run_discovery<Q: QueryController, S: MdnsEventSource>(&self, query_controller: &mut Q, source: &mut S) {
        let now = self.clock.now();
        let mut bridge = DiscoveryBridge { controller: &self.controller, now };
        self.discovery
            .lock()
            .expect("discovery mutex poisoned")
            .run_until_quiescent(query_controller, source, &mut bridge, self.clock.as_ref());
    }

    #[must_use]
    pub fn known_service_count(&self) -> usize {
        self.discovery.lock().expect("discovery mutex poisoned").known_service_count()
    }
}

struct DiscoveryBridge<'a> {
    controller: &'a PresentationController,
    now: TimePoint,
}

impl DiscoveryObserver for DiscoveryBridge<'_> {
    fn on_service_added(&mut self, service: &DiscoveredService) {
        let Some(endpoint) = endpoint_for(service) else {
            tracing::warn!(service_id = ?service.service_id, "discovered service has no usable address, ignoring");
            return;
        };
        self.controller.on_receiver_added(service_id_for(&service.service_id), endpoint, self.now);
    }

    fn on_service_changed(&mut self, service: &DiscoveredService) {
        // An address or friendly-name change reuses add's wiring: dropping
        // and re-adding is observably equivalent to an in-place update
        // since `on_receiver_added` just overwrites the stored endpoint.
        self.on_service_added(service);
    }

    fn on_service_removed(&mut self, service: &DiscoveredService) {
        self.controller.on_receiver_removed(&service_id_for(&service.service_id));
    }

    fn on_all_services_removed(&mut self) {
        tracing::debug!("all discovered services removed");
    }
}
