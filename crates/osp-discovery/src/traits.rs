//! The external interfaces the aggregator consumes and drives (spec §1: "the
//! concrete mDNS responder implementation is out of scope — only the event
//! interface it must expose to the aggregator" is in scope here).

use crate::types::HostKey;
use crate::types::{DiscoveredService, SocketId};
use osp_wire::InstanceKey;

/// Query start/stop calls the aggregator issues as instances and hosts enter
/// and leave a state that requires active querying (spec §4.C steps 1-2).
pub trait QueryController {
    fn start_srv_query(&mut self, socket: SocketId, instance: &InstanceKey);
    fn stop_srv_query(&mut self, socket: SocketId, instance: &InstanceKey);
    fn start_txt_query(&mut self, socket: SocketId, instance: &InstanceKey);
    fn stop_txt_query(&mut self, socket: SocketId, instance: &InstanceKey);
    fn start_address_queries(&mut self, host_key: &HostKey);
    fn stop_address_queries(&mut self, host_key: &HostKey);
}

/// A `QueryController` that logs and otherwise does nothing, for callers
/// that only care about the aggregated service set and drive queries some
/// other way.
#[derive(Debug, Default)]
pub struct NullQueryController;

impl QueryController for NullQueryController {
    fn start_srv_query(&mut self, socket: SocketId, instance: &InstanceKey) {
        tracing::trace!(?socket, ?instance, "start SRV query");
    }
    fn stop_srv_query(&mut self, socket: SocketId, instance: &InstanceKey) {
        tracing::trace!(?socket, ?instance, "stop SRV query");
    }
    fn start_txt_query(&mut self, socket: SocketId, instance: &InstanceKey) {
        tracing::trace!(?socket, ?instance, "start TXT query");
    }
    fn stop_txt_query(&mut self, socket: SocketId, instance: &InstanceKey) {
        tracing::trace!(?socket, ?instance, "stop TXT query");
    }
    fn start_address_queries(&mut self, host_key: &HostKey) {
        tracing::trace!(?host_key, "start A/AAAA queries");
    }
    fn stop_address_queries(&mut self, host_key: &HostKey) {
        tracing::trace!(?host_key, "stop A/AAAA queries");
    }
}

/// Notified when the aggregated, de-duplicated service set changes.
pub trait DiscoveryObserver {
    fn on_service_added(&mut self, service: &DiscoveredService);
    fn on_service_changed(&mut self, service: &DiscoveredService);
    fn on_service_removed(&mut self, service: &DiscoveredService);
    fn on_all_services_removed(&mut self) {}
}
