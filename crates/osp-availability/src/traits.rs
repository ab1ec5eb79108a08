//! The observer callback and the injected capabilities this crate needs
//! from the protocol-connection substrate and demuxer, without being
//! generic over `osp_transport::Transport` itself (same tradeoff
//! `osp_rr::RequestIo` makes).

use std::sync::Arc;

use osp_demux::{MessageCallback, MessageWatch};
use osp_transport::{ConnectRequest, ConnectionRequestCallback, StreamHandle};
use osp_wire::{Endpoint, EndpointId, MessageType};

/// Fan-out target for availability verdicts (spec §4.G:
/// `OnServiceAvailable`/`OnServiceUnavailable`).
pub trait AvailabilityObserver: Send {
    fn on_service_available(&mut self, url: &str, service_id: &str);
    fn on_service_unavailable(&mut self, url: &str, service_id: &str);
}

#[derive(Clone)]
pub struct AvailabilityIo {
    pub connect: Arc<dyn Fn(Endpoint, Box<dyn ConnectionRequestCallback>) -> ConnectRequest + Send + Sync>,
    pub write: Arc<dyn Fn(StreamHandle, &[u8]) -> Result<(), String> + Send + Sync>,
    pub watch_message: Arc<dyn Fn(EndpointId, MessageType, MessageCallback) -> MessageWatch + Send + Sync>,
    pub endpoint_id_for: Arc<dyn Fn(Endpoint) -> EndpointId + Send + Sync>,
    pub next_request_id: Arc<dyn Fn(EndpointId) -> u64 + Send + Sync>,
}
