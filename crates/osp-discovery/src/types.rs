//! Record shapes the aggregator builds up from mDNS events (spec §3, §4.C).

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use osp_wire::InstanceKey;

/// Identifies the bound socket (and therefore network interface) an mDNS
/// event arrived on. Opaque — the concrete mDNS responder's socket/interface
/// bookkeeping is out of scope (spec §1 non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

/// Whether an event adds a fresh record, clears one, or is a cache hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Added,
    Removed,
    /// Hint that a record exists in the responder's cache but was not
    /// freshly queried for. A no-op for record construction (spec §4.C).
    AddedNoCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtrEvent {
    pub socket: SocketId,
    pub response_type: ResponseType,
    pub instance: InstanceKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvEvent {
    pub socket: SocketId,
    pub response_type: ResponseType,
    pub instance: InstanceKey,
    pub host_domain: Vec<u8>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtEvent {
    pub socket: SocketId,
    pub response_type: ResponseType,
    pub instance: InstanceKey,
    pub txt_lines: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AEvent {
    pub socket: SocketId,
    pub response_type: ResponseType,
    pub host_domain: Vec<u8>,
    pub addr: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AaaaEvent {
    pub socket: SocketId,
    pub response_type: ResponseType,
    pub host_domain: Vec<u8>,
    pub addr: Ipv6Addr,
}

/// Key identifying a host's A/AAAA record set: the same domain queried on
/// two different sockets is tracked as two independent hosts, matching the
/// per-socket scoping of the SRV query that discovered it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub socket: SocketId,
    pub host_domain: Vec<u8>,
}

/// Accumulated state for one `InstanceKey` between a PTR-Added event and the
/// point its record is complete enough to publish (spec §3's `ServiceInstance`).
#[derive(Debug, Clone, Default)]
pub(crate) struct ServiceInstanceState {
    pub ptr_present: bool,
    pub bound_socket: Option<SocketId>,
    pub host_domain: Vec<u8>,
    pub port: u16,
    pub txt_lines: Vec<Vec<u8>>,
    pub host_key: Option<HostKey>,
}

impl ServiceInstanceState {
    pub(crate) fn has_srv(&self) -> bool {
        !self.host_domain.is_empty()
    }
}

/// Accumulated A/AAAA state for one `HostKey` (spec §3's `HostRecord`).
/// `dependent_instances` is the "unordered multiset" spec.md describes;
/// a `HashSet` is sufficient since each instance only ever names one host.
#[derive(Debug, Clone, Default)]
pub(crate) struct HostRecordState {
    pub v4_addr: Option<Ipv4Addr>,
    pub v6_addr: Option<Ipv6Addr>,
    pub dependent_instances: HashSet<InstanceKey>,
}

/// The fully-formed service record handed to [`crate::DiscoveryObserver`]
/// once every constituent record is present (spec §4.C's invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub service_id: InstanceKey,
    pub friendly_name: Option<String>,
    pub v4_endpoint: Option<(Ipv4Addr, u16)>,
    pub v6_endpoint: Option<(Ipv6Addr, u16)>,
}

/// Parses the conventional `fn=<name>` TXT line (spec §3 friendly name)
/// out of the raw TXT record lines, if present.
pub(crate) fn friendly_name_from_txt(txt_lines: &[Vec<u8>]) -> Option<String> {
    for line in txt_lines {
        if let Some(rest) = line.strip_prefix(b"fn=") {
            return Some(String::from_utf8_lossy(rest).into_owned());
        }
    }
    None
}
