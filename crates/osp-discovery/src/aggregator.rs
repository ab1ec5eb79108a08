//! The aggregator itself: folds PTR/SRV/TXT/A/AAAA events into
//! [`DiscoveredService`] add/change/remove notifications (spec §4.C).

use std::collections::{HashMap, HashSet};

use osp_time::{Clock, Duration as OspDuration};
use osp_wire::InstanceKey;

use crate::traits::{DiscoveryObserver, QueryController};
use crate::types::{
    AEvent, AaaaEvent, DiscoveredService, HostKey, HostRecordState, PtrEvent, ResponseType,
    ServiceInstanceState, SocketId, SrvEvent, TxtEvent, friendly_name_from_txt,
};

/// One round of events pulled from the five mDNS streams. An empty batch
/// (all vecs empty) still counts as "more events may be pending" — it's
/// [`MdnsEventSource::next_batch`] returning `None` that signals quiescence.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub ptr: Vec<PtrEvent>,
    pub srv: Vec<SrvEvent>,
    pub txt: Vec<TxtEvent>,
    pub a: Vec<AEvent>,
    pub aaaa: Vec<AaaaEvent>,
}

impl EventBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptr.is_empty()
            && self.srv.is_empty()
            && self.txt.is_empty()
            && self.a.is_empty()
            && self.aaaa.is_empty()
    }
}

/// Feeds the aggregator's `run_until_quiescent` loop. `next_batch` returning
/// `None` means the responder has no further events pending right now —
/// analogous to the original's `RunTasks()` returning no more work.
pub trait MdnsEventSource {
    fn next_batch(&mut self) -> Option<EventBatch>;
}

/// Default quiescence-loop bound (spec §9 Open Question): resolved as 64
/// iterations or 250ms of wall-clock time, whichever comes first.
pub const DEFAULT_MAX_ITERATIONS: u32 = 64;
#[must_use]
pub fn default_max_wall_clock() -> OspDuration {
    OspDuration::from_millis(250)
}

/// Merges mDNS PTR/SRV/TXT/A/AAAA events into stable [`DiscoveredService`]
/// records, issuing query start/stop calls as instances and hosts enter and
/// leave states that need active querying.
pub struct DiscoveryAggregator {
    instances: HashMap<InstanceKey, ServiceInstanceState>,
    hosts: HashMap<HostKey, HostRecordState>,
    pending: HashSet<InstanceKey>,
    emitted: HashMap<InstanceKey, DiscoveredService>,
    max_iterations: u32,
    max_wall_clock: OspDuration,
}

impl Default for DiscoveryAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: HashMap::new(),
            hosts: HashMap::new(),
            pending: HashSet::new(),
            emitted: HashMap::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_wall_clock: default_max_wall_clock(),
        }
    }

    #[must_use]
    pub fn with_bounds(max_iterations: u32, max_wall_clock: OspDuration) -> Self {
        Self {
            max_iterations,
            max_wall_clock,
            ..Self::new()
        }
    }

    #[must_use]
    pub fn known_service_count(&self) -> usize {
        self.emitted.len()
    }

    /// Drain `source` into [`Self::apply_batch`] until it reports no further
    /// events pending, or the loop bound is hit, then evaluate and publish
    /// every instance left dirty by the batches just applied.
    pub fn run_until_quiescent<Q: QueryController, S: MdnsEventSource, O: DiscoveryObserver>(
        &mut self,
        query_controller: &mut Q,
        source: &mut S,
        observer: &mut O,
        clock: &dyn Clock,
    ) {
        let start = clock.now();
        let mut iterations: u32 = 0;
        while let Some(batch) = source.next_batch() {
            self.apply_batch(&batch, query_controller);
            iterations += 1;
            let elapsed = clock.now().saturating_duration_since(start);
            if iterations >= self.max_iterations || elapsed >= self.max_wall_clock {
                tracing::warn!(
                    iterations,
                    elapsed_ns = elapsed.as_nanos(),
                    "discovery aggregator loop bound hit, evaluating pending instances early"
                );
                break;
            }
        }
        self.evaluate_pending(observer);
    }

    /// Apply one batch of events without evaluating pending instances —
    /// exposed directly for tests that want to control evaluation timing.
    pub fn apply_batch<Q: QueryController>(&mut self, batch: &EventBatch, qc: &mut Q) {
        for e in &batch.ptr {
            self.handle_ptr(e, qc);
        }
        for e in &batch.srv {
            self.handle_srv(e, qc);
        }
        for e in &batch.txt {
            self.handle_txt(e);
        }
        for e in &batch.a {
            self.handle_a(e);
        }
        for e in &batch.aaaa {
            self.handle_aaaa(e);
        }
    }

    fn handle_ptr<Q: QueryController>(&mut self, e: &PtrEvent, qc: &mut Q) {
        if e.response_type == ResponseType::AddedNoCache {
            return;
        }
        match e.response_type {
            ResponseType::Added => {
                let instance = self
                    .instances
                    .entry(e.instance.clone())
                    .or_insert_with(ServiceInstanceState::default);
                let was_present = instance.ptr_present;
                instance.ptr_present = true;
                instance.bound_socket = Some(e.socket);
                if !was_present {
                    qc.start_srv_query(e.socket, &e.instance);
                    qc.start_txt_query(e.socket, &e.instance);
                }
                self.pending.insert(e.instance.clone());
            }
            ResponseType::Removed => {
                if let Some(instance) = self.instances.get_mut(&e.instance) {
                    instance.ptr_present = false;
                    if !instance.has_srv() {
                        if let Some(socket) = instance.bound_socket {
                            qc.stop_srv_query(socket, &e.instance);
                            qc.stop_txt_query(socket, &e.instance);
                        }
                    }
                    self.pending.insert(e.instance.clone());
                }
            }
            ResponseType::AddedNoCache => unreachable!("filtered above"),
        }
    }

    fn handle_srv<Q: QueryController>(&mut self, e: &SrvEvent, qc: &mut Q) {
        if e.response_type == ResponseType::AddedNoCache {
            return;
        }
        let Some(instance) = self.instances.get_mut(&e.instance) else {
            tracing::debug!(instance = ?e.instance, "SRV event for unknown instance ignored");
            return;
        };
        // PTR's socket is canonical; a SRV event answered on a different
        // socket than the PTR that created the instance is dropped.
        if instance.bound_socket.is_some_and(|s| s != e.socket) {
            tracing::debug!(instance = ?e.instance, "SRV event from non-canonical socket ignored");
            return;
        }

        match e.response_type {
            ResponseType::Added => {
                instance.host_domain = e.host_domain.clone();
                instance.port = e.port;
                let host_key = HostKey {
                    socket: e.socket,
                    host_domain: e.host_domain.clone(),
                };
                instance.host_key = Some(host_key.clone());
                let is_new_host = !self.hosts.contains_key(&host_key);
                let host = self.hosts.entry(host_key.clone()).or_default();
                host.dependent_instances.insert(e.instance.clone());
                if is_new_host {
                    qc.start_address_queries(&host_key);
                }
                self.pending.insert(e.instance.clone());
            }
            ResponseType::Removed => {
                if let Some(host_key) = instance.host_key.take() {
                    instance.host_domain.clear();
                    instance.port = 0;
                    if let Some(host) = self.hosts.get_mut(&host_key) {
                        host.dependent_instances.remove(&e.instance);
                        if host.dependent_instances.is_empty() {
                            qc.stop_address_queries(&host_key);
                            self.hosts.remove(&host_key);
                        }
                    }
                }
                self.pending.insert(e.instance.clone());
            }
            ResponseType::AddedNoCache => unreachable!("filtered above"),
        }
    }

    fn handle_txt(&mut self, e: &TxtEvent) {
        if e.response_type == ResponseType::AddedNoCache {
            return;
        }
        let Some(instance) = self.instances.get_mut(&e.instance) else {
            tracing::debug!(instance = ?e.instance, "TXT event for unknown instance ignored");
            return;
        };
        match e.response_type {
            ResponseType::Added => instance.txt_lines = e.txt_lines.clone(),
            ResponseType::Removed => instance.txt_lines.clear(),
            ResponseType::AddedNoCache => unreachable!("filtered above"),
        }
        self.pending.insert(e.instance.clone());
    }

    fn handle_a(&mut self, e: &AEvent) {
        if e.response_type == ResponseType::AddedNoCache {
            return;
        }
        let host_key = HostKey {
            socket: e.socket,
            host_domain: e.host_domain.clone(),
        };
        let Some(host) = self.hosts.get_mut(&host_key) else {
            tracing::debug!(?host_key, "A event for unknown host ignored");
            return;
        };
        host.v4_addr = match e.response_type {
            ResponseType::Added => Some(e.addr),
            ResponseType::Removed => None,
            ResponseType::AddedNoCache => unreachable!("filtered above"),
        };
        self.pending.extend(host.dependent_instances.iter().cloned());
    }

    fn handle_aaaa(&mut self, e: &AaaaEvent) {
        if e.response_type == ResponseType::AddedNoCache {
            return;
        }
        let host_key = HostKey {
            socket: e.socket,
            host_domain: e.host_domain.clone(),
        };
        let Some(host) = self.hosts.get_mut(&host_key) else {
            tracing::debug!(?host_key, "AAAA event for unknown host ignored");
            return;
        };
        host.v6_addr = match e.response_type {
            ResponseType::Added => Some(e.addr),
            ResponseType::Removed => None,
            ResponseType::AddedNoCache => unreachable!("filtered above"),
        };
        self.pending.extend(host.dependent_instances.iter().cloned());
    }

    /// Re-evaluate every instance touched since the last evaluation,
    /// emitting add/change/remove notifications and garbage-collecting
    /// instances that no longer have a PTR or a remembered SRV.
    pub fn evaluate_pending<O: DiscoveryObserver>(&mut self, observer: &mut O) {
        let pending: Vec<InstanceKey> = self.pending.drain().collect();

        for key in pending {
            let Some(instance) = self.instances.get(&key) else {
                continue;
            };

            let host = instance.host_key.as_ref().and_then(|hk| self.hosts.get(hk));
            let complete = instance.ptr_present
                && instance.has_srv()
                && instance.port != 0
                && !instance.txt_lines.is_empty()
                && host.is_some_and(|h| h.v4_addr.is_some() || h.v6_addr.is_some());

            if complete {
                let host = host.expect("checked above");
                let service = DiscoveredService {
                    service_id: key.clone(),
                    friendly_name: friendly_name_from_txt(&instance.txt_lines),
                    v4_endpoint: host.v4_addr.map(|a| (a, instance.port)),
                    v6_endpoint: host.v6_addr.map(|a| (a, instance.port)),
                };
                match self.emitted.get(&key) {
                    None => {
                        observer.on_service_added(&service);
                        self.emitted.insert(key.clone(), service);
                    }
                    Some(previous) if previous != &service => {
                        observer.on_service_changed(&service);
                        self.emitted.insert(key.clone(), service);
                    }
                    Some(_) => {}
                }
            } else if let Some(previous) = self.emitted.remove(&key) {
                observer.on_service_removed(&previous);
            }

            if !instance.ptr_present && !instance.has_srv() {
                self.instances.remove(&key);
            }
        }
    }

    /// Tear down all state at once (listener/publisher shutdown, spec
    /// §4.C): one aggregate notification rather than one remove per service.
    pub fn reset<O: DiscoveryObserver>(&mut self, observer: &mut O) {
        let had_services = !self.emitted.is_empty();
        self.instances.clear();
        self.hosts.clear();
        self.pending.clear();
        self.emitted.clear();
        if had_services {
            observer.on_all_services_removed();
        }
    }
}
