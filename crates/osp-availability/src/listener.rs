//! [`AvailabilityListener`]: per-receiver availability requesters plus the
//! cross-receiver observer registry (spec §4.G).
//!
//! Every method that calls into [`crate::AvailabilityIo`] (`connect`,
//! `write`) drops its own lock on [`Inner`] first. `ProtocolConnectionSubstrate::connect`
//! can invoke its callback synchronously (when reusing an already-open
//! connection, see `osp_transport::substrate`), and that callback needs to
//! take this same lock — holding it across the call would deadlock, the
//! same hazard `osp_demux` and `osp_rr` already document for their own
//! callback re-entrancy rules.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use osp_demux::{DemuxError, MessageCallback};
use osp_time::TimePoint;
use osp_transport::StreamHandle;
use osp_wire::codec::{decode_body_prefix, encode_body};
use osp_wire::{
    Endpoint, EndpointId, MessageType, PresentationUrlAvailabilityEvent,
    PresentationUrlAvailabilityRequest, PresentationUrlAvailabilityResponse, UrlAvailability,
    write_varint,
};

use crate::client::AvailabilityClient;
use crate::traits::{AvailabilityIo, AvailabilityObserver};
use crate::types::ObserverId;

type ObserverEntry = (ObserverId, Arc<Mutex<dyn AvailabilityObserver>>);

#[derive(Default)]
struct Inner {
    observers_by_url: HashMap<String, Vec<ObserverEntry>>,
    clients: HashMap<String, AvailabilityClient>,
}

#[derive(Clone)]
pub struct AvailabilityListener {
    inner: Arc<Mutex<Inner>>,
    io: AvailabilityIo,
}

impl AvailabilityListener {
    #[must_use]
    pub fn new(io: AvailabilityIo) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            io,
        }
    }

    /// A receiver became known (spec §4.G implicit precondition for every
    /// other operation; mirrors `OnScreenAdded`).
    pub fn on_receiver_added(&self, service_id: impl Into<String>, endpoint: Endpoint, now: TimePoint) {
        let service_id = service_id.into();
        let endpoint_id = (self.io.endpoint_id_for)(endpoint);
        let mut inner = self.inner.lock().expect("availability mutex poisoned");
        inner
            .clients
            .entry(service_id)
            .or_insert_with(|| AvailabilityClient::new(endpoint, endpoint_id, now));
    }

    /// `OnScreenRemoved`/receiver-removed (spec §4.G): fires
    /// `OnServiceUnavailable` for every URL previously `Compatible`, then
    /// drops the client (its `ConnectRequest`/watches cancel themselves on
    /// drop).
    pub fn on_receiver_removed(&self, service_id: &str) {
        let observers: Vec<(String, ObserverEntry)> = {
            let mut inner = self.inner.lock().expect("availability mutex poisoned");
            let Some(mut client) = inner.clients.remove(service_id) else {
                return;
            };
            let urls = client.take_compatible_urls();
            urls.iter()
                .flat_map(|url| {
                    inner
                        .observers_by_url
                        .get(url)
                        .into_iter()
                        .flatten()
                        .cloned()
                        .map(|entry| (url.clone(), entry))
                })
                .collect()
        };
        for (url, (_, observer)) in observers {
            observer
                .lock()
                .expect("observer mutex poisoned")
                .on_service_unavailable(&url, service_id);
        }
    }

    /// `AddObserver(urls, observer, now)` (spec §4.G).
    pub fn add_observer(
        &self,
        urls: &[String],
        observer_id: ObserverId,
        observer: Arc<Mutex<dyn AvailabilityObserver>>,
        now: TimePoint,
    ) {
        let mut immediate = Vec::new();
        let mut per_client_needed: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut inner = self.inner.lock().expect("availability mutex poisoned");
            for url in urls {
                inner
                    .observers_by_url
                    .entry(url.clone())
                    .or_default()
                    .push((observer_id, observer.clone()));
            }
            for (service_id, client) in &inner.clients {
                let mut needed = Vec::new();
                for url in urls {
                    match client.cached(url) {
                        Some(verdict) => immediate.push((url.clone(), service_id.clone(), verdict)),
                        None => needed.push(url.clone()),
                    }
                }
                if !needed.is_empty() {
                    per_client_needed.insert(service_id.clone(), needed);
                }
            }
        }

        for (url, service_id, verdict) in immediate {
            fire_verdict(&observer, &url, &service_id, verdict);
        }

        for (service_id, needed) in per_client_needed {
            self.queue_and_maybe_connect(&service_id, needed, now);
        }
    }

    /// `RemoveObserver(urls, observer)` (spec §4.G): URLs whose observer set
    /// becomes empty are forgotten by every client's cache and by any watch
    /// whose URL set is a subset of the dropped URLs (a watch covering a
    /// superset stays in place).
    pub fn remove_observer(&self, urls: &[String], observer_id: ObserverId) {
        let mut inner = self.inner.lock().expect("availability mutex poisoned");
        let mut dropped = HashSet::new();
        for url in urls {
            if let Some(list) = inner.observers_by_url.get_mut(url) {
                list.retain(|(id, _)| *id != observer_id);
                if list.is_empty() {
                    inner.observers_by_url.remove(url);
                    dropped.insert(url.clone());
                }
            }
        }
        if dropped.is_empty() {
            return;
        }
        for client in inner.clients.values_mut() {
            client.forget_urls(&dropped);
        }
    }

    /// `RefreshWatches(now)` (spec §4.G): ticks every client's TTLs,
    /// reissuing any watch that expired as a fresh request.
    pub fn refresh_watches(&self, now: TimePoint) {
        let service_ids: Vec<String> = {
            let inner = self.inner.lock().expect("availability mutex poisoned");
            inner.clients.keys().cloned().collect()
        };
        for service_id in service_ids {
            let expired = {
                let mut inner = self.inner.lock().expect("availability mutex poisoned");
                let Some(client) = inner.clients.get_mut(&service_id) else {
                    continue;
                };
                client.expire_watches(now)
            };
            for urls in expired {
                self.queue_and_maybe_connect(&service_id, urls, now);
            }
        }
    }

    fn queue_and_maybe_connect(&self, service_id: &str, urls: Vec<String>, now: TimePoint) {
        if urls.is_empty() {
            return;
        }
        let (need_connect, endpoint, stream) = {
            let mut inner = self.inner.lock().expect("availability mutex poisoned");
            let Some(client) = inner.clients.get_mut(service_id) else {
                return;
            };
            client.pending.push(urls);
            (
                client.stream.is_none() && client.connect_request.is_none(),
                client.endpoint,
                client.stream,
            )
        };

        if stream.is_some() {
            self.flush_pending(service_id);
            return;
        }
        if !need_connect {
            return;
        }

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let io = self.io.clone();
        let service_id_owned = service_id.to_owned();
        let callback = move |result: Result<StreamHandle, ()>| {
            let Some(inner) = weak.upgrade() else { return };
            match result {
                Ok(stream) => {
                    {
                        let mut guard = inner.lock().expect("availability mutex poisoned");
                        if let Some(client) = guard.clients.get_mut(&service_id_owned) {
                            client.stream = Some(stream);
                            client.connect_request = None;
                        }
                    }
                    flush_pending_static(&inner, &io, &service_id_owned);
                }
                Err(()) => {
                    let mut guard = inner.lock().expect("availability mutex poisoned");
                    if let Some(client) = guard.clients.get_mut(&service_id_owned) {
                        client.connect_request = None;
                        tracing::warn!(service_id = %service_id_owned, "availability connect failed, dropping pending requests");
                        client.pending.clear();
                    }
                }
            }
        };
        let connect_request = (self.io.connect)(endpoint, Box::new(callback));
        let mut inner = self.inner.lock().expect("availability mutex poisoned");
        if let Some(client) = inner.clients.get_mut(service_id) {
            client.connect_request = Some(connect_request);
        }
    }

    fn flush_pending(&self, service_id: &str) {
        flush_pending_static(&self.inner, &self.io, service_id);
    }
}

fn flush_pending_static(inner: &Arc<Mutex<Inner>>, io: &AvailabilityIo, service_id: &str) {
    let (stream, endpoint_id, pending, needs_response_watch, needs_event_watch) = {
        let mut guard = inner.lock().expect("availability mutex poisoned");
        let Some(client) = guard.clients.get_mut(service_id) else {
            return;
        };
        let Some(stream) = client.stream else {
            return;
        };
        (
            stream,
            client.endpoint_id,
            std::mem::take(&mut client.pending),
            client.response_watch.is_none(),
            client.event_watch.is_none(),
        )
    };

    if needs_response_watch {
        let watch = make_response_watch(inner, io, service_id, endpoint_id);
        let mut guard = inner.lock().expect("availability mutex poisoned");
        if let Some(client) = guard.clients.get_mut(service_id) {
            client.response_watch = Some(watch);
        }
    }
    if needs_event_watch {
        let watch = make_event_watch(inner, io, service_id, endpoint_id);
        let mut guard = inner.lock().expect("availability mutex poisoned");
        if let Some(client) = guard.clients.get_mut(service_id) {
            client.event_watch = Some(watch);
        }
    }

    for urls in pending {
        let mut guard = inner.lock().expect("availability mutex poisoned");
        let Some(client) = guard.clients.get_mut(service_id) else {
            return;
        };
        let request_id = (io.next_request_id)(endpoint_id);
        let watch_id = client.fresh_watch_id();
        client.register_watch(watch_id, urls.clone());
        client.requests.insert(request_id, urls.clone());
        drop(guard);

        let request = PresentationUrlAvailabilityRequest {
            request_id,
            watch_id,
            urls,
        };
        let Ok(body) = encode_body(&request) else {
            tracing::warn!(service_id, "failed to encode availability request");
            continue;
        };
        let mut framed = Vec::with_capacity(body.len() + 10);
        write_varint(MessageType::PresentationUrlAvailabilityRequest.as_u64(), &mut framed);
        framed.extend_from_slice(&body);
        if let Err(err) = (io.write)(stream, &framed) {
            tracing::warn!(service_id, %err, "availability request write failed");
        }
    }
}

fn make_response_watch(
    inner: &Arc<Mutex<Inner>>,
    io: &AvailabilityIo,
    service_id: &str,
    endpoint_id: EndpointId,
) -> osp_demux::MessageWatch {
    let weak: Weak<Mutex<Inner>> = Arc::downgrade(inner);
    let service_id = service_id.to_owned();
    let callback: MessageCallback = Box::new(move |_endpoint, _msg_type, body| {
        let (response, consumed): (PresentationUrlAvailabilityResponse, usize) = match decode_body_prefix(body) {
            Ok(v) => v,
            Err(err) => {
                return Err(DemuxError::Parsing {
                    consumed: body.len(),
                    detail: err.to_string(),
                });
            }
        };
        let Some(inner) = weak.upgrade() else {
            return Ok(consumed);
        };
        let changed = {
            let mut guard = inner.lock().expect("availability mutex poisoned");
            let Some(client) = guard.clients.get_mut(&service_id) else {
                return Ok(consumed);
            };
            let Some(urls) = client.requests.remove(&response.request_id) else {
                tracing::warn!(request_id = response.request_id, "unmatched availability response, ignoring");
                return Ok(consumed);
            };
            if urls.len() != response.url_availabilities.len() {
                tracing::warn!(
                    request_id = response.request_id,
                    "availability response url count mismatch, rejecting"
                );
                return Ok(consumed);
            }
            client.apply_verdicts(&urls, &response.url_availabilities)
        };
        fan_out_changes(&inner, &service_id, changed);
        Ok(consumed)
    });
    (io.watch_message)(endpoint_id, MessageType::PresentationUrlAvailabilityResponse, callback)
}

fn make_event_watch(
    inner: &Arc<Mutex<Inner>>,
    io: &AvailabilityIo,
    service_id: &str,
    endpoint_id: EndpointId,
) -> osp_demux::MessageWatch {
    let weak: Weak<Mutex<Inner>> = Arc::downgrade(inner);
    let service_id = service_id.to_owned();
    let callback: MessageCallback = Box::new(move |_endpoint, _msg_type, body| {
        let (event, consumed): (PresentationUrlAvailabilityEvent, usize) = match decode_body_prefix(body) {
            Ok(v) => v,
            Err(err) => {
                return Err(DemuxError::Parsing {
                    consumed: body.len(),
                    detail: err.to_string(),
                });
            }
        };
        let Some(inner) = weak.upgrade() else {
            return Ok(consumed);
        };
        let changed = {
            let mut guard = inner.lock().expect("availability mutex poisoned");
            let Some(client) = guard.clients.get_mut(&service_id) else {
                return Ok(consumed);
            };
            let Some(watch) = client.availability_watches.get(&event.watch_id) else {
                tracing::warn!(watch_id = event.watch_id, "unmatched availability event, ignoring");
                return Ok(consumed);
            };
            if watch.urls.len() != event.url_availabilities.len() {
                tracing::warn!(watch_id = event.watch_id, "availability event url count mismatch, rejecting");
                return Ok(consumed);
            }
            let urls = watch.urls.clone();
            client.apply_verdicts(&urls, &event.url_availabilities)
        };
        fan_out_changes(&inner, &service_id, changed);
        Ok(consumed)
    });
    (io.watch_message)(endpoint_id, MessageType::PresentationUrlAvailabilityEvent, callback)
}

fn fan_out_changes(inner: &Arc<Mutex<Inner>>, service_id: &str, changed: Vec<(String, UrlAvailability)>) {
    if changed.is_empty() {
        return;
    }
    let observers: Vec<(String, UrlAvailability, ObserverEntry)> = {
        let guard = inner.lock().expect("availability mutex poisoned");
        changed
            .into_iter()
            .flat_map(|(url, verdict)| {
                guard
                    .observers_by_url
                    .get(&url)
                    .into_iter()
                    .flatten()
                    .cloned()
                    .map(move |entry| (url.clone(), verdict, entry))
            })
            .collect()
    };
    for (url, verdict, (_, observer)) in observers {
        fire_verdict(&observer, &url, service_id, verdict);
    }
}

fn fire_verdict(observer: &Arc<Mutex<dyn AvailabilityObserver>>, url: &str, service_id: &str, verdict: UrlAvailability) {
    let mut observer = observer.lock().expect("observer mutex poisoned");
    match verdict {
        UrlAvailability::Compatible => observer.on_service_available(url, service_id),
        UrlAvailability::NotCompatible | UrlAvailability::NotValid => {
            observer.on_service_unavailable(url, service_id);
        }
    }
}
