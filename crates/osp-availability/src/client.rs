//! Per-receiver state (spec §4.G `AvailabilityClient`). Pure data plus
//! `&mut self` bookkeeping methods; connecting and writing bytes is the
//! listener's job, since it alone holds the injected [`crate::AvailabilityIo`].

use std::collections::HashMap;

use osp_time::{Duration, TimePoint};
use osp_transport::{ConnectRequest, StreamHandle};
use osp_wire::{Endpoint, EndpointId, UrlAvailability};

use crate::types::{AvailabilityWatch, default_watch_ttl};

pub(crate) struct AvailabilityClient {
    pub endpoint: Endpoint,
    pub endpoint_id: EndpointId,
    pub connect_request: Option<ConnectRequest>,
    pub stream: Option<StreamHandle>,
    pub next_watch_id: u64,
    /// URL batches not yet sent because no stream is open yet.
    pub pending: Vec<Vec<String>>,
    pub requests: HashMap<u64, Vec<String>>,
    pub availability_watches: HashMap<u64, AvailabilityWatch>,
    pub current_availabilities: HashMap<String, UrlAvailability>,
    pub response_watch: Option<osp_demux::MessageWatch>,
    pub event_watch: Option<osp_demux::MessageWatch>,
    pub last_update: TimePoint,
}

impl AvailabilityClient {
    pub fn new(endpoint: Endpoint, endpoint_id: EndpointId, now: TimePoint) -> Self {
        Self {
            endpoint,
            endpoint_id,
            connect_request: None,
            stream: None,
            next_watch_id: 1,
            pending: Vec::new(),
            requests: HashMap::new(),
            availability_watches: HashMap::new(),
            current_availabilities: HashMap::new(),
            response_watch: None,
            event_watch: None,
            last_update: now,
        }
    }

    pub fn fresh_watch_id(&mut self) -> u64 {
        let id = self.next_watch_id;
        self.next_watch_id += 1;
        id
    }

    pub fn cached(&self, url: &str) -> Option<UrlAvailability> {
        self.current_availabilities.get(url).copied()
    }

    /// Applies a decoded batch of verdicts against `urls` (request/response
    /// and event share this logic per spec §4.G: "identical semantics").
    /// Returns the URLs whose verdict changed, with their new verdict.
    pub fn apply_verdicts(&mut self, urls: &[String], verdicts: &[UrlAvailability]) -> Vec<(String, UrlAvailability)> {
        let mut changed = Vec::new();
        for (url, &verdict) in urls.iter().zip(verdicts.iter()) {
            let previous = self.current_availabilities.insert(url.clone(), verdict);
            if previous != Some(verdict) {
                changed.push((url.clone(), verdict));
            }
        }
        changed
    }

    /// `RefreshWatches(now)` for one client (spec §4.G): decrements every
    /// watch's TTL by elapsed time, removing and returning the ones that
    /// expired so the caller can reissue them as fresh requests.
    pub fn expire_watches(&mut self, now: TimePoint) -> Vec<Vec<String>> {
        let elapsed = now.saturating_duration_since(self.last_update);
        self.last_update = now;

        let mut expired = Vec::new();
        self.availability_watches.retain(|_, watch| {
            watch.remaining = watch.remaining - elapsed;
            if watch.remaining.is_negative() {
                expired.push(watch.urls.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn register_watch(&mut self, watch_id: u64, urls: Vec<String>) {
        self.availability_watches.insert(
            watch_id,
            AvailabilityWatch {
                remaining: default_watch_ttl(),
                urls,
            },
        );
    }

    /// Drops every URL previously marked [`UrlAvailability::Compatible`],
    /// returning them (spec §4.G "on receiver-removed").
    pub fn take_compatible_urls(&mut self) -> Vec<String> {
        let urls: Vec<String> = self
            .current_availabilities
            .iter()
            .filter(|(_, v)| **v == UrlAvailability::Compatible)
            .map(|(url, _)| url.clone())
            .collect();
        self.current_availabilities.clear();
        urls
    }

    /// Drops a watch only if its URL set is a subset of `dropped` (spec
    /// §4.G: a watch covering a superset of the dropped URLs stays in
    /// place).
    pub fn forget_urls(&mut self, dropped: &std::collections::HashSet<String>) {
        self.current_availabilities.retain(|url, _| !dropped.contains(url));
        self.availability_watches.retain(|_, watch| {
            !watch.urls.iter().all(|url| dropped.contains(url))
        });
    }

    #[cfg(test)]
    pub fn watch_remaining(&self, watch_id: u64) -> Option<Duration> {
        self.availability_watches.get(&watch_id).map(|w| w.remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn client() -> AvailabilityClient {
        AvailabilityClient::new(Endpoint::new(IpAddr::from([127, 0, 0, 1]), 9200), EndpointId::new(1), TimePoint::from_nanos(0))
    }

    #[test]
    fn forget_urls_drops_a_watch_that_is_a_proper_subset_of_the_dropped_urls() {
        let mut client = client();
        client.register_watch(1, vec!["https://a.example/".to_string()]);

        let dropped: std::collections::HashSet<String> = ["https://a.example/".to_string(), "https://b.example/".to_string()].into_iter().collect();
        client.forget_urls(&dropped);

        assert_eq!(client.watch_remaining(1), None, "watch covering only a subset of the dropped urls must be forgotten");
    }

    #[test]
    fn forget_urls_keeps_a_watch_that_is_a_superset_of_the_dropped_urls() {
        let mut client = client();
        client.register_watch(1, vec!["https://a.example/".to_string(), "https://b.example/".to_string(), "https://c.example/".to_string()]);

        let dropped: std::collections::HashSet<String> = ["https://a.example/".to_string(), "https://b.example/".to_string()].into_iter().collect();
        client.forget_urls(&dropped);

        assert!(client.watch_remaining(1).is_some(), "watch covering a superset of the dropped urls must stay in place");
    }
}
