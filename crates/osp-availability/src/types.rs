//! Shared small types for the availability requester (spec §4.G).

use osp_time::Duration;

/// Default TTL for a server-side availability subscription the receiver
/// honors (spec §4.G: "TTL defaults to 20 seconds").
#[must_use]
pub fn default_watch_ttl() -> Duration {
    Duration::from_secs(20)
}

/// A caller-chosen identity for an [`crate::AvailabilityObserver`]
/// registration, used to match up `RemoveObserver` calls (Rust has no
/// pointer-identity equivalent for trait objects, so the caller supplies
/// one, the same way `osp_rr`'s `caller_local_id` stands in for a C++
/// request handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

/// A server-side subscription the receiver honors until `remaining`
/// expires (spec §4.G).
#[derive(Debug, Clone)]
pub(crate) struct AvailabilityWatch {
    pub remaining: Duration,
    pub urls: Vec<String>,
}
