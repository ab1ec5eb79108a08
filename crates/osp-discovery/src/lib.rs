//! mDNS discovery aggregator (spec §4.C): merges PTR/SRV/TXT/A/AAAA events
//! into stable [`DiscoveredService`] records and tells a [`QueryController`]
//! which queries to start and stop as instances and hosts are discovered
//! and torn down.
//!
//! Parsing the mDNS wire format and driving real sockets is out of scope
//! (spec §1 non-goals) — this crate only defines and aggregates the event
//! interface a concrete responder would feed it.

mod aggregator;
mod traits;
mod types;

pub use aggregator::{
    DEFAULT_MAX_ITERATIONS, DiscoveryAggregator, EventBatch, MdnsEventSource,
    default_max_wall_clock,
};
pub use traits::{DiscoveryObserver, NullQueryController, QueryController};
pub use types::{
    AEvent, AaaaEvent, DiscoveredService, HostKey, PtrEvent, ResponseType, SocketId, SrvEvent,
    TxtEvent,
};

#[cfg(test)]
mod tests {
    use super::*;
    use osp_time::{Clock, SystemClock};
    use osp_wire::InstanceKey;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[derive(Default)]
    struct RecordingObserver {
        added: Vec<DiscoveredService>,
        changed: Vec<DiscoveredService>,
        removed: Vec<DiscoveredService>,
        all_removed: u32,
    }

    impl DiscoveryObserver for RecordingObserver {
        fn on_service_added(&mut self, service: &DiscoveredService) {
            self.added.push(service.clone());
        }
        fn on_service_changed(&mut self, service: &DiscoveredService) {
            self.changed.push(service.clone());
        }
        fn on_service_removed(&mut self, service: &DiscoveredService) {
            self.removed.push(service.clone());
        }
        fn on_all_services_removed(&mut self) {
            self.all_removed += 1;
        }
    }

    #[derive(Default)]
    struct RecordingQueryController {
        srv_started: Vec<InstanceKey>,
        srv_stopped: Vec<InstanceKey>,
        addr_started: Vec<HostKey>,
        addr_stopped: Vec<HostKey>,
    }

    impl QueryController for RecordingQueryController {
        fn start_srv_query(&mut self, _socket: SocketId, instance: &InstanceKey) {
            self.srv_started.push(instance.clone());
        }
        fn stop_srv_query(&mut self, _socket: SocketId, instance: &InstanceKey) {
            self.srv_stopped.push(instance.clone());
        }
        fn start_txt_query(&mut self, _socket: SocketId, _instance: &InstanceKey) {}
        fn stop_txt_query(&mut self, _socket: SocketId, _instance: &InstanceKey) {}
        fn start_address_queries(&mut self, host_key: &HostKey) {
            self.addr_started.push(host_key.clone());
        }
        fn stop_address_queries(&mut self, host_key: &HostKey) {
            self.addr_stopped.push(host_key.clone());
        }
    }

    fn key(name: &str) -> InstanceKey {
        InstanceKey::from_bytes(name.as_bytes().to_vec())
    }

    const SOCKET: SocketId = SocketId(1);

    fn complete_batch(instance: InstanceKey, host_domain: &[u8], port: u16) -> EventBatch {
        EventBatch {
            ptr: vec![PtrEvent {
                socket: SOCKET,
                response_type: ResponseType::Added,
                instance: instance.clone(),
            }],
            srv: vec![SrvEvent {
                socket: SOCKET,
                response_type: ResponseType::Added,
                instance: instance.clone(),
                host_domain: host_domain.to_vec(),
                port,
            }],
            txt: vec![TxtEvent {
                socket: SOCKET,
                response_type: ResponseType::Added,
                instance: instance.clone(),
                txt_lines: vec![b"fn=Living Room TV".to_vec()],
            }],
            a: vec![AEvent {
                socket: SOCKET,
                response_type: ResponseType::Added,
                host_domain: host_domain.to_vec(),
                addr: Ipv4Addr::new(192, 168, 1, 42),
            }],
            aaaa: vec![],
        }
    }

    #[test]
    fn full_record_emits_added_with_friendly_name() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        let batch = complete_batch(key("tv"), b"tv.local", 8009);
        agg.apply_batch(&batch, &mut qc);
        agg.evaluate_pending(&mut obs);

        assert_eq!(obs.added.len(), 1);
        assert_eq!(obs.added[0].friendly_name.as_deref(), Some("Living Room TV"));
        assert_eq!(obs.added[0].v4_endpoint, Some((Ipv4Addr::new(192, 168, 1, 42), 8009)));
        assert_eq!(qc.srv_started, vec![key("tv")]);
        assert_eq!(qc.addr_started.len(), 1);
    }

    #[test]
    fn partial_record_emits_nothing() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        agg.apply_batch(
            &EventBatch {
                ptr: vec![PtrEvent {
                    socket: SOCKET,
                    response_type: ResponseType::Added,
                    instance: key("tv"),
                }],
                ..Default::default()
            },
            &mut qc,
        );
        agg.evaluate_pending(&mut obs);

        assert!(obs.added.is_empty());
        assert_eq!(qc.srv_started, vec![key("tv")], "PTR-add still triggers SRV/TXT queries");
    }

    #[test]
    fn added_no_cache_is_a_no_op() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        agg.apply_batch(
            &EventBatch {
                ptr: vec![PtrEvent {
                    socket: SOCKET,
                    response_type: ResponseType::AddedNoCache,
                    instance: key("tv"),
                }],
                ..Default::default()
            },
            &mut qc,
        );
        agg.evaluate_pending(&mut obs);

        assert!(qc.srv_started.is_empty());
        assert!(obs.added.is_empty());
    }

    #[test]
    fn ptr_removal_with_no_srv_drops_instance_and_queries() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        agg.apply_batch(
            &EventBatch {
                ptr: vec![PtrEvent {
                    socket: SOCKET,
                    response_type: ResponseType::Added,
                    instance: key("tv"),
                }],
                ..Default::default()
            },
            &mut qc,
        );
        agg.apply_batch(
            &EventBatch {
                ptr: vec![PtrEvent {
                    socket: SOCKET,
                    response_type: ResponseType::Removed,
                    instance: key("tv"),
                }],
                ..Default::default()
            },
            &mut qc,
        );
        agg.evaluate_pending(&mut obs);

        assert_eq!(qc.srv_stopped, vec![key("tv")]);
        assert_eq!(agg.known_service_count(), 0);
    }

    #[test]
    fn full_lifecycle_add_then_remove_emits_add_then_remove() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        agg.apply_batch(&complete_batch(key("tv"), b"tv.local", 8009), &mut qc);
        agg.evaluate_pending(&mut obs);
        assert_eq!(obs.added.len(), 1);

        agg.apply_batch(
            &EventBatch {
                ptr: vec![PtrEvent {
                    socket: SOCKET,
                    response_type: ResponseType::Removed,
                    instance: key("tv"),
                }],
                ..Default::default()
            },
            &mut qc,
        );
        agg.evaluate_pending(&mut obs);

        assert_eq!(obs.removed.len(), 1);
        assert_eq!(obs.removed[0].service_id, key("tv"));
    }

    #[test]
    fn changed_record_emits_changed_not_added_again() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        agg.apply_batch(&complete_batch(key("tv"), b"tv.local", 8009), &mut qc);
        agg.evaluate_pending(&mut obs);

        agg.apply_batch(
            &EventBatch {
                a: vec![AEvent {
                    socket: SOCKET,
                    response_type: ResponseType::Added,
                    host_domain: b"tv.local".to_vec(),
                    addr: Ipv4Addr::new(10, 0, 0, 9),
                }],
                ..Default::default()
            },
            &mut qc,
        );
        agg.evaluate_pending(&mut obs);

        assert_eq!(obs.added.len(), 1, "no duplicate add");
        assert_eq!(obs.changed.len(), 1);
        assert_eq!(obs.changed[0].v4_endpoint, Some((Ipv4Addr::new(10, 0, 0, 9), 8009)));
    }

    #[test]
    fn identical_re_emission_is_suppressed() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        let batch = complete_batch(key("tv"), b"tv.local", 8009);
        agg.apply_batch(&batch.clone(), &mut qc);
        agg.evaluate_pending(&mut obs);
        agg.apply_batch(&batch, &mut qc);
        agg.evaluate_pending(&mut obs);

        assert_eq!(obs.added.len(), 1);
        assert_eq!(obs.changed.len(), 0, "re-applying the same facts changes nothing");
    }

    #[test]
    fn srv_event_from_non_canonical_socket_is_ignored() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        agg.apply_batch(
            &EventBatch {
                ptr: vec![PtrEvent {
                    socket: SocketId(1),
                    response_type: ResponseType::Added,
                    instance: key("tv"),
                }],
                ..Default::default()
            },
            &mut qc,
        );
        agg.apply_batch(
            &EventBatch {
                srv: vec![SrvEvent {
                    socket: SocketId(2),
                    response_type: ResponseType::Added,
                    instance: key("tv"),
                    host_domain: b"tv.local".to_vec(),
                    port: 8009,
                }],
                ..Default::default()
            },
            &mut qc,
        );
        agg.evaluate_pending(&mut obs);

        assert!(obs.added.is_empty(), "SRV from a foreign socket must not complete the record");
    }

    #[test]
    fn two_instances_sharing_a_host_share_the_host_record() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        agg.apply_batch(&complete_batch(key("a"), b"shared.local", 1111), &mut qc);
        agg.apply_batch(&complete_batch(key("b"), b"shared.local", 2222), &mut qc);
        agg.evaluate_pending(&mut obs);

        assert_eq!(qc.addr_started.len(), 1, "second SRV reuses the existing host record");
        assert_eq!(obs.added.len(), 2);

        agg.apply_batch(
            &EventBatch {
                ptr: vec![PtrEvent {
                    socket: SOCKET,
                    response_type: ResponseType::Removed,
                    instance: key("a"),
                }],
                srv: vec![SrvEvent {
                    socket: SOCKET,
                    response_type: ResponseType::Removed,
                    instance: key("a"),
                    host_domain: b"shared.local".to_vec(),
                    port: 1111,
                }],
                ..Default::default()
            },
            &mut qc,
        );
        agg.evaluate_pending(&mut obs);

        assert!(qc.addr_stopped.is_empty(), "host record still has instance b depending on it");
    }

    #[test]
    fn reset_emits_one_all_services_removed_event() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();

        agg.apply_batch(&complete_batch(key("tv"), b"tv.local", 8009), &mut qc);
        agg.evaluate_pending(&mut obs);
        assert_eq!(agg.known_service_count(), 1);

        agg.reset(&mut obs);
        assert_eq!(obs.all_removed, 1);
        assert_eq!(agg.known_service_count(), 0);
    }

    struct ScriptedSource {
        batches: std::collections::VecDeque<EventBatch>,
    }
    impl MdnsEventSource for ScriptedSource {
        fn next_batch(&mut self) -> Option<EventBatch> {
            self.batches.pop_front()
        }
    }

    #[test]
    fn run_until_quiescent_drains_a_scripted_source() {
        let mut agg = DiscoveryAggregator::new();
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();
        let clock = SystemClock::new();

        let mut source = ScriptedSource {
            batches: std::collections::VecDeque::from(vec![
                EventBatch {
                    ptr: vec![PtrEvent {
                        socket: SOCKET,
                        response_type: ResponseType::Added,
                        instance: key("tv"),
                    }],
                    ..Default::default()
                },
                complete_batch(key("tv"), b"tv.local", 8009),
            ]),
        };

        agg.run_until_quiescent(&mut qc, &mut source, &mut obs, &clock);

        assert_eq!(obs.added.len(), 1);
        assert!(source.batches.is_empty());
    }

    #[test]
    fn loop_bound_stops_an_unbounded_source_and_still_evaluates() {
        let mut agg = DiscoveryAggregator::with_bounds(3, osp_time::Duration::from_secs(60));
        let mut qc = RecordingQueryController::default();
        let mut obs = RecordingObserver::default();
        let clock = SystemClock::new();

        struct InfiniteSource {
            instance: InstanceKey,
        }
        impl MdnsEventSource for InfiniteSource {
            fn next_batch(&mut self) -> Option<EventBatch> {
                Some(EventBatch {
                    ptr: vec![PtrEvent {
                        socket: SocketId(1),
                        response_type: ResponseType::Added,
                        instance: self.instance.clone(),
                    }],
                    ..Default::default()
                })
            }
        }
        let mut source = InfiniteSource { instance: key("tv") };

        // Would hang without the iteration bound.
        agg.run_until_quiescent(&mut qc, &mut source, &mut obs, &clock);
        assert_eq!(qc.srv_started.len(), 1, "PTR-add is idempotent across repeated batches");
    }
}
