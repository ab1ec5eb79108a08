//! Per-receiver URL-availability requester (spec §4.G): lazily-connected
//! availability requests, TTL-refreshed server-side watches, and a
//! duplicate-suppressing observer registry shared across every known
//! receiver.

mod client;
mod listener;
mod traits;
mod types;

pub use listener::AvailabilityListener;
pub use traits::{AvailabilityIo, AvailabilityObserver};
pub use types::{ObserverId, default_watch_ttl};

#[cfg(test)]
mod tests {
    use super::*;
    use osp_demux::MessageDemuxer;
    use osp_time::TimePoint;
    use osp_transport::{ConnectRequest, ConnectionRequestCallback, ProtocolConnectionSubstrate, StreamHandle, Transport, TransportError};
    use osp_wire::{Endpoint, EndpointId, MessageType, UrlAvailability};
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeTransport {
        next_stream: u64,
        open_streams: HashMap<StreamHandle, osp_transport::ConnectionHandle>,
    }

    impl Transport for FakeTransport {
        fn start_connect(&mut self, _endpoint: Endpoint, _attempt_id: u64) {}
        fn cancel_connect(&mut self, _attempt_id: u64) {}
        fn open_stream(&mut self, connection: osp_transport::ConnectionHandle) -> Option<StreamHandle> {
            let stream = StreamHandle(self.next_stream);
            self.next_stream += 1;
            self.open_streams.insert(stream, connection);
            Some(stream)
        }
        fn write(&mut self, stream: StreamHandle, bytes: &[u8]) -> Result<(), TransportError> {
            let _ = bytes;
            if self.open_streams.contains_key(&stream) {
                Ok(())
            } else {
                Err(TransportError::StreamClosed)
            }
        }
        fn close_stream(&mut self, stream: StreamHandle) {
            self.open_streams.remove(&stream);
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        available: Vec<(String, String)>,
        unavailable: Vec<(String, String)>,
    }

    impl AvailabilityObserver for RecordingObserver {
        fn on_service_available(&mut self, url: &str, service_id: &str) {
            self.available.push((url.to_owned(), service_id.to_owned()));
        }
        fn on_service_unavailable(&mut self, url: &str, service_id: &str) {
            self.unavailable.push((url.to_owned(), service_id.to_owned()));
        }
    }

    /// Wires an `AvailabilityListener` to a real `MessageDemuxer` +
    /// `ProtocolConnectionSubstrate<FakeTransport>` so a connect call always
    /// succeeds synchronously (the substrate's own `connect` immediately
    /// opens a stream against `FakeTransport`, no async event needed), and
    /// returns a way to push a response/event onto the wire.
    fn harness(endpoint_port: u16) -> (AvailabilityListener, Endpoint, impl Fn(MessageType, Vec<u8>)) {
        let demuxer = MessageDemuxer::new();
        let substrate = ProtocolConnectionSubstrate::new(FakeTransport::default());
        let endpoint = Endpoint::new(IpAddr::from([127, 0, 0, 1]), endpoint_port);

        // Pre-establish the connection so `connect()` reuses it synchronously.
        let endpoint_id = substrate.endpoint_id_for(endpoint);
        substrate.on_connection_established(1, endpoint, osp_transport::ConnectionHandle(1));

        let substrate_connect = substrate.clone();
        let substrate_write = substrate.clone();
        let substrate_next_id = substrate.clone();
        let substrate_endpoint_id = substrate.clone();
        let demuxer_watch = demuxer.clone();

        let io = AvailabilityIo {
            connect: Arc::new(move |endpoint, callback: Box<dyn ConnectionRequestCallback>| -> ConnectRequest {
                substrate_connect.connect(endpoint, callback)
            }),
            write: Arc::new(move |stream, bytes| substrate_write.write(stream, bytes).map_err(|e| e.to_string())),
            watch_message: Arc::new(move |endpoint, msg_type, callback| demuxer_watch.watch_message_type(endpoint, msg_type, callback)),
            endpoint_id_for: Arc::new(move |endpoint| substrate_endpoint_id.endpoint_id_for(endpoint)),
            next_request_id: Arc::new(move |endpoint_id| substrate_next_id.next_request_id(endpoint_id)),
        };

        let listener = AvailabilityListener::new(io);
        let deliver_demuxer = demuxer;
        let deliver = move |msg_type: MessageType, body: Vec<u8>| {
            let mut framed = Vec::new();
            osp_wire::write_varint(msg_type.as_u64(), &mut framed);
            framed.extend_from_slice(&body);
            deliver_demuxer.on_bytes(endpoint_id, osp_wire::StreamId::new(1), &framed);
        };
        (listener, endpoint, deliver)
    }

    fn now() -> TimePoint {
        TimePoint::from_nanos(0)
    }

    #[test]
    fn add_observer_without_cache_issues_a_request_and_fires_on_response() {
        let (listener, endpoint, deliver) = harness(9100);
        listener.on_receiver_added("recv-1", endpoint, now());

        let observer = Arc::new(Mutex::new(RecordingObserver::default()));
        listener.add_observer(
            &["https://example.com/app".to_string()],
            ObserverId(1),
            observer.clone(),
            now(),
        );
        assert!(observer.lock().unwrap().available.is_empty());

        let response = osp_wire::PresentationUrlAvailabilityResponse {
            request_id: 1,
            url_availabilities: vec![UrlAvailability::Compatible],
        };
        deliver(
            MessageType::PresentationUrlAvailabilityResponse,
            osp_wire::codec::encode_body(&response).unwrap(),
        );

        let observer = observer.lock().unwrap();
        assert_eq!(observer.available, vec![("https://example.com/app".to_string(), "recv-1".to_string())]);
    }

    #[test]
    fn add_observer_with_cached_verdict_fires_immediately() {
        let (listener, endpoint, deliver) = harness(9101);
        listener.on_receiver_added("recv-1", endpoint, now());

        let first = Arc::new(Mutex::new(RecordingObserver::default()));
        listener.add_observer(&["https://a.example/".to_string()], ObserverId(1), first.clone(), now());
        let response = osp_wire::PresentationUrlAvailabilityResponse {
            request_id: 1,
            url_availabilities: vec![UrlAvailability::Compatible],
        };
        deliver(
            MessageType::PresentationUrlAvailabilityResponse,
            osp_wire::codec::encode_body(&response).unwrap(),
        );
        assert_eq!(first.lock().unwrap().available.len(), 1);

        let second = Arc::new(Mutex::new(RecordingObserver::default()));
        listener.add_observer(&["https://a.example/".to_string()], ObserverId(2), second.clone(), now());
        assert_eq!(second.lock().unwrap().available, vec![("https://a.example/".to_string(), "recv-1".to_string())]);
    }

    #[test]
    fn duplicate_consecutive_verdicts_are_suppressed() {
        let (listener, endpoint, deliver) = harness(9102);
        listener.on_receiver_added("recv-1", endpoint, now());
        let observer = Arc::new(Mutex::new(RecordingObserver::default()));
        listener.add_observer(&["https://a.example/".to_string()], ObserverId(1), observer.clone(), now());

        let response = osp_wire::PresentationUrlAvailabilityResponse {
            request_id: 1,
            url_availabilities: vec![UrlAvailability::Compatible],
        };
        deliver(
            MessageType::PresentationUrlAvailabilityResponse,
            osp_wire::codec::encode_body(&response).unwrap(),
        );
        assert_eq!(observer.lock().unwrap().available.len(), 1);

        // An unsolicited event repeating the same verdict through a
        // different channel must not re-fire the observer. There is no
        // still-live request to re-match, so use the watch id the initial
        // request established (1, since it's this client's first watch).
        let event = osp_wire::PresentationUrlAvailabilityEvent {
            watch_id: 1,
            urls: vec!["https://a.example/".to_string()],
            url_availabilities: vec![UrlAvailability::Compatible],
        };
        deliver(
            MessageType::PresentationUrlAvailabilityEvent,
            osp_wire::codec::encode_body(&event).unwrap(),
        );
        assert_eq!(observer.lock().unwrap().available.len(), 1, "duplicate verdict must be suppressed");
    }

    #[test]
    fn receiver_removed_fires_unavailable_for_compatible_urls_only() {
        let (listener, endpoint, deliver) = harness(9103);
        listener.on_receiver_added("recv-1", endpoint, now());
        let observer = Arc::new(Mutex::new(RecordingObserver::default()));
        listener.add_observer(
            &["https://a.example/".to_string(), "https://b.example/".to_string()],
            ObserverId(1),
            observer.clone(),
            now(),
        );
        let response = osp_wire::PresentationUrlAvailabilityResponse {
            request_id: 1,
            url_availabilities: vec![UrlAvailability::Compatible, UrlAvailability::NotCompatible],
        };
        deliver(
            MessageType::PresentationUrlAvailabilityResponse,
            osp_wire::codec::encode_body(&response).unwrap(),
        );

        listener.on_receiver_removed("recv-1");

        let observer = observer.lock().unwrap();
        assert_eq!(observer.unavailable, vec![("https://a.example/".to_string(), "recv-1".to_string())]);
    }

    #[test]
    fn remove_observer_forgets_cache_once_no_observer_remains() {
        let (listener, endpoint, deliver) = harness(9104);
        listener.on_receiver_added("recv-1", endpoint, now());
        let observer = Arc::new(Mutex::new(RecordingObserver::default()));
        listener.add_observer(&["https://a.example/".to_string()], ObserverId(1), observer.clone(), now());
        let response = osp_wire::PresentationUrlAvailabilityResponse {
            request_id: 1,
            url_availabilities: vec![UrlAvailability::Compatible],
        };
        deliver(
            MessageType::PresentationUrlAvailabilityResponse,
            osp_wire::codec::encode_body(&response).unwrap(),
        );

        listener.remove_observer(&["https://a.example/".to_string()], ObserverId(1));

        // Re-adding a fresh observer for the same URL should not see stale
        // cached availability: it must issue a new request instead.
        let second = Arc::new(Mutex::new(RecordingObserver::default()));
        listener.add_observer(&["https://a.example/".to_string()], ObserverId(2), second.clone(), now());
        assert!(second.lock().unwrap().available.is_empty(), "cache should have been forgotten");
    }

    #[test]
    fn refresh_watches_reissues_an_expired_watch() {
        let (listener, endpoint, deliver) = harness(9105);
        listener.on_receiver_added("recv-1", endpoint, now());
        let observer = Arc::new(Mutex::new(RecordingObserver::default()));
        listener.add_observer(&["https://a.example/".to_string()], ObserverId(1), observer.clone(), now());
        let response = osp_wire::PresentationUrlAvailabilityResponse {
            request_id: 1,
            url_availabilities: vec![UrlAvailability::Compatible],
        };
        deliver(
            MessageType::PresentationUrlAvailabilityResponse,
            osp_wire::codec::encode_body(&response).unwrap(),
        );

        let past_ttl = TimePoint::from_nanos(osp_time::Duration::from_secs(25).as_nanos());
        listener.refresh_watches(past_ttl);

        let second_response = osp_wire::PresentationUrlAvailabilityResponse {
            request_id: 2,
            url_availabilities: vec![UrlAvailability::NotCompatible],
        };
        deliver(
            MessageType::PresentationUrlAvailabilityResponse,
            osp_wire::codec::encode_body(&second_response).unwrap(),
        );
        assert_eq!(observer.lock().unwrap().unavailable.len(), 1, "refreshed watch's reply should still route to the observer");
    }
}
