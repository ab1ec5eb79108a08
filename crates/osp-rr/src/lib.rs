//! Generic request/response handler (spec §4.F): stamps a per-endpoint
//! request id onto outbound requests, queues them while disconnected, and
//! correlates inbound responses back to the caller that sent them.
//!
//! Parameterized over a [`RequestResponse`] trait rather than the five-type
//! C++ template-parameter list spec.md §4.F describes — same behavior,
//! more idiomatic Rust.

mod error;

pub use error::RrError;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use osp_demux::{DemuxError, MessageCallback, MessageWatch};
use osp_transport::StreamHandle;
use osp_wire::codec::{decode_body_prefix, encode_body};
use osp_wire::{MessageType, write_varint};

/// One request/response message-type pairing. `RequestData` is whatever the
/// caller wants to carry alongside a pending request (it is handed back
/// verbatim to the delegate on completion or cancellation).
pub trait RequestResponse: Send + 'static {
    type RequestData: Send + 'static;
    type RequestMsg: serde::Serialize;
    type ResponseMsg: serde::de::DeserializeOwned;

    const REQUEST_TYPE: MessageType;
    const RESPONSE_TYPE: MessageType;

    /// Build the wire request from `data`, already stamped with `request_id`.
    fn encode_request(data: &Self::RequestData, request_id: u64) -> Self::RequestMsg;

    /// Pull the `request_id` a response is replying to, for `sent` lookup.
    fn response_request_id(response: &Self::ResponseMsg) -> u64;
}

pub trait RequestDelegate<T: RequestResponse>: Send {
    fn on_matched_response(&mut self, caller_local_id: u64, data: T::RequestData, response: T::ResponseMsg);
    fn on_request_cancelled(&mut self, caller_local_id: u64, data: T::RequestData);
}

struct Inner<T: RequestResponse> {
    connection: Option<StreamHandle>,
    queue: VecDeque<(u64, T::RequestData)>,
    sent: Vec<(u64, T::RequestData, u64)>,
    response_watch: Option<MessageWatch>,
}

/// Injected capabilities a [`RequestResponder`] needs from the owning
/// endpoint: a per-endpoint request-id generator, a way to write framed
/// bytes to the active stream, and a way to register the response watch.
/// Type-erased (rather than generic over `osp_transport::Transport`) so
/// `RequestResponder` itself stays non-generic over the transport backend,
/// the same tradeoff `ConnectRequest`'s boxed cancel closure makes.
pub struct RequestIo {
    pub next_request_id: Arc<dyn Fn() -> u64 + Send + Sync>,
    pub write: Arc<dyn Fn(StreamHandle, &[u8]) -> Result<(), RrError> + Send + Sync>,
    pub watch_response: Arc<dyn Fn(MessageCallback) -> MessageWatch + Send + Sync>,
}

pub struct RequestResponder<T: RequestResponse> {
    inner: Arc<Mutex<Inner<T>>>,
    io: RequestIo,
    delegate: Arc<Mutex<dyn RequestDelegate<T>>>,
}

impl<T: RequestResponse> Clone for RequestResponder<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            io: RequestIo {
                next_request_id: self.io.next_request_id.clone(),
                write: self.io.write.clone(),
                watch_response: self.io.watch_response.clone(),
            },
            delegate: self.delegate.clone(),
        }
    }
}

impl<T: RequestResponse> RequestResponder<T> {
    #[must_use]
    pub fn new(io: RequestIo, delegate: Arc<Mutex<dyn RequestDelegate<T>>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connection: None,
                queue: VecDeque::new(),
                sent: Vec::new(),
                response_watch: None,
            })),
            io,
            delegate,
        }
    }

    /// `WriteMessage(id, msg)` (spec §4.F): writes immediately if connected,
    /// otherwise queues.
    pub fn write_message(&self, caller_local_id: u64, data: T::RequestData) -> Result<(), RrError> {
        let mut inner = self.inner.lock().expect("rr mutex poisoned");
        reap_idle_watch(&mut inner);
        let Some(stream) = inner.connection else {
            inner.queue.push_back((caller_local_id, data));
            return Ok(());
        };
        self.send_on_stream(&mut inner, stream, caller_local_id, data)
    }

    fn send_on_stream(
        &self,
        inner: &mut Inner<T>,
        stream: StreamHandle,
        caller_local_id: u64,
        data: T::RequestData,
    ) -> Result<(), RrError> {
        let request_id = (self.io.next_request_id)();
        let msg = T::encode_request(&data, request_id);
        let body = encode_body(&msg).map_err(RrError::Encode)?;
        let mut framed = Vec::with_capacity(body.len() + 10);
        write_varint(T::REQUEST_TYPE.as_u64(), &mut framed);
        framed.extend_from_slice(&body);
        (self.io.write)(stream, &framed)?;
        inner.sent.push((caller_local_id, data, request_id));
        self.ensure_response_watch(inner);
        Ok(())
    }

    /// `SetConnection(stream)` (spec §4.F): drains the queue through
    /// `write_message` in order.
    pub fn set_connection(&self, stream: StreamHandle) -> Result<(), RrError> {
        let drained = {
            let mut inner = self.inner.lock().expect("rr mutex poisoned");
            inner.connection = Some(stream);
            std::mem::take(&mut inner.queue)
        };
        for (caller_local_id, data) in drained {
            self.write_message(caller_local_id, data)?;
        }
        Ok(())
    }

    /// `CancelMessage(caller_local_id)` (spec §4.F).
    pub fn cancel_message(&self, caller_local_id: u64) {
        let mut inner = self.inner.lock().expect("rr mutex poisoned");
        let mut cancelled = Vec::new();
        inner.queue.retain(|(id, _)| *id != caller_local_id);
        let before = inner.sent.len();
        let mut remaining = Vec::with_capacity(before);
        for entry in inner.sent.drain(..) {
            if entry.0 == caller_local_id {
                cancelled.push((entry.0, entry.1));
            } else {
                remaining.push(entry);
            }
        }
        inner.sent = remaining;
        if inner.sent.is_empty() {
            inner.response_watch = None;
        }
        drop(inner);
        let mut delegate = self.delegate.lock().expect("delegate mutex poisoned");
        for (id, data) in cancelled {
            delegate.on_request_cancelled(id, data);
        }
    }

    /// `Reset()` (spec §4.F): cancels every queued and sent entry.
    pub fn reset(&self) {
        let (queued, sent) = {
            let mut inner = self.inner.lock().expect("rr mutex poisoned");
            inner.response_watch = None;
            inner.connection = None;
            (
                std::mem::take(&mut inner.queue),
                std::mem::take(&mut inner.sent),
            )
        };
        let mut delegate = self.delegate.lock().expect("delegate mutex poisoned");
        for (id, data) in queued {
            delegate.on_request_cancelled(id, data);
        }
        for (id, data, _request_id) in sent {
            delegate.on_request_cancelled(id, data);
        }
    }

    #[must_use]
    pub fn sent_len(&self) -> usize {
        self.inner.lock().expect("rr mutex poisoned").sent.len()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.lock().expect("rr mutex poisoned").queue.len()
    }

    /// Registers the response watch if `sent` is non-empty and no watch is
    /// currently active. Never called from inside the watch's own callback
    /// (see `reap_idle_watch`'s doc comment) — spec §5 forbids re-entrancy
    /// into the demuxer from a callback it is invoking, and dropping a
    /// `MessageWatch` re-enters it.
    fn ensure_response_watch(&self, inner: &mut Inner<T>) {
        if inner.response_watch.is_some() {
            return;
        }
        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        let delegate = self.delegate.clone();
        let callback: MessageCallback = Box::new(move |_endpoint, _msg_type, body| {
            let (response, consumed): (T::ResponseMsg, usize) = match decode_body_prefix(body) {
                Ok(v) => v,
                Err(err) => {
                    return Err(DemuxError::Parsing {
                        consumed: body.len(),
                        detail: err.to_string(),
                    });
                }
            };
            let request_id = T::response_request_id(&response);
            let Some(inner) = weak.upgrade() else {
                return Ok(consumed);
            };
            let matched = {
                let mut guard = inner.lock().expect("rr mutex poisoned");
                guard
                    .sent
                    .iter()
                    .position(|(_, _, id)| *id == request_id)
                    .map(|pos| guard.sent.remove(pos))
            };
            match matched {
                Some((caller_local_id, data, _)) => {
                    delegate
                        .lock()
                        .expect("delegate mutex poisoned")
                        .on_matched_response(caller_local_id, data, response);
                }
                None => tracing::warn!(request_id, "unmatched response, ignoring"),
            }
            Ok(consumed)
        });
        inner.response_watch = Some((self.io.watch_response)(callback));
    }
}

/// Drops an idle response watch left over from a response that emptied
/// `sent` inside its own callback (where dropping it directly would
/// re-enter the demuxer it's registered on). Safe to call here: every
/// caller of this function is an ordinary method call, never a demuxer
/// callback itself.
fn reap_idle_watch<T: RequestResponse>(inner: &mut Inner<T>) {
    if inner.sent.is_empty() && inner.response_watch.is_some() {
        inner.response_watch = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osp_demux::MessageDemuxer;
    use osp_wire::EndpointId;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    struct PingRequest {
        request_id: u64,
        payload: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    struct PongResponse {
        request_id: u64,
        echo: String,
    }

    struct PingPong;

    impl RequestResponse for PingPong {
        type RequestData = String;
        type RequestMsg = PingRequest;
        type ResponseMsg = PongResponse;

        const REQUEST_TYPE: MessageType = MessageType::PresentationUrlAvailabilityRequest;
        const RESPONSE_TYPE: MessageType = MessageType::PresentationUrlAvailabilityResponse;

        fn encode_request(data: &Self::RequestData, request_id: u64) -> Self::RequestMsg {
            PingRequest {
                request_id,
                payload: data.clone(),
            }
        }

        fn response_request_id(response: &Self::ResponseMsg) -> u64 {
            response.request_id
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        matched: Vec<(u64, String, String)>,
        cancelled: Vec<(u64, String)>,
    }

    impl RequestDelegate<PingPong> for RecordingDelegate {
        fn on_matched_response(&mut self, caller_local_id: u64, data: String, response: PongResponse) {
            self.matched.push((caller_local_id, data, response.echo));
        }
        fn on_request_cancelled(&mut self, caller_local_id: u64, data: String) {
            self.cancelled.push((caller_local_id, data));
        }
    }

    /// Wires a `RequestResponder` to a real `MessageDemuxer` and a fake
    /// stream sink, returning a way to push a response message in and a
    /// way to read what was "sent on the wire".
    fn harness() -> (
        RequestResponder<PingPong>,
        Arc<Mutex<RecordingDelegate>>,
        Arc<Mutex<Vec<(StreamHandle, Vec<u8>)>>>,
        impl Fn(PongResponse),
    ) {
        let demuxer = MessageDemuxer::new();
        let endpoint = EndpointId::new(1);
        let written = Arc::new(Mutex::new(Vec::new()));
        let written_for_write = written.clone();
        let next_id = Arc::new(AtomicU64::new(1));

        let demuxer_for_watch = demuxer.clone();
        let io = RequestIo {
            next_request_id: Arc::new(move || next_id.fetch_add(1, Ordering::SeqCst)),
            write: Arc::new(move |stream, bytes| {
                written_for_write.lock().unwrap().push((stream, bytes.to_vec()));
                Ok(())
            }),
            watch_response: Arc::new(move |callback| {
                demuxer_for_watch.watch_message_type(endpoint, MessageType::PresentationUrlAvailabilityResponse, callback)
            }),
        };

        let delegate = Arc::new(Mutex::new(RecordingDelegate::default()));
        let responder = RequestResponder::new(io, delegate.clone());

        let deliver_demuxer = demuxer;
        let deliver = move |response: PongResponse| {
            let body = encode_body(&response).unwrap();
            let mut framed = Vec::new();
            write_varint(MessageType::PresentationUrlAvailabilityResponse.as_u64(), &mut framed);
            framed.extend_from_slice(&body);
            deliver_demuxer.on_bytes(endpoint, osp_wire::StreamId::new(1), &framed);
        };

        (responder, delegate, written, deliver)
    }

    #[test]
    fn write_message_queues_while_disconnected() {
        let (responder, _delegate, written, _deliver) = harness();
        responder.write_message(1, "hello".into()).unwrap();
        assert_eq!(responder.queue_len(), 1);
        assert_eq!(responder.sent_len(), 0);
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn set_connection_drains_queue_in_order() {
        let (responder, _delegate, written, _deliver) = harness();
        responder.write_message(1, "a".into()).unwrap();
        responder.write_message(2, "b".into()).unwrap();
        responder.set_connection(StreamHandle(1)).unwrap();

        assert_eq!(responder.queue_len(), 0);
        assert_eq!(responder.sent_len(), 2);
        assert_eq!(written.lock().unwrap().len(), 2);
    }

    #[test]
    fn matched_response_removes_from_sent_and_notifies_delegate() {
        let (responder, delegate, _written, deliver) = harness();
        responder.set_connection(StreamHandle(1)).unwrap();
        responder.write_message(1, "ping".into()).unwrap();
        assert_eq!(responder.sent_len(), 1);

        deliver(PongResponse {
            request_id: 1,
            echo: "pong".into(),
        });

        assert_eq!(responder.sent_len(), 0);
        let delegate = delegate.lock().unwrap();
        assert_eq!(delegate.matched, vec![(1, "ping".to_string(), "pong".to_string())]);
    }

    #[test]
    fn watch_is_recreated_after_becoming_idle() {
        let (responder, _delegate, _written, deliver) = harness();
        responder.set_connection(StreamHandle(1)).unwrap();
        responder.write_message(1, "first".into()).unwrap();
        deliver(PongResponse {
            request_id: 1,
            echo: "one".into(),
        });
        assert_eq!(responder.sent_len(), 0);

        // A second request after the watch went idle must still work: the
        // idle watch is reaped lazily on this call, not inside the callback.
        responder.write_message(2, "second".into()).unwrap();
        deliver(PongResponse {
            request_id: 2,
            echo: "two".into(),
        });
        assert_eq!(responder.sent_len(), 0);
    }

    #[test]
    fn cancel_message_removes_matching_entries_and_drops_watch_when_empty() {
        let (responder, delegate, _written, _deliver) = harness();
        responder.set_connection(StreamHandle(1)).unwrap();
        responder.write_message(1, "only".into()).unwrap();
        assert_eq!(responder.sent_len(), 1);

        responder.cancel_message(1);

        assert_eq!(responder.sent_len(), 0);
        assert_eq!(delegate.lock().unwrap().cancelled, vec![(1, "only".to_string())]);
    }

    #[test]
    fn cancel_message_leaves_unrelated_entries_alone() {
        let (responder, delegate, _written, _deliver) = harness();
        responder.set_connection(StreamHandle(1)).unwrap();
        responder.write_message(1, "keep".into()).unwrap();
        responder.write_message(2, "drop".into()).unwrap();

        responder.cancel_message(2);

        assert_eq!(responder.sent_len(), 1);
        assert_eq!(delegate.lock().unwrap().cancelled, vec![(2, "drop".to_string())]);
    }

    #[test]
    fn reset_cancels_every_queued_and_sent_entry() {
        let (responder, delegate, _written, _deliver) = harness();
        responder.write_message(1, "queued".into()).unwrap();
        responder.set_connection(StreamHandle(1)).unwrap();
        responder.write_message(2, "sent".into()).unwrap();

        responder.reset();

        assert_eq!(responder.queue_len(), 0);
        assert_eq!(responder.sent_len(), 0);
        let delegate = delegate.lock().unwrap();
        assert_eq!(delegate.cancelled.len(), 2);
        assert!(delegate.cancelled.contains(&(1, "queued".to_string())));
        assert!(delegate.cancelled.contains(&(2, "sent".to_string())));
    }

    #[test]
    fn unmatched_response_is_ignored() {
        let (responder, delegate, _written, deliver) = harness();
        responder.set_connection(StreamHandle(1)).unwrap();
        responder.write_message(1, "ping".into()).unwrap();

        deliver(PongResponse {
            request_id: 999,
            echo: "stray".into(),
        });

        assert_eq!(responder.sent_len(), 1, "unmatched response must not remove the real entry");
        assert!(delegate.lock().unwrap().matched.is_empty());
    }
}
