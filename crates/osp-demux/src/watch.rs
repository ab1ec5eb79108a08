use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use bytes::BytesMut;
use osp_wire::{EndpointId, MessageType, StreamId};

use crate::DemuxError;

/// A registered callback for one message type, invoked with the already
/// varint-stripped body span. Returns the number of bytes of that span it
/// consumed, or a [`DemuxError`] (spec §4.D step 3).
pub type MessageCallback =
    Box<dyn FnMut(EndpointId, MessageType, &[u8]) -> Result<usize, DemuxError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WatchKey {
    PerEndpoint(EndpointId, MessageType),
    Default(MessageType),
}

pub(crate) struct Slot {
    pub token: u64,
    pub callback: MessageCallback,
}

#[derive(Default)]
pub(crate) struct Inner {
    pub per_endpoint: HashMap<(EndpointId, MessageType), Slot>,
    pub defaults: HashMap<MessageType, Slot>,
    pub buffers: HashMap<(EndpointId, StreamId), BytesMut>,
    pub next_token: u64,
}

impl Inner {
    pub(crate) fn insert(&mut self, key: WatchKey, callback: MessageCallback) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        let slot = Slot { token, callback };
        match key {
            WatchKey::PerEndpoint(ep, mt) => {
                self.per_endpoint.insert((ep, mt), slot);
            }
            WatchKey::Default(mt) => {
                self.defaults.insert(mt, slot);
            }
        }
        token
    }

    pub(crate) fn lookup_mut(
        &mut self,
        endpoint: EndpointId,
        msg_type: MessageType,
    ) -> Option<&mut MessageCallback> {
        if let Some(slot) = self.per_endpoint.get_mut(&(endpoint, msg_type)) {
            return Some(&mut slot.callback);
        }
        self.defaults.get_mut(&msg_type).map(|slot| &mut slot.callback)
    }
}

/// Scoped handle returned by [`crate::MessageDemuxer::watch_message_type`] and
/// [`crate::MessageDemuxer::set_default_message_type_watch`]. Dropping it
/// removes the dispatch-table entry it created (spec §4.D "Cancellation"),
/// unless that entry was already overwritten by a later registration for the
/// same key — tracked via `token` so a stale drop can't evict someone else's
/// callback.
pub struct MessageWatch {
    pub(crate) inner: Weak<Mutex<Inner>>,
    pub(crate) key: WatchKey,
    pub(crate) token: u64,
}

impl Drop for MessageWatch {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut guard = inner.lock().expect("demuxer mutex poisoned");
        match self.key {
            WatchKey::PerEndpoint(ep, mt) => {
                if guard.per_endpoint.get(&(ep, mt)).is_some_and(|s| s.token == self.token) {
                    guard.per_endpoint.remove(&(ep, mt));
                }
            }
            WatchKey::Default(mt) => {
                if guard.defaults.get(&mt).is_some_and(|s| s.token == self.token) {
                    guard.defaults.remove(&mt);
                }
            }
        }
    }
}

pub(crate) fn arc_mutex_default() -> Arc<Mutex<Inner>> {
    Arc::new(Mutex::new(Inner::default()))
}
