//! A scripted [`MdnsEventSource`] double: queue up the batches a test wants
//! the aggregator to see, in order (same role `MockWsServer` plays for the
//! forwarding protocol: a fake upstream a test drives by hand).

use std::collections::VecDeque;

use osp_discovery::{EventBatch, MdnsEventSource};

#[derive(Default)]
pub struct FakeMdnsSource {
    batches: VecDeque<EventBatch>,
}

impl FakeMdnsSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&mut self, batch: EventBatch) {
        self.batches.push_back(batch);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.batches.len()
    }
}

impl MdnsEventSource for FakeMdnsSource {
    fn next_batch(&mut self) -> Option<EventBatch> {
        self.batches.pop_front()
    }
}
