//! Shared test doubles used across this workspace's crates, so each one
//! stops hand-rolling its own copy of the same fakes (spec §1 ambient
//! concern: test tooling, grounded on `rt-test-utils` playing the same role
//! for the forwarding protocol's crates).

mod fake_mdns;
mod fake_transport;

pub use fake_mdns::FakeMdnsSource;
pub use fake_transport::{ConnectAttempt, FakeTransport};
pub use osp_time::{Duration, FakeClock, ManualTaskRunner, TimePoint};
