//! Protocol-connection substrate (spec §4.E): wraps an opaque multi-stream
//! transport, assigning and tracking [`osp_wire::EndpointId`]s and
//! correlating connection attempts with the callers waiting on them.
//!
//! The concrete QUIC/TLS implementation is out of scope for the core (spec
//! §1 non-goals) — only the [`Transport`] abstraction it must expose is
//! defined here. A real implementation over `quinn` is available behind the
//! `quinn-transport` feature.

mod substrate;
mod traits;
mod types;

#[cfg(feature = "quinn-transport")]
mod quinn_transport;

pub use substrate::{ConnectRequest, ProtocolConnectionSubstrate};
pub use traits::{ConnectionRequestCallback, Transport};
pub use types::{ConnectionHandle, StreamHandle, TransportError};

#[cfg(feature = "quinn-transport")]
pub use quinn_transport::QuinnTransport;
