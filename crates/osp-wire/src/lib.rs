//! Wire message schemas and framing scalars shared by every endpoint-core
//! crate (spec §3 data model, §6 external interfaces).
//!
//! The CBOR codec and concrete mDNS/QUIC parsing stay opaque per spec §1's
//! non-goals; this crate only defines the typed shapes those opaque layers
//! carry.

pub mod codec;
pub mod ids;
pub mod message_type;
pub mod messages;
pub mod presentation_id;

pub use ids::{Endpoint, EndpointId, InstanceKey, StreamId};
pub use message_type::{MessageType, VarintError, read_varint, write_varint};
pub use messages::*;
pub use presentation_id::{PresentationId, PresentationIdError, make_presentation_id};
