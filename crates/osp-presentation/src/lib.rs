//! Presentation controller/receiver (spec §4.H): ties the request/response
//! handler (`osp-rr`) and the availability requester (`osp-availability`)
//! together into `StartPresentation`, `Connection`, and `ConnectionManager`
//! — the top of the endpoint stack.

mod connection;
mod connection_manager;
mod controller;
mod error;
mod group_streams;
mod receiver;
mod types;

pub use connection::{Connection, ConnectionDelegate, ConnectionIo, ConnectionRef};
pub use connection_manager::{ConnectionManager, ConnectionManagerIo};
pub use controller::{ControllerIo, PresentationController, ReceiverObserver, ReceiverObserverId, ReceiverWatch, StartPresentationDelegate, StartPresentationRequest};
pub use error::PresentationError;
pub use receiver::{PresentationReceiver, ReceiverIo, ReceiverDelegate};
pub use types::{CloseReason, ConnectionRole, ConnectionState, PresentationInfo};
