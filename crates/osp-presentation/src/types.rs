//! Small shared vocabulary (spec §4.H).

use osp_wire::ConnectionCloseEventReason;

/// Which side of a [`crate::connection::Connection`] this process is
/// playing (spec §4.H: "same code, delegate callbacks in the opposite
/// direction").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Controller,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
    Terminated,
}

/// Local reason a `Connection::Close` was requested. Maps onto the wire's
/// [`ConnectionCloseEventReason`] (spec §4.H).
#[derive(Debug, Clone)]
pub enum CloseReason {
    Closed,
    Discarded,
    Error(String),
}

impl CloseReason {
    #[must_use]
    pub fn as_wire(&self) -> (ConnectionCloseEventReason, Option<String>) {
        match self {
            CloseReason::Closed => (ConnectionCloseEventReason::CloseMethod, None),
            CloseReason::Discarded => (ConnectionCloseEventReason::ConnectionDestruction, None),
            CloseReason::Error(message) => (ConnectionCloseEventReason::UnrecoverableError, Some(message.clone())),
        }
    }
}

/// What a controller asked a receiver to start (spec §4.H `PresentationInfo`
/// implied by `StartPresentation`/`OnPresentationStarted`).
#[derive(Debug, Clone)]
pub struct PresentationInfo {
    pub id: osp_wire::PresentationId,
    pub url: String,
}
