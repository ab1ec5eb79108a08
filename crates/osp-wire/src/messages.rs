//! CBOR message bodies (spec §6). The codec itself stays opaque
//! (non-goal); these are the typed schemas `osp-demux` and `osp-presentation`
//! encode/decode through `osp_wire::codec`.

use serde::{Deserialize, Serialize};

/// Verdict a receiver reports for one URL (spec §4.G, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UrlAvailability {
    Compatible,
    NotCompatible,
    NotValid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationUrlAvailabilityRequest {
    pub request_id: u64,
    pub watch_id: u64,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationUrlAvailabilityResponse {
    pub request_id: u64,
    pub url_availabilities: Vec<UrlAvailability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationUrlAvailabilityEvent {
    pub watch_id: u64,
    pub urls: Vec<String>,
    pub url_availabilities: Vec<UrlAvailability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationInitiationRequest {
    pub request_id: u64,
    pub presentation_id: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub connection_id: u64,
}

/// Top-level initiation result (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiationResult {
    Success,
    InvalidPresentationId,
    UnknownError,
}

/// Whether the accompanying connection was also established successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionResult {
    Success,
    ConnectionClosedBeforeStart,
    TransientFailure,
    PermanentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationInitiationResponse {
    pub request_id: u64,
    pub result: InitiationResult,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub connection_result: Option<ConnectionResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenResult {
    Success,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationConnectionOpenRequest {
    pub request_id: u64,
    pub presentation_id: String,
    pub connection_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationConnectionOpenResponse {
    pub request_id: u64,
    pub presentation_id: String,
    pub connection_id: u64,
    pub result: OpenResult,
}

/// A connection message's sum-typed payload (spec §3, §4.H).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMessagePayload {
    String(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationConnectionMessage {
    pub presentation_id: String,
    pub connection_id: u64,
    pub payload: ConnectionMessagePayload,
}

/// Wire rendering of [`crate::ConnectionCloseReason`] (spec §4.H: `Closed`
/// maps to `CloseMethod`, `Discarded` to `ConnectionDestruction`, `Error` to
/// `UnrecoverableError`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionCloseEventReason {
    CloseMethod,
    ConnectionDestruction,
    UnrecoverableError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationConnectionCloseRequest {
    pub request_id: u64,
    pub presentation_id: String,
    pub connection_id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationConnectionCloseResponse {
    pub request_id: u64,
    pub presentation_id: String,
    pub connection_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationConnectionCloseEvent {
    pub presentation_id: String,
    pub connection_id: u64,
    pub reason: ConnectionCloseEventReason,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
}

/// Which side initiated a termination (spec §9 design note /
/// `original_source/osp/public/presentation/presentation_common.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationSource {
    Controller,
    Receiver,
}

/// Why a presentation terminated. Mirrors
/// `original_source/osp/public/presentation/presentation_common.h`'s
/// `TerminationReason`, which the distilled spec only names examples of
/// (`controller-user-terminated`, `kReceiverShuttingDown`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    ApplicationTerminated,
    UserTerminated,
    ReceiverPresentationReplaced,
    ReceiverIdleTooLong,
    ReceiverPresentationUnloaded,
    ReceiverShuttingDown,
    ReceiverError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationTerminationRequest {
    pub request_id: u64,
    pub presentation_id: String,
    pub reason: TerminationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationResult {
    Success,
    UnknownPresentationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationTerminationResponse {
    pub request_id: u64,
    pub presentation_id: String,
    pub result: TerminationResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationTerminationEvent {
    pub presentation_id: String,
    pub reason: TerminationReason,
    pub source: TerminationSource,
}
