//! [`MessageGroupStreams`]: the initiation+termination request/response pair
//! for one known receiver (spec §4.H `group_streams: Map<service_id,
//! MessageGroupStreams>`). Grounded on `original_source/api/impl/
//! presentation/presentation_controller.cc`'s `Controller::
//! MessageGroupStreams`, which holds one `InitiationRequestResponseHandler`
//! and one `TerminationRequestResponseHandler` per receiver — here
//! expressed as two [`osp_rr::RequestResponder`] instantiations instead of
//! the original's two separate template classes.

use osp_rr::RequestResponder;
use osp_wire::{MessageType, PresentationId, PresentationInitiationRequest, PresentationInitiationResponse, PresentationTerminationRequest, PresentationTerminationResponse, TerminationReason};

/// Everything needed to build a `PresentationInitiationRequest` (spec §4.H
/// "Builds a `PresentationInitiationRequest` with a freshly generated
/// `presentation_id`").
#[derive(Debug, Clone)]
pub struct InitiationRequestData {
    pub presentation_id: PresentationId,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub connection_id: u64,
}

pub struct Initiation;

impl osp_rr::RequestResponse for Initiation {
    type RequestData = InitiationRequestData;
    type RequestMsg = PresentationInitiationRequest;
    type ResponseMsg = PresentationInitiationResponse;

    const REQUEST_TYPE: MessageType = MessageType::PresentationInitiationRequest;
    const RESPONSE_TYPE: MessageType = MessageType::PresentationInitiationResponse;

    fn encode_request(data: &Self::RequestData, request_id: u64) -> Self::RequestMsg {
        PresentationInitiationRequest {
            request_id,
            presentation_id: data.presentation_id.as_str().to_owned(),
            url: data.url.clone(),
            headers: data.headers.clone(),
            connection_id: data.connection_id,
        }
    }

    fn response_request_id(response: &Self::ResponseMsg) -> u64 {
        response.request_id
    }
}

#[derive(Debug, Clone)]
pub struct TerminationRequestData {
    pub presentation_id: PresentationId,
    pub reason: TerminationReason,
}

pub struct Termination;

impl osp_rr::RequestResponse for Termination {
    type RequestData = TerminationRequestData;
    type RequestMsg = PresentationTerminationRequest;
    type ResponseMsg = PresentationTerminationResponse;

    const REQUEST_TYPE: MessageType = MessageType::PresentationTerminationRequest;
    const RESPONSE_TYPE: MessageType = MessageType::PresentationTerminationResponse;

    fn encode_request(data: &Self::RequestData, request_id: u64) -> Self::RequestMsg {
        PresentationTerminationRequest {
            request_id,
            presentation_id: data.presentation_id.as_str().to_owned(),
            reason: data.reason,
        }
    }

    fn response_request_id(response: &Self::ResponseMsg) -> u64 {
        response.request_id
    }
}

/// One receiver's initiation+termination channel pair.
#[derive(Clone)]
pub struct MessageGroupStreams {
    pub initiation: RequestResponder<Initiation>,
    pub termination: RequestResponder<Termination>,
}
