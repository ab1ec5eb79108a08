use osp_wire::codec::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RrError {
    #[error("failed to encode request body: {0}")]
    Encode(#[source] WireError),
    #[error("write failed: {0}")]
    Write(String),
}
