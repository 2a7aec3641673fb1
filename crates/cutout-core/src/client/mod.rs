//! Remote segmentation service interface.
//!
//! The queue only talks to the service through [`SegmentClient`]; the
//! production implementation is [`HttpSegmentClient`].

mod http;
mod types;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::queue::registry::CancelSignal;

pub use http::HttpSegmentClient;
pub use types::{Candidate, FocusMode, ProcessingMode, SegmentParams, SegmentRequest, SegmentResult, Upload};

/// Failure of a remote call, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The server answered with a non-2xx status and an error message.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    /// The request never produced a response.
    #[error("network error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),

    /// The cancellation signal fired before the call resolved.
    #[error("request aborted")]
    Aborted,
}

#[async_trait]
pub trait SegmentClient: Send + Sync + 'static {
    /// Run one segmentation.  Implementations must stop promptly once
    /// `cancel` fires and resolve to [`RemoteError::Aborted`].
    async fn segment(
        &self,
        request: SegmentRequest,
        cancel: CancelSignal,
    ) -> Result<SegmentResult, RemoteError>;

    /// Fetch a previously issued result by its job id.
    async fn job(&self, job_id: &str) -> Result<SegmentResult, RemoteError>;

    /// Download the cutouts of several jobs as one ZIP archive.
    async fn download_zip(&self, job_ids: &[String]) -> Result<Bytes, RemoteError>;
}
