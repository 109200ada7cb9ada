use std::time::Duration;

use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::broker::BrokerError;
use crate::wire::{DecodeFailure, WireError};

/// Every way an RPC call can end other than with a processed image.
///
/// Load failures happen before anything is published; timeouts leave the
/// outcome of the work unknown; worker failures are definite.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Failed to load input image: {0}")]
    Load(String),

    #[error("Call {0} is still outstanding on this client")]
    CallInProgress(String),

    #[error("No reply within {0:?}")]
    TimedOut(Duration),

    #[error("Reply channel closed before a reply arrived")]
    ReplyChannelClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] BrokerError),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Worker could not decode the request: {0}")]
    WorkerDecode(DecodeFailure),

    #[error("Worker failed while processing the request")]
    WorkerProcessing,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Multipart error: {0}")]
    Multipart(#[from] actix_multipart::MultipartError),
}

impl ResponseError for ServiceError {
    fn error_response(&self) -> HttpResponse {
        let (mut status, error_type) = match self {
            Self::InvalidInput(_) | Self::Multipart(_) | Self::Call(CallError::Load(_)) => {
                (HttpResponse::BadRequest(), "invalid_request")
            }
            Self::Call(CallError::WorkerDecode(_)) => {
                (HttpResponse::UnprocessableEntity(), "rejected_by_worker")
            }
            Self::Call(CallError::TimedOut(_)) => (HttpResponse::GatewayTimeout(), "timeout"),
            Self::Call(CallError::Transport(_)) | Self::Call(CallError::ReplyChannelClosed) => {
                (HttpResponse::ServiceUnavailable(), "transport_error")
            }
            Self::Call(CallError::WorkerProcessing) => {
                (HttpResponse::InternalServerError(), "processing_error")
            }
            Self::Image(_) | Self::Call(_) => (HttpResponse::InternalServerError(), "internal_error"),
        };

        status.json(serde_json::json!({
            "error": error_type,
            "message": self.to_string()
        }))
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ServiceError::InvalidInput("test input".to_string());
        assert_eq!(error.to_string(), "Invalid input: test input");
    }

    #[test]
    fn test_error_response_status_codes() {
        let input_error = ServiceError::InvalidInput("Bad input".to_string());
        assert_eq!(input_error.error_response().status(), 400);

        let load_error = ServiceError::Call(CallError::Load("not an image".to_string()));
        assert_eq!(load_error.error_response().status(), 400);

        let decode_error = ServiceError::Call(CallError::WorkerDecode(DecodeFailure::MissingPayload));
        assert_eq!(decode_error.error_response().status(), 422);

        let processing_error = ServiceError::Call(CallError::WorkerProcessing);
        assert_eq!(processing_error.error_response().status(), 500);

        let timeout = ServiceError::Call(CallError::TimedOut(Duration::from_secs(1)));
        assert_eq!(timeout.error_response().status(), 504);

        let transport = ServiceError::Call(CallError::Transport(BrokerError::Closed));
        assert_eq!(transport.error_response().status(), 503);
    }

    #[test]
    fn test_worker_failures_stay_distinguishable() {
        let decode = CallError::WorkerDecode(DecodeFailure::MalformedEnvelope);
        let timeout = CallError::TimedOut(Duration::from_millis(10));
        assert!(decode.to_string().contains("decode"));
        assert!(timeout.to_string().contains("No reply"));
    }
}
