//! JSON wire schema shared by callers and workers.
//!
//! Bodies carry the pixel data and layout; the correlation id and reply queue
//! travel as message properties (see [`crate::broker::Properties`]).

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid dimensions: {width}x{height}x{channels}")]
    InvalidDimensions {
        width: i64,
        height: i64,
        channels: i64,
    },

    #[error("Payload holds {actual} bytes, layout requires {expected}")]
    LayoutMismatch { expected: usize, actual: usize },

    #[error("Reply reports success but carries no payload")]
    MissingPayload,

    #[error("Unknown failure sentinel: {0}")]
    UnknownSentinel(f32),
}

/// Layout of a tightly packed, interleaved pixel buffer.
///
/// Only constructed through [`ImageDims::new`] or the wire decoder, so every
/// value is positive and its byte length fits in `usize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDims {
    width: u32,
    height: u32,
    channels: u32,
}

impl ImageDims {
    pub fn new(width: u32, height: u32, channels: u32) -> Result<Self, WireError> {
        Self::from_wire(width as i64, height as i64, channels as i64)
    }

    fn from_wire(width: i64, height: i64, channels: i64) -> Result<Self, WireError> {
        let invalid = || WireError::InvalidDimensions {
            width,
            height,
            channels,
        };

        let as_positive = |v: i64| u32::try_from(v).ok().filter(|&v| v > 0);
        let dims = match (as_positive(width), as_positive(height), as_positive(channels)) {
            (Some(width), Some(height), Some(channels)) => Self {
                width,
                height,
                channels,
            },
            _ => return Err(invalid()),
        };

        dims.checked_len().ok_or_else(invalid)?;
        Ok(dims)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    fn checked_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.channels as usize)
    }

    /// Number of bytes a buffer of this layout occupies.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    fn to_wire(self) -> Result<(i32, i32, i32), WireError> {
        let convert = |v: u32| i32::try_from(v).ok();
        match (convert(self.width), convert(self.height), convert(self.channels)) {
            (Some(w), Some(h), Some(c)) => Ok((w, h, c)),
            _ => Err(WireError::InvalidDimensions {
                width: self.width as i64,
                height: self.height as i64,
                channels: self.channels as i64,
            }),
        }
    }
}

/// A pixel buffer whose length always agrees with its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    dims: ImageDims,
    pixels: Vec<u8>,
}

impl RawImage {
    pub fn new(dims: ImageDims, pixels: Vec<u8>) -> Result<Self, WireError> {
        let expected = dims.byte_len();
        if pixels.len() != expected {
            return Err(WireError::LayoutMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self { dims, pixels })
    }

    pub fn dims(&self) -> ImageDims {
        self.dims
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

/// Ways a worker can fail to turn a message into a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("request body was null")]
    NullRequest,

    #[error("request carried no pixel payload")]
    MissingPayload,

    #[error("request body was not a valid message")]
    MalformedEnvelope,

    #[error("pixel payload was not valid base64")]
    InvalidPayloadEncoding,

    #[error("pixel payload does not match the declared layout")]
    LayoutMismatch,
}

/// Sentinel for a failure inside the kernel or the code around it.
pub const PROCESSING_FAILED_SENTINEL: f32 = -1.0;

impl DecodeFailure {
    /// Negative value reported in `gpuProcessingTimeMs` for this failure.
    pub fn sentinel(self) -> f32 {
        match self {
            Self::NullRequest => -2.0,
            Self::MissingPayload => -3.0,
            Self::MalformedEnvelope => -4.0,
            Self::InvalidPayloadEncoding => -5.0,
            Self::LayoutMismatch => -6.0,
        }
    }

    pub fn from_sentinel(value: f32) -> Option<Self> {
        [
            Self::NullRequest,
            Self::MissingPayload,
            Self::MalformedEnvelope,
            Self::InvalidPayloadEncoding,
            Self::LayoutMismatch,
        ]
        .into_iter()
        .find(|failure| failure.sentinel() == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequestBody {
    #[serde(default, alias = "ImageDataB64")]
    pub image_data_b64: Option<String>,
    #[serde(default, alias = "Width")]
    pub width: i32,
    #[serde(default, alias = "Height")]
    pub height: i32,
    #[serde(default, alias = "Channels")]
    pub channels: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkReplyBody {
    #[serde(
        default,
        alias = "ProcessedImageDataB64",
        skip_serializing_if = "Option::is_none"
    )]
    pub processed_image_data_b64: Option<String>,
    #[serde(default, alias = "Width")]
    pub width: i32,
    #[serde(default, alias = "Height")]
    pub height: i32,
    #[serde(default, alias = "Channels")]
    pub channels: i32,
    #[serde(alias = "GpuProcessingTimeMs")]
    pub gpu_processing_time_ms: f32,
    #[serde(default, alias = "WorkerTotalTimeMs")]
    pub worker_total_time_ms: f64,
}

/// What became of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    Processed {
        image: RawImage,
        kernel_elapsed_ms: f32,
    },
    DecodeFailed {
        failure: DecodeFailure,
        declared: Option<ImageDims>,
    },
    ProcessingFailed {
        declared: Option<ImageDims>,
    },
}

/// A worker's answer to exactly one request.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkReply {
    pub outcome: WorkOutcome,
    /// Time from receipt until just before the reply is encoded and published,
    /// measured by the worker.
    pub worker_total_ms: f64,
}

/// A request the worker could not decode, with whatever layout it declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRejected {
    pub failure: DecodeFailure,
    pub declared: Option<ImageDims>,
}

impl RequestRejected {
    fn new(failure: DecodeFailure) -> Self {
        Self {
            failure,
            declared: None,
        }
    }
}

pub fn encode_request(image: &RawImage) -> Result<Vec<u8>, WireError> {
    let (width, height, channels) = image.dims().to_wire()?;
    let body = WorkRequestBody {
        image_data_b64: Some(STANDARD.encode(image.pixels())),
        width,
        height,
        channels,
    };
    Ok(serde_json::to_vec(&body)?)
}

pub fn decode_request(body: &[u8]) -> Result<RawImage, RequestRejected> {
    let request = match serde_json::from_slice::<Option<WorkRequestBody>>(body) {
        Ok(Some(request)) => request,
        Ok(None) => return Err(RequestRejected::new(DecodeFailure::NullRequest)),
        Err(e) => {
            log::debug!("Request body is not valid JSON: {}", e);
            return Err(RequestRejected::new(DecodeFailure::MalformedEnvelope));
        }
    };

    let declared = ImageDims::from_wire(
        request.width as i64,
        request.height as i64,
        request.channels as i64,
    );

    let encoded = match request.image_data_b64.as_deref() {
        Some(encoded) if !encoded.is_empty() => encoded,
        _ => {
            return Err(RequestRejected {
                failure: DecodeFailure::MissingPayload,
                declared: declared.ok(),
            })
        }
    };

    let pixels = STANDARD.decode(encoded).map_err(|e| {
        log::debug!("Request payload is not valid base64: {}", e);
        RequestRejected::new(DecodeFailure::InvalidPayloadEncoding)
    })?;

    let layout_mismatch = |declared: Option<ImageDims>| RequestRejected {
        failure: DecodeFailure::LayoutMismatch,
        declared,
    };
    let dims = declared.map_err(|_| layout_mismatch(None))?;
    RawImage::new(dims, pixels).map_err(|_| layout_mismatch(Some(dims)))
}

impl WorkReply {
    pub fn to_body(&self) -> Result<WorkReplyBody, WireError> {
        let with_dims = |dims: Option<ImageDims>| -> Result<(i32, i32, i32), WireError> {
            dims.map_or(Ok((0, 0, 0)), ImageDims::to_wire)
        };

        let (payload, (width, height, channels), gpu_time) = match &self.outcome {
            WorkOutcome::Processed {
                image,
                kernel_elapsed_ms,
            } => (
                Some(STANDARD.encode(image.pixels())),
                image.dims().to_wire()?,
                kernel_elapsed_ms.max(0.0),
            ),
            WorkOutcome::DecodeFailed { failure, declared } => {
                (None, with_dims(*declared)?, failure.sentinel())
            }
            WorkOutcome::ProcessingFailed { declared } => {
                (None, with_dims(*declared)?, PROCESSING_FAILED_SENTINEL)
            }
        };

        Ok(WorkReplyBody {
            processed_image_data_b64: payload,
            width,
            height,
            channels,
            gpu_processing_time_ms: gpu_time,
            worker_total_time_ms: self.worker_total_ms,
        })
    }

    pub fn from_body(body: WorkReplyBody) -> Result<Self, WireError> {
        let declared = ImageDims::from_wire(
            body.width as i64,
            body.height as i64,
            body.channels as i64,
        );

        let gpu_time = body.gpu_processing_time_ms;
        let outcome = if gpu_time >= 0.0 {
            let encoded = body
                .processed_image_data_b64
                .ok_or(WireError::MissingPayload)?;
            let pixels = STANDARD.decode(encoded)?;
            WorkOutcome::Processed {
                image: RawImage::new(declared?, pixels)?,
                kernel_elapsed_ms: gpu_time,
            }
        } else if gpu_time == PROCESSING_FAILED_SENTINEL {
            WorkOutcome::ProcessingFailed {
                declared: declared.ok(),
            }
        } else {
            let failure =
                DecodeFailure::from_sentinel(gpu_time).ok_or(WireError::UnknownSentinel(gpu_time))?;
            WorkOutcome::DecodeFailed {
                failure,
                declared: declared.ok(),
            }
        };

        Ok(Self {
            outcome,
            worker_total_ms: body.worker_total_time_ms,
        })
    }
}

pub fn encode_reply(reply: &WorkReply) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(&reply.to_body()?)?)
}

pub fn decode_reply(body: &[u8]) -> Result<WorkReply, WireError> {
    WorkReply::from_body(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> RawImage {
        let dims = ImageDims::new(2, 2, 3).unwrap();
        RawImage::new(dims, (0u8..12).map(|b| b * 21).collect()).unwrap()
    }

    #[test]
    fn test_request_round_trip_preserves_pixels() {
        let image = sample_image();
        let body = encode_request(&image).unwrap();
        assert_eq!(decode_request(&body).unwrap(), image);
    }

    #[test]
    fn test_request_uses_camel_case_fields() {
        let json: serde_json::Value =
            serde_json::from_slice(&encode_request(&sample_image()).unwrap()).unwrap();
        assert!(json["imageDataB64"].is_string());
        assert_eq!(json["width"], 2);
        assert_eq!(json["height"], 2);
        assert_eq!(json["channels"], 3);
    }

    #[test]
    fn test_request_accepts_pascal_case_fields() {
        let body = br#"{"ImageDataB64":"AAECAw==","Width":2,"Height":2,"Channels":1}"#;
        let image = decode_request(body).unwrap();
        assert_eq!(image.pixels(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_payload_is_missing_payload() {
        let body = br#"{"imageDataB64":"","width":2,"height":2,"channels":3}"#;
        let rejected = decode_request(body).unwrap_err();
        assert_eq!(rejected.failure, DecodeFailure::MissingPayload);
        assert_eq!(rejected.declared, Some(ImageDims::new(2, 2, 3).unwrap()));
    }

    #[test]
    fn test_absent_payload_is_missing_payload() {
        let rejected = decode_request(br#"{"width":1,"height":1,"channels":1}"#).unwrap_err();
        assert_eq!(rejected.failure, DecodeFailure::MissingPayload);
    }

    #[test]
    fn test_null_body_is_null_request() {
        let rejected = decode_request(b"null").unwrap_err();
        assert_eq!(rejected.failure, DecodeFailure::NullRequest);
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let full = encode_request(&sample_image()).unwrap();
        let rejected = decode_request(&full[..full.len() / 2]).unwrap_err();
        assert_eq!(rejected.failure, DecodeFailure::MalformedEnvelope);
        assert_eq!(rejected.declared, None);
    }

    #[test]
    fn test_bad_base64_is_invalid_encoding() {
        let body = br#"{"imageDataB64":"not base64!","width":1,"height":1,"channels":1}"#;
        let rejected = decode_request(body).unwrap_err();
        assert_eq!(rejected.failure, DecodeFailure::InvalidPayloadEncoding);
    }

    #[test]
    fn test_length_disagreeing_with_dims_is_layout_mismatch() {
        let body = br#"{"imageDataB64":"AAECAw==","width":3,"height":3,"channels":3}"#;
        let rejected = decode_request(body).unwrap_err();
        assert_eq!(rejected.failure, DecodeFailure::LayoutMismatch);
    }

    #[test]
    fn test_negative_dims_are_layout_mismatch() {
        let body = br#"{"imageDataB64":"AAECAw==","width":-2,"height":-2,"channels":1}"#;
        let rejected = decode_request(body).unwrap_err();
        assert_eq!(rejected.failure, DecodeFailure::LayoutMismatch);
        assert_eq!(rejected.declared, None);
    }

    #[test]
    fn test_sentinels_are_distinct() {
        let failures = [
            DecodeFailure::NullRequest,
            DecodeFailure::MissingPayload,
            DecodeFailure::MalformedEnvelope,
            DecodeFailure::InvalidPayloadEncoding,
            DecodeFailure::LayoutMismatch,
        ];
        for failure in failures {
            assert!(failure.sentinel() < 0.0);
            assert_ne!(failure.sentinel(), PROCESSING_FAILED_SENTINEL);
            assert_eq!(DecodeFailure::from_sentinel(failure.sentinel()), Some(failure));
        }
        assert_eq!(DecodeFailure::from_sentinel(-42.0), None);
    }

    #[test]
    fn test_processed_reply_round_trip() {
        let reply = WorkReply {
            outcome: WorkOutcome::Processed {
                image: sample_image(),
                kernel_elapsed_ms: 1.5,
            },
            worker_total_ms: 4.25,
        };
        let decoded = decode_reply(&encode_reply(&reply).unwrap()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_failed_reply_has_no_payload_field() {
        let reply = WorkReply {
            outcome: WorkOutcome::DecodeFailed {
                failure: DecodeFailure::MissingPayload,
                declared: Some(ImageDims::new(4, 4, 1).unwrap()),
            },
            worker_total_ms: 0.3,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&encode_reply(&reply).unwrap()).unwrap();
        assert!(json.get("processedImageDataB64").is_none());
        assert_eq!(json["gpuProcessingTimeMs"], -3.0);
        assert_eq!(json["width"], 4);

        assert_eq!(decode_reply(&encode_reply(&reply).unwrap()).unwrap(), reply);
    }

    #[test]
    fn test_processing_failure_reply_decodes() {
        let body = br#"{"width":0,"height":0,"channels":0,"gpuProcessingTimeMs":-1,"workerTotalTimeMs":2.0}"#;
        let reply = decode_reply(body).unwrap();
        assert_eq!(reply.outcome, WorkOutcome::ProcessingFailed { declared: None });
        assert_eq!(reply.worker_total_ms, 2.0);
    }

    #[test]
    fn test_success_reply_without_payload_is_rejected() {
        let body = br#"{"width":1,"height":1,"channels":1,"gpuProcessingTimeMs":0.5,"workerTotalTimeMs":1.0}"#;
        assert!(matches!(decode_reply(body), Err(WireError::MissingPayload)));
    }

    #[test]
    fn test_unknown_sentinel_is_rejected() {
        let body = br#"{"width":0,"height":0,"channels":0,"gpuProcessingTimeMs":-9,"workerTotalTimeMs":1.0}"#;
        assert!(matches!(decode_reply(body), Err(WireError::UnknownSentinel(_))));
    }

    #[test]
    fn test_dims_reject_zero_and_overflow() {
        assert!(ImageDims::new(0, 1, 1).is_err());
        assert!(ImageDims::new(u32::MAX, u32::MAX, u32::MAX).is_err());
    }

    #[test]
    fn test_dims_are_read_through_accessors() {
        let dims = ImageDims::new(640, 480, 3).unwrap();
        assert_eq!((dims.width(), dims.height(), dims.channels()), (640, 480, 3));
        assert_eq!(dims.byte_len(), 921_600);

        // Refused up front, so byte_len never sees a layout it cannot multiply out
        assert!(ImageDims::new(u32::MAX, u32::MAX, 255).is_err());
        let padded = RawImage::new(ImageDims::new(1, 1, 1).unwrap(), vec![0; 2]);
        assert!(matches!(padded, Err(WireError::LayoutMismatch { expected: 1, actual: 2 })));
    }
}
