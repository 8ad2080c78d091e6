use hyper::{Body, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Unified error type for the streaming gateway.
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("Stream not found: {stream_id}")]
    StreamNotFound { stream_id: String },

    #[error("Stream already exists: {stream_id}")]
    StreamAlreadyExists { stream_id: String },

    #[error("Segment {seq} not found for stream {stream_id}")]
    SegmentNotFound { stream_id: String, seq: u64 },

    #[error("Codecs not ready for stream {stream_id}, possible stream offline")]
    CodecNotReady { stream_id: String },

    #[error("Camera not found: {camera_id}")]
    CameraNotFound { camera_id: String },

    #[error("Camera registry error: {message}")]
    CameraRegistryError { message: String },

    #[error("Mux error: {message}")]
    MuxError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Internal server error: {message}")]
    InternalError { message: String },
}

impl From<config::ConfigError> for StreamingError {
    fn from(err: config::ConfigError) -> Self {
        StreamingError::ConfigError {
            message: err.to_string(),
        }
    }
}

impl StreamingError {
    pub fn error_code(&self) -> &'static str {
        match self {
            StreamingError::StreamNotFound { .. } => "STREAM_NOT_FOUND",
            StreamingError::StreamAlreadyExists { .. } => "STREAM_ALREADY_EXISTS",
            StreamingError::SegmentNotFound { .. } => "SEGMENT_NOT_FOUND",
            StreamingError::CodecNotReady { .. } => "CODEC_NOT_READY",
            StreamingError::CameraNotFound { .. } => "CAMERA_NOT_FOUND",
            StreamingError::CameraRegistryError { .. } => "CAMERA_REGISTRY_ERROR",
            StreamingError::MuxError { .. } => "MUX_ERROR",
            StreamingError::ConfigError { .. } => "CONFIG_ERROR",
            StreamingError::InvalidRequest { .. } => "INVALID_REQUEST",
            StreamingError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            StreamingError::StreamNotFound { .. } => StatusCode::NOT_FOUND,
            StreamingError::StreamAlreadyExists { .. } => StatusCode::CONFLICT,
            StreamingError::SegmentNotFound { .. } => StatusCode::NOT_FOUND,
            StreamingError::CodecNotReady { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StreamingError::CameraNotFound { .. } => StatusCode::NOT_FOUND,
            StreamingError::CameraRegistryError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StreamingError::MuxError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StreamingError::ConfigError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StreamingError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            StreamingError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn should_log_error(&self) -> bool {
        !matches!(
            self,
            StreamingError::StreamNotFound { .. }
                | StreamingError::StreamAlreadyExists { .. }
                | StreamingError::SegmentNotFound { .. }
                | StreamingError::CameraNotFound { .. }
                | StreamingError::InvalidRequest { .. }
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: String,
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn from_error(error: &StreamingError) -> Self {
        Self {
            status: "error".to_string(),
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Translates gateway errors into JSON HTTP responses.
pub struct ErrorHandler;

impl ErrorHandler {
    pub fn handle_error(error: &StreamingError) -> Response<Body> {
        if error.should_log_error() {
            log::error!("Streaming error: {}", error);
        } else {
            log::warn!("Client error: {}", error);
        }

        let error_response = ErrorResponse::from_error(error);
        let status = error.http_status();

        let body = match serde_json::to_string(&error_response) {
            Ok(json) => Body::from(json),
            Err(_) => Body::from(r#"{"status":"error","message":"Failed to serialize error"}"#),
        };

        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(body)
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("Failed to build error response"))
                    .unwrap()
            })
    }

    pub fn handle_success<T: Serialize>(status: StatusCode, data: T) -> Response<Body> {
        match serde_json::to_string(&data) {
            Ok(json) => Response::builder()
                .status(status)
                .header("Content-Type", "application/json")
                .body(Body::from(json))
                .unwrap_or_else(|_| {
                    Self::handle_error(&StreamingError::InternalError {
                        message: "Failed to build success response".to_string(),
                    })
                }),
            Err(e) => {
                log::error!("Failed to serialize success response: {}", e);
                Self::handle_error(&StreamingError::InternalError {
                    message: "Failed to serialize response".to_string(),
                })
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamingError>;
