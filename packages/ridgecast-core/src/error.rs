//! Centralized error types for the Ridgecast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the Ridgecast daemons.
#[derive(Debug, Error)]
pub enum RidgecastError {
    /// Configuration rejected at startup (bad bind address, bad capacity).
    ///
    /// This is the only error class that may abort a daemon; everything
    /// after startup degrades to fallback audio instead.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failed to bind a listening socket.
    #[error("Bind failed: {0}")]
    Bind(#[from] std::io::Error),

    /// The PCM transport produced data the tower cannot accept.
    #[error("Invalid PCM data: {0}")]
    InvalidPcm(String),

    /// A control event failed validation at the boundary.
    #[error("Invalid control event: {0}")]
    InvalidEvent(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The ffmpeg child could not be spawned or supervised.
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// A segment decoder failed (spawn failure, instant EOF, stall).
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// Station-side transport to the tower failed.
    #[error("Feed error: {0}")]
    Feed(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RidgecastError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Bind(_) => "bind_failed",
            Self::InvalidPcm(_) => "invalid_pcm",
            Self::InvalidEvent(_) => "invalid_event",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Encoder(_) => "encoder_error",
            Self::Decoder(_) => "decoder_error",
            Self::Feed(_) => "feed_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type RidgecastResult<T> = Result<T, RidgecastError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for RidgecastError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
