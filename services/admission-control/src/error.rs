// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Error types for admission control.
//!
//! Denials and waitlist grants are ordinary return values. The variants here
//! are the outcomes a caller must be told about as a failure.

use crate::middleware::write_rate_limit_headers;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

/// Why an event refuses RSVPs outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotAdmissibleReason {
    /// Event has not been published
    Unpublished,
    /// Event start time has passed
    AlreadyStarted,
}

impl std::fmt::Display for NotAdmissibleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unpublished => write!(f, "event is not published"),
            Self::AlreadyStarted => write!(f, "event has already started"),
        }
    }
}

/// Admission-control error types.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Rate limit exceeded for {policy}: retry in {retry_after_secs}s")]
    RateLimitExceeded {
        policy: String,
        limit: u32,
        retry_after_secs: u64,
        reset_at: DateTime<Utc>,
    },

    #[error("Registration for event {event_id} closed at {deadline}")]
    RegistrationClosed {
        event_id: String,
        deadline: DateTime<Utc>,
    },

    #[error("Event {event_id} is not accepting RSVPs: {reason}")]
    EventNotAdmissible {
        event_id: String,
        reason: NotAdmissibleReason,
    },

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Failed to persist waitlist promotion of {attendee_id} for event {event_id}: {reason}")]
    PromotionPersistFailure {
        event_id: String,
        attendee_id: String,
        reason: String,
    },

    #[error("Invalid policy {policy}: {reason}")]
    InvalidPolicy { policy: String, reason: String },

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Record store error: {0}")]
    Store(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Error response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<String>,
}

impl AdmissionError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::RegistrationClosed { .. } => "REGISTRATION_CLOSED",
            Self::EventNotAdmissible { .. } => "EVENT_NOT_ADMISSIBLE",
            Self::EventNotFound(_) => "EVENT_NOT_FOUND",
            Self::PromotionPersistFailure { .. } => "PROMOTION_PERSIST_FAILURE",
            Self::InvalidPolicy { .. } => "INVALID_POLICY",
            Self::UnknownPolicy(_) => "UNKNOWN_POLICY",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Store(_) => "STORE_UNAVAILABLE",
        }
    }

    /// HTTP status the error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RegistrationClosed { .. } => StatusCode::CONFLICT,
            Self::EventNotAdmissible { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::EventNotFound(_) | Self::UnknownPolicy(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PromotionPersistFailure { .. } | Self::InvalidPolicy { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. } | Self::Store(_))
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (retry_after_seconds, reset_at) = match &self {
            Self::RateLimitExceeded {
                retry_after_secs,
                reset_at,
                ..
            } => (
                Some(*retry_after_secs),
                Some(reset_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
            _ => (None, None),
        };

        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            status_code: status.as_u16(),
            retry_after_seconds,
            reset_at,
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimitExceeded {
            limit,
            retry_after_secs,
            reset_at,
            ..
        } = &self
        {
            write_rate_limit_headers(
                response.headers_mut(),
                *limit,
                0,
                *reset_at,
                Some(*retry_after_secs),
            );
        }
        response
    }
}
