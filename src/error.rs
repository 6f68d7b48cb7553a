use crate::types::{RateLimitInfo, SearchResult};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("URL encoding error: {0}")]
    UrlEncode(#[from] serde_urlencoded::ser::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    /// The remote error kind, if this error was reported by trace.moe.
    pub fn api_kind(&self) -> Option<ApiErrorKind> {
        match self {
            Error::Api(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure kind trace.moe can report, either through the HTTP status
/// or through the `error` field of a search body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    BadRequest,
    SearchQuotaDepleted,
    Forbidden,
    MethodNotAllowed,
    PayloadTooLarge,
    TooManyRequests,
    InternalServerError,
    ServiceUnavailable,
    GatewayTimeout,
    InvalidApiKey,
    ConcurrencyLimitExceeded,
    SearchQueueFull,
    InvalidImageUrl,
    FailedFetchImage,
    FailedProcessImage,
    FailedDetectAndCutBorders,
    /// Anything the tables below do not recognise.
    Other,
}

impl ApiErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ApiErrorKind::BadRequest,
            402 => ApiErrorKind::SearchQuotaDepleted,
            403 => ApiErrorKind::Forbidden,
            405 => ApiErrorKind::MethodNotAllowed,
            413 => ApiErrorKind::PayloadTooLarge,
            429 => ApiErrorKind::TooManyRequests,
            500 => ApiErrorKind::InternalServerError,
            503 => ApiErrorKind::ServiceUnavailable,
            504 => ApiErrorKind::GatewayTimeout,
            _ => ApiErrorKind::Other,
        }
    }

    /// Classifies the `error` string of a search body. Arms are tried top to
    /// bottom, so the exact messages win over the substring rule.
    pub fn from_message(message: &str) -> Self {
        match message {
            "Invalid API key" => ApiErrorKind::InvalidApiKey,
            "Search quota depleted" => ApiErrorKind::SearchQuotaDepleted,
            "Concurrency limit exceeded" => ApiErrorKind::ConcurrencyLimitExceeded,
            "Error: Search queue is full" => ApiErrorKind::SearchQueueFull,
            "Invalid image url" => ApiErrorKind::InvalidImageUrl,
            m if m.contains("Failed to fetch image") => ApiErrorKind::FailedFetchImage,
            "Failed to process image" => ApiErrorKind::FailedProcessImage,
            "OpenCV: Failed to detect and cut borders" => {
                ApiErrorKind::FailedDetectAndCutBorders
            }
            _ => ApiErrorKind::Other,
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiErrorKind::BadRequest => "Bad request",
            ApiErrorKind::SearchQuotaDepleted => "Search quota depleted",
            ApiErrorKind::Forbidden => "Forbidden",
            ApiErrorKind::MethodNotAllowed => "Method not allowed",
            ApiErrorKind::PayloadTooLarge => "Payload too large",
            ApiErrorKind::TooManyRequests => "Too many requests",
            ApiErrorKind::InternalServerError => "Internal server error",
            ApiErrorKind::ServiceUnavailable => "Service unavailable",
            ApiErrorKind::GatewayTimeout => "Gateway timeout",
            ApiErrorKind::InvalidApiKey => "Invalid API key",
            ApiErrorKind::ConcurrencyLimitExceeded => "Concurrency limit exceeded",
            ApiErrorKind::SearchQueueFull => "Search queue full",
            ApiErrorKind::InvalidImageUrl => "Invalid image url",
            ApiErrorKind::FailedFetchImage => "Failed to fetch image",
            ApiErrorKind::FailedProcessImage => "Failed to process image",
            ApiErrorKind::FailedDetectAndCutBorders => "Failed to detect and cut borders",
            ApiErrorKind::Other => "trace.moe API error",
        };
        f.write_str(name)
    }
}

/// A failure reported by trace.moe. Carries enough context to log or display
/// without the raw transport response.
#[derive(Error, Debug, Clone)]
#[error("{kind} ({url}): {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    /// Endpoint that was called, without the query string.
    pub url: String,
    pub message: String,
    /// `None` when the error was embedded in a 200 response.
    pub status: Option<u16>,
    pub limits: RateLimitInfo,
    /// Decoded response body, when it was valid JSON.
    pub body: Option<serde_json::Value>,
    /// The search result built from the body, for `/search` calls.
    pub response: Option<Box<SearchResult>>,
}

impl ApiError {
    pub fn search_result(&self) -> Option<&SearchResult> {
        self.response.as_deref()
    }
}
