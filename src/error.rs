//! Error types for the gateway and its subsystems.
//!
//! One closed set of error kinds shared by the request pipeline, the
//! registry, the event bus and the WebSocket fabric. Every variant carries
//! a stable machine code and maps to exactly one HTTP status; the pipeline
//! boundary is the only place these are converted into responses.

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Authentication failure kinds, each with its own machine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed authorization header")]
    MalformedHeader,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("wrong token type")]
    WrongTokenType,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedHeader => "malformed_header",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::Expired => "expired",
            AuthError::WrongTokenType => "wrong_token_type",
        }
    }
}

/// Gateway error types
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("rate limit exceeded, retry after {retry_after}s")]
    TooManyRequests {
        limit: u32,
        retry_after: u64,
        reset_at: u64,
    },

    #[error("no healthy instances for service: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream request failed: {0}")]
    UpstreamFailed(String),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("internal error: {0}")]
    Internal(String),

    // Event bus
    #[error("event publish failed: {0}")]
    PublishFailed(String),

    #[error("handler timed out: {0}")]
    HandlerTimeout(String),

    #[error("handler failed: {0}")]
    HandlerError(String),

    #[error("retries exhausted for handler: {0}")]
    RetriesExhausted(String),

    // Registry / shared store
    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    // WebSocket
    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("subscription denied for topic: {0}")]
    SubscriptionDenied(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

impl GatewayError {
    /// Stable machine-readable code included in every error response.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Unauthorized(auth) => auth.code(),
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::ValidationFailed(_) => "validation_failed",
            GatewayError::TooManyRequests { .. } => "too_many_requests",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::UpstreamFailed(_) => "upstream_failed",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::Internal(_) => "internal",
            GatewayError::PublishFailed(_) => "publish_failed",
            GatewayError::HandlerTimeout(_) => "handler_timeout",
            GatewayError::HandlerError(_) => "handler_error",
            GatewayError::RetriesExhausted(_) => "retries_exhausted",
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::AlreadyRegistered(_) => "already_registered",
            GatewayError::AuthRequired => "auth_required",
            GatewayError::AuthFailed(_) => "auth_failed",
            GatewayError::SubscriptionDenied(_) => "subscription_denied",
            GatewayError::UnknownMessageType(_) => "unknown_message_type",
        }
    }

    /// HTTP status this error is shaped into at the pipeline boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::AuthRequired => 401,
            GatewayError::AuthFailed(_) => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::SubscriptionDenied(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::ValidationFailed(_) => 422,
            GatewayError::UnknownMessageType(_) => 400,
            GatewayError::TooManyRequests { .. } => 429,
            GatewayError::UpstreamUnavailable(_) => 503,
            GatewayError::StoreUnavailable(_) => 503,
            GatewayError::UpstreamFailed(_) => 502,
            GatewayError::UpstreamTimeout => 504,
            GatewayError::AlreadyRegistered(_) => 400,
            GatewayError::PublishFailed(_)
            | GatewayError::HandlerTimeout(_)
            | GatewayError::HandlerError(_)
            | GatewayError::RetriesExhausted(_)
            | GatewayError::Internal(_) => 500,
        }
    }

    /// Whether a background loop should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::StoreUnavailable(_)
                | GatewayError::UpstreamTimeout
                | GatewayError::UpstreamFailed(_)
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(format!("IO error: {}", err))
    }
}
