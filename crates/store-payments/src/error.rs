//! Payment Error Types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Fulfillment pipeline errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    InvalidSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Stripe API error
    #[error("Stripe error: {0}")]
    Stripe(String),

    /// PayPal API error
    #[error("PayPal error: {0}")]
    PayPal(String),

    /// Non-success HTTP response from a downstream service
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Request exceeded its time budget
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection-level failure (DNS, reset, TLS)
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Downstream service answered with something we could not use
    #[error("Downstream error: {0}")]
    Downstream(String),
}

impl PaymentError {
    /// Check if this error is retryable
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::Storage(_) => true,
            Self::Http { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            _ => false,
        }
    }

    /// HTTP status of a non-success downstream response, if any
    pub const fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Status code the webhook route answers with when this error escapes
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidSignature(_) | Self::WebhookParse(_) => 400,
            _ => 500,
        }
    }

    /// Get user-friendly message
    pub const fn user_message(&self) -> &str {
        match self {
            Self::InvalidSignature(_) => "Invalid webhook signature.",
            Self::WebhookParse(_) => "Malformed webhook payload.",
            Self::Config(_) => "Service configuration error.",
            _ => "Failed to process event",
        }
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else if e.is_decode() {
            Self::Downstream(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<sqlx::Error> for PaymentError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<stripe::StripeError> for PaymentError {
    fn from(e: stripe::StripeError) -> Self {
        Self::Stripe(e.to_string())
    }
}

/// JSON failures outside webhook intake are internal; webhook parsers map
/// their own errors to `WebhookParse`.
impl From<serde_json::Error> for PaymentError {
    fn from(e: serde_json::Error) -> Self {
        Self::Downstream(e.to_string())
    }
}

/// Keep at most `limit` bytes of `body`, cut back to a char boundary.
pub(crate) fn clip(mut body: String, limit: usize) -> String {
    if body.len() > limit {
        let mut end = limit;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
