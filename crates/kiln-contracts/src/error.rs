use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use thiserror::Error;

/// Provider bodies captured into diagnostics are cut to this many chars.
pub const DETAIL_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    AuthRequired,
    RateLimit,
    Protocol,
    Upstream,
    Network,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::AuthRequired => "AuthRequiredError",
            Self::RateLimit => "RateLimitError",
            Self::Protocol => "ProtocolError",
            Self::Upstream => "UpstreamError",
            Self::Network => "NetworkError",
            Self::Timeout => "TimeoutError",
        }
    }

    pub fn default_http_status(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::AuthRequired => 401,
            Self::RateLimit => 429,
            Self::Protocol | Self::Upstream | Self::Network => 502,
            Self::Timeout => 504,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A failure mapped into the closed taxonomy.
///
/// `message` is safe to show to an end user. `details` carries diagnostics
/// (provider id, truncated raw body, upstream message) and is never rendered
/// by `Display` or `Serialize`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
    pub http_status: u16,
    pub details: Value,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            http_status: kind.default_http_status(),
            details: Value::Null,
        }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    pub fn auth_required(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthRequired, code, message)
    }

    pub fn rate_limited(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, code, message)
    }

    pub fn protocol(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, code, message)
    }

    pub fn upstream(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, code, message)
    }

    pub fn network(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, code, message)
    }

    pub fn timeout(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, code, message)
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = status;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Maps a non-2xx provider status code. Each branch implies a different
    /// caller remedy, so each gets its own stable code.
    pub fn from_provider_status(status: u16) -> Self {
        match status {
            401 => Self::auth_required(
                "credential_invalid",
                "The provider rejected the API key. Check the key and try again.",
            ),
            403 => Self::auth_required(
                "credential_forbidden",
                "The API key is not allowed to use this provider or model.",
            )
            .with_http_status(403),
            402 => Self::upstream(
                "insufficient_balance",
                "The provider account has insufficient credits.",
            )
            .with_http_status(402),
            404 => Self::upstream(
                "endpoint_unavailable",
                "The provider endpoint is unavailable. Try another provider.",
            )
            .with_http_status(404),
            429 => Self::rate_limited(
                "provider_rate_limited",
                "The provider is rate limiting requests. Wait a moment and try again.",
            ),
            400 | 409 | 413 | 422 => Self::validation(
                "provider_rejected",
                "The provider rejected the request parameters.",
            ),
            500.. => Self::upstream(
                "upstream_failure",
                "The provider is currently unavailable. Try again later or use another provider.",
            ),
            _ => Self::upstream(
                "upstream_unexpected_status",
                "The provider returned an unexpected error.",
            ),
        }
    }

    /// Caller-facing JSON body. Diagnostics never leave the process this way.
    pub fn public_body(&self) -> Value {
        json!({
            "error": {
                "kind": self.kind,
                "code": self.code,
                "message": self.message,
            }
        })
    }
}

impl Serialize for ClassifiedError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ClassifiedError", 4)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("code", self.code)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("http_status", &self.http_status)?;
        state.end()
    }
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Replaces every occurrence of `secret` in `text`. Providers occasionally
/// echo the submitted key back inside error bodies.
pub fn scrub_secret(text: &str, secret: Option<&str>) -> String {
    match secret.map(str::trim).filter(|value| !value.is_empty()) {
        Some(secret) => text.replace(secret, "[redacted]"),
        None => text.to_string(),
    }
}

/// Scrubbed and truncated provider body, ready to be stored in `details`.
pub fn diagnostic_excerpt(body: &str, secret: Option<&str>) -> String {
    truncate_text(&scrub_secret(body, secret), DETAIL_BODY_MAX_CHARS)
}
