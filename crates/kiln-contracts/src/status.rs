use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::request::{GenerationKind, GenerationParameters};

/// Where a finished asset lives: a remote URL or bytes carried inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocator {
    Url(String),
    Inline { mime_type: String, data: String },
}

impl AssetLocator {
    pub fn url(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let has_scheme = trimmed.starts_with("https://") || trimmed.starts_with("http://");
        if !has_scheme || trimmed.chars().any(char::is_whitespace) {
            return None;
        }
        let host = trimmed.split("://").nth(1).unwrap_or_default();
        if host.is_empty() || host.starts_with('/') {
            return None;
        }
        Some(Self::Url(trimmed.to_string()))
    }

    pub fn from_base64(mime_type: &str, raw: &str) -> Option<Self> {
        let data: String = raw.chars().filter(|ch| !ch.is_ascii_whitespace()).collect();
        if data.is_empty() || BASE64.decode(data.as_bytes()).is_err() {
            return None;
        }
        Some(Self::Inline {
            mime_type: mime_type.to_string(),
            data,
        })
    }

    pub fn from_data_uri(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix("data:")?;
        let (header, data) = rest.split_once(',')?;
        let mime_type = header.strip_suffix(";base64")?;
        let mime_type = if mime_type.is_empty() {
            "application/octet-stream"
        } else {
            mime_type
        };
        Self::from_base64(mime_type, data)
    }

    pub fn inline_from_bytes(mime_type: &str, bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        Some(Self::Inline {
            mime_type: mime_type.to_string(),
            data: BASE64.encode(bytes),
        })
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }

    pub fn uri(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Inline { mime_type, data } => format!("data:{mime_type};base64,{data}"),
        }
    }

    pub fn decode_inline(&self) -> Option<Vec<u8>> {
        match self {
            Self::Url(_) => None,
            Self::Inline { data, .. } => BASE64.decode(data.as_bytes()).ok(),
        }
    }
}

impl fmt::Display for AssetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Inline { mime_type, data } => write!(f, "data:{mime_type};base64,{data}"),
        }
    }
}

impl Serialize for AssetLocator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.uri())
    }
}

/// Canonical status every provider vocabulary is folded into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum GenerationStatus {
    Processing,
    Succeeded { asset: AssetLocator },
    Failed { reason: String },
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

/// Opaque provider-side task. Not `Clone`: a handle is moved into the single
/// poll loop that owns it and dropped once terminal.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub provider: String,
    pub task_id: String,
    pub kind: GenerationKind,
    pub created_at: DateTime<Utc>,
}

impl TaskHandle {
    pub fn new(
        provider: impl Into<String>,
        task_id: impl Into<String>,
        kind: GenerationKind,
    ) -> Self {
        Self {
            provider: provider.into(),
            task_id: task_id.into(),
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn poll_key(&self) -> String {
        format!("{}/{}", self.provider, self.task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub request_id: Uuid,
    pub provider: String,
    pub model: Option<String>,
    pub kind: GenerationKind,
    pub prompt: String,
    pub parameters: GenerationParameters,
    pub asset: AssetLocator,
    pub task_id: Option<String>,
    /// Set when the locator is a predicted URL substituted after a failed
    /// submission (opt-in soft fallback), not a confirmed provider asset.
    pub degraded: bool,
    pub completed_at: DateTime<Utc>,
}
