use std::path::{Path, PathBuf};

use kiln_contracts::{AssetLocator, GenerationKind};
use thiserror::Error;

use crate::transport::{OutboundRequest, Transport, TransportError};

#[derive(Debug, Error)]
pub enum AssetSaveError {
    #[error("inline asset is not valid base64")]
    Decode,
    #[error("asset download failed with status {0}")]
    DownloadStatus(u16),
    #[error("asset download failed: {0}")]
    Download(#[from] TransportError),
    #[error("asset body was empty")]
    Empty,
    #[error("failed to write asset: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes the asset into `dir` as `<stem>.<ext>`. Remote assets are fetched
/// without credentials; provider CDNs serve signed or public URLs.
pub async fn save_asset(
    transport: &dyn Transport,
    asset: &AssetLocator,
    kind: GenerationKind,
    dir: &Path,
    stem: &str,
) -> Result<PathBuf, AssetSaveError> {
    let (bytes, mime_type) = match asset {
        AssetLocator::Inline { mime_type, .. } => {
            let bytes = asset.decode_inline().ok_or(AssetSaveError::Decode)?;
            (bytes, Some(mime_type.clone()))
        }
        AssetLocator::Url(url) => {
            let reply = transport.send(OutboundRequest::get(url.as_str())).await?;
            if !reply.is_success() {
                return Err(AssetSaveError::DownloadStatus(reply.status));
            }
            (reply.body.to_vec(), reply.content_type.clone())
        }
    };
    if bytes.is_empty() {
        return Err(AssetSaveError::Empty);
    }

    let url_path = match asset {
        AssetLocator::Url(url) => Some(url.as_str()),
        AssetLocator::Inline { .. } => None,
    };
    let ext = extension_for(mime_type.as_deref(), url_path, kind);
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{stem}.{ext}"));
    tokio::fs::write(&path, &bytes).await?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "asset saved");
    Ok(path)
}

pub fn extension_for(mime: Option<&str>, url: Option<&str>, kind: GenerationKind) -> &'static str {
    if let Some(ext) = mime.and_then(extension_from_mime) {
        return ext;
    }
    if let Some(ext) = url.and_then(extension_from_url) {
        return ext;
    }
    match kind {
        GenerationKind::Image => "png",
        GenerationKind::Video => "mp4",
    }
}

fn extension_from_mime(mime: &str) -> Option<&'static str> {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return Some("jpg");
    }
    if lowered.contains("webp") {
        return Some("webp");
    }
    if lowered.contains("png") {
        return Some("png");
    }
    if lowered.contains("gif") {
        return Some("gif");
    }
    if lowered.contains("mp4") {
        return Some("mp4");
    }
    if lowered.contains("webm") {
        return Some("webm");
    }
    None
}

fn extension_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("png"),
        "jpg" | "jpeg" => Some("jpg"),
        "webp" => Some("webp"),
        "gif" => Some("gif"),
        "mp4" => Some("mp4"),
        "webm" => Some("webm"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use kiln_contracts::GenerationKind;

    use super::extension_for;

    #[test]
    fn extension_prefers_mime_then_url_then_kind() {
        assert_eq!(extension_for(Some("image/jpeg"), Some("https://cdn/x.png"), GenerationKind::Image), "jpg");
        assert_eq!(extension_for(None, Some("https://cdn/x.webp?sig=1"), GenerationKind::Image), "webp");
        assert_eq!(extension_for(Some("application/octet-stream"), None, GenerationKind::Video), "mp4");
        assert_eq!(extension_for(None, Some("https://cdn/render"), GenerationKind::Image), "png");
    }
}
