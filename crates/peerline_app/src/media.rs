//! Turning files into `data:` URLs for media messages.

use std::path::Path;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Largest file accepted for a media message.
pub const MAX_MEDIA_BYTES: usize = 16 * 1024 * 1024;

/// Read `path` and encode it as `data:<mime>;base64,<payload>`.
pub async fn read_data_url(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if bytes.len() > MAX_MEDIA_BYTES {
        bail!(
            "{} is {} bytes; media is limited to {MAX_MEDIA_BYTES}",
            path.display(),
            bytes.len()
        );
    }
    Ok(data_url(mime_for(path), &bytes))
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

/// Media type guessed from the file extension.
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Short description of a `data:` URL for the terminal.
pub fn describe(data_url: &str) -> String {
    match data_url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
    {
        Some((header, payload)) => {
            let mime = header.split(';').next().unwrap_or_default();
            let mime = if mime.is_empty() { "text/plain" } else { mime };
            let size = if header.ends_with(";base64") {
                (payload.len() / 4 * 3)
                    .saturating_sub(payload.chars().rev().take_while(|c| *c == '=').count())
            } else {
                payload.len()
            };
            format!("{mime}, {size} bytes")
        }
        None => format!("{} bytes", data_url.len()),
    }
}
