//! Image attachments: downloads files shared by humans and turns them into
//! `data:` URLs for models that accept image input.

use base64::Engine;
use tracing::{debug, info, warn};

use crate::platform::{ChatPlatform, FileRef};

/// Larger files are skipped rather than sent.
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// MIME type of a JPEG, PNG or GIF image, judged by its magic bytes.
///
/// Other formats (and anything that only claims to be an image) are `None`.
pub fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else {
        None
    }
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{mime};base64,{b64}")
}

/// Download every image in `files`. Failures and unsupported formats are
/// logged and skipped; they never fail the prompt.
pub async fn image_urls(platform: &dyn ChatPlatform, files: &[FileRef]) -> Vec<String> {
    let mut urls = Vec::new();
    for file in files.iter().filter(|f| f.is_image()) {
        let bytes = match platform.download_file(file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(url = %file.url, error = %e, "failed to download image");
                continue;
            }
        };
        if bytes.len() > MAX_IMAGE_BYTES {
            info!(url = %file.url, size = bytes.len(), "skipping oversized image");
            continue;
        }
        match sniff_image(&bytes) {
            Some(mime) => urls.push(data_url(mime, &bytes)),
            None => info!(
                url = %file.url,
                mimetype = ?file.mimetype,
                "skipping unsupported image format"
            ),
        }
    }
    if !urls.is_empty() {
        debug!(images = urls.len(), "attached images");
    }
    urls
}
