/// Magic-byte content sniffing for origin payloads.
///
/// Mirrors the browser-style detection table for the formats the proxy
/// cares about and falls back to a text/binary split for everything else.
pub fn detect(data: &[u8]) -> &'static str {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        match &data[8..12] {
            b"avif" | b"avis" => return "image/avif",
            _ => {}
        }
    }
    if data.starts_with(b"BM") {
        return "image/bmp";
    }
    if data.starts_with(b"II*\x00") || data.starts_with(b"MM\x00*") {
        return "image/tiff";
    }
    if data.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return "image/x-icon";
    }
    if data.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    detect_text(data)
}

/// Content type for a raw media response: like [`detect`], but XML and
/// plain-text detections are reported as SVG, since unmarked SVG bodies
/// are the only text the origin store serves.
pub fn media_content_type(data: &[u8]) -> &'static str {
    match detect(data) {
        "text/xml; charset=utf-8" | "text/plain; charset=utf-8" => "image/svg+xml",
        other => other,
    }
}

fn detect_text(data: &[u8]) -> &'static str {
    let sample = &data[..data.len().min(512)];
    let trimmed = trim_text_prefix(sample);
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    let binary = sample
        .iter()
        .any(|&byte| matches!(byte, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F));
    if !binary && !sample.is_empty() {
        return "text/plain; charset=utf-8";
    }
    "application/octet-stream"
}

fn trim_text_prefix(data: &[u8]) -> &[u8] {
    // UTF-8 BOM, then leading whitespace.
    let data = data.strip_prefix(b"\xef\xbb\xbf").unwrap_or(data);
    let start = data
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}
