use anyhow::{Result, bail};

/// Serializes a `(content-type, payload)` pair into a single blob for the
/// result cache: 4-byte little-endian content-type length, content-type
/// bytes, payload bytes.
pub fn frame(content_type: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + content_type.len() + data.len());
    out.extend_from_slice(&(content_type.len() as u32).to_le_bytes());
    out.extend_from_slice(content_type.as_bytes());
    out.extend_from_slice(data);
    out
}

pub fn unframe(entry: &[u8]) -> Result<(String, Vec<u8>)> {
    if entry.len() < 4 {
        bail!("framed entry too short: {} bytes", entry.len());
    }
    let header: [u8; 4] = entry[..4].try_into().expect("slice is 4 bytes");
    let len = u32::from_le_bytes(header) as usize;
    let Some(payload_start) = len.checked_add(4).filter(|end| *end <= entry.len()) else {
        bail!(
            "framed entry content-type length {} exceeds entry of {} bytes",
            len,
            entry.len()
        );
    };
    let content_type = std::str::from_utf8(&entry[4..payload_start])
        .map_err(|_| anyhow::anyhow!("framed entry content-type is not valid UTF-8"))?
        .to_string();
    Ok((content_type, entry[payload_start..].to_vec()))
}
