use thiserror::Error;

/// A query parameter the decoder understood but could not parse. Decode
/// failures always map to a 400.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for parameter {key:?}")]
pub struct DecodeError {
    pub key: String,
    pub value: String,
}

impl DecodeError {
    fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Shared input-side options: `read.dpi` and `read.page` (1-based; the
/// engine selects page `page - 1`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub dpi: u32,
    pub page: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CropStrategy {
    #[default]
    None,
    Centre,
    Entropy,
    Attention,
    Low,
    High,
    All,
    Last,
}

impl CropStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "none" | "" => Some(Self::None),
            "centre" => Some(Self::Centre),
            "entropy" => Some(Self::Entropy),
            "attention" => Some(Self::Attention),
            "low" => Some(Self::Low),
            "high" => Some(Self::High),
            "all" => Some(Self::All),
            "last" => Some(Self::Last),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SizeStrategy {
    #[default]
    Both,
    Up,
    Down,
    Force,
    Last,
}

impl SizeStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "both" | "" => Some(Self::Both),
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "force" => Some(Self::Force),
            "last" => Some(Self::Last),
            _ => None,
        }
    }
}

/// Resize parameters. A zero width or height is derived from the source
/// aspect ratio; both zero means no resize is performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizeOptions {
    pub width: u32,
    pub height: u32,
    pub crop: CropStrategy,
    pub size: SizeStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// No format requested; resolved from the Accept header and the
    /// sniffed origin content type before the engine runs.
    #[default]
    Auto,
    Jpeg,
    Png,
    Avif,
    Webp,
    Apng,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "" => Some(Self::Auto),
            "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "avif" => Some(Self::Avif),
            "webp" => Some(Self::Webp),
            "apng" => Some(Self::Apng),
            _ => None,
        }
    }

    /// Maps a negotiated content type onto an output format; anything the
    /// proxy cannot encode deliberately lands on PNG.
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type {
            "image/webp" => Self::Webp,
            "image/jpeg" => Self::Jpeg,
            "image/png" => Self::Png,
            "image/avif" => Self::Avif,
            "image/apng" => Self::Apng,
            _ => Self::Png,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOptions {
    pub raw: bool,
    pub read: ReadOptions,
    pub resize: Option<ResizeOptions>,
    pub output_format: OutputFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataOptions {
    pub read: ReadOptions,
    pub thumbhash: bool,
    pub blurhash: bool,
    pub potato_webp: bool,
}

/// Decodes query pairs into [`TransformOptions`]. Dotted keys address
/// nested fields; any `resize.*` key materializes the resize block;
/// unknown keys are ignored.
pub fn decode_transform(pairs: &[(String, String)]) -> Result<TransformOptions, DecodeError> {
    let mut opts = TransformOptions::default();
    for (key, value) in pairs {
        match key.as_str() {
            "raw" => opts.raw = parse_bool(key, value)?,
            "read.dpi" => opts.read.dpi = parse_u32(key, value)?,
            "read.page" => opts.read.page = parse_u32(key, value)?,
            "resize.width" => resize_mut(&mut opts.resize).width = parse_u32(key, value)?,
            "resize.height" => resize_mut(&mut opts.resize).height = parse_u32(key, value)?,
            "resize.crop" => {
                resize_mut(&mut opts.resize).crop =
                    CropStrategy::parse(value).ok_or_else(|| DecodeError::new(key, value))?;
            }
            "resize.size" => {
                resize_mut(&mut opts.resize).size =
                    SizeStrategy::parse(value).ok_or_else(|| DecodeError::new(key, value))?;
            }
            "outputFormat" => {
                opts.output_format =
                    OutputFormat::parse(value).ok_or_else(|| DecodeError::new(key, value))?;
            }
            _ => {}
        }
    }
    Ok(opts)
}

pub fn decode_metadata(pairs: &[(String, String)]) -> Result<MetadataOptions, DecodeError> {
    let mut opts = MetadataOptions::default();
    for (key, value) in pairs {
        match key.as_str() {
            "read.dpi" => opts.read.dpi = parse_u32(key, value)?,
            "read.page" => opts.read.page = parse_u32(key, value)?,
            "thumbhash" => opts.thumbhash = parse_bool(key, value)?,
            "blurhash" => opts.blurhash = parse_bool(key, value)?,
            "potatowebp" => opts.potato_webp = parse_bool(key, value)?,
            _ => {}
        }
    }
    Ok(opts)
}

/// Splits a raw query string into decoded key/value pairs.
pub fn parse_query(raw_query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw_query.as_bytes())
        .into_owned()
        .collect()
}

/// Re-encodes query pairs with keys sorted, for cache identity. Two
/// requests that differ only in parameter order share a cache entry; the
/// signature, by contrast, covers the raw query bytes as sent.
pub fn encode_query(pairs: &[(String, String)]) -> String {
    let mut sorted = pairs.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &sorted {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

fn resize_mut(resize: &mut Option<ResizeOptions>) -> &mut ResizeOptions {
    resize.get_or_insert_with(ResizeOptions::default)
}

fn parse_u32(key: &str, value: &str) -> Result<u32, DecodeError> {
    value.parse().map_err(|_| DecodeError::new(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, DecodeError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => Err(DecodeError::new(key, value)),
    }
}
