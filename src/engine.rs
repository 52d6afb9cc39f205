use crate::params::{
    CropStrategy, MetadataOptions, OutputFormat, ReadOptions, SizeStrategy, TransformOptions,
};
use crate::sniff;
use anyhow::anyhow;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, GenericImageView, ImageFormat, ImageReader};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task;

const JPEG_QUALITY: u8 = 80;
const WEBP_QUALITY: f32 = 75.0;
const PREVIEW_WIDTH: u32 = 16;
const BLURHASH_COMPONENTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid output format: {0}")]
    UnsupportedOutputFormat(String),
    #[error("failed to load image: {0}")]
    Decode(String),
    #[error("page {page} out of range for image with {pages} pages")]
    PageOutOfRange { page: u32, pages: u32 },
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Engine tuning fixed at process start: how many raster jobs may run at
/// once and how much memory a single decode may allocate.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub max_alloc_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_alloc_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Wraps the raster library. Decode, resize, and encode are blocking CPU
/// work, so every job takes a semaphore permit and runs on the blocking
/// pool; admission control at the HTTP layer bounds what piles up here.
pub struct MediaEngine {
    permits: Arc<Semaphore>,
    max_alloc_bytes: u64,
}

#[derive(Debug, Serialize)]
struct MetadataResponse {
    width: u32,
    height: u32,
    #[serde(rename = "noOfPages")]
    no_of_pages: u32,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    blurhash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbhash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    potatowebp: Option<String>,
}

impl MediaEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            max_alloc_bytes: config.max_alloc_bytes,
        }
    }

    /// Runs a transform request: decode, optional thumbnail, re-encode.
    /// `raw` requests skip the raster library entirely and return the
    /// origin bytes with a sniffed content type.
    pub async fn transform(
        &self,
        image_bytes: Vec<u8>,
        opts: &TransformOptions,
    ) -> Result<(Vec<u8>, String), EngineError> {
        if opts.raw {
            let content_type = sniff::media_content_type(&image_bytes).to_string();
            return Ok((image_bytes, content_type));
        }
        let opts = opts.clone();
        let max_alloc = self.max_alloc_bytes;
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| EngineError::Internal(anyhow!(err)))?;
        task::spawn_blocking(move || transform_blocking(&image_bytes, &opts, max_alloc))
            .await
            .map_err(|err| EngineError::Internal(anyhow!(err)))?
    }

    /// Produces the metadata JSON document for an image, including the
    /// optional perceptual hashes.
    pub async fn metadata(
        &self,
        image_bytes: Vec<u8>,
        opts: &MetadataOptions,
    ) -> Result<Vec<u8>, EngineError> {
        let opts = opts.clone();
        let max_alloc = self.max_alloc_bytes;
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| EngineError::Internal(anyhow!(err)))?;
        task::spawn_blocking(move || metadata_blocking(&image_bytes, &opts, max_alloc))
            .await
            .map_err(|err| EngineError::Internal(anyhow!(err)))?
    }
}

fn transform_blocking(
    image_bytes: &[u8],
    opts: &TransformOptions,
    max_alloc: u64,
) -> Result<(Vec<u8>, String), EngineError> {
    let mut image = load_image(image_bytes, &opts.read, max_alloc)?;
    if let Some(resize) = opts.resize {
        if resize.width != 0 || resize.height != 0 {
            let (width, height) =
                resolve_dimensions(image.width(), image.height(), resize.width, resize.height);
            image = thumbnail_with_size(image, width, height, resize.crop, resize.size);
        }
    }
    encode(&image, opts.output_format)
}

fn metadata_blocking(
    image_bytes: &[u8],
    opts: &MetadataOptions,
    max_alloc: u64,
) -> Result<Vec<u8>, EngineError> {
    let image = load_image(image_bytes, &opts.read, max_alloc)?;
    let mut metadata = MetadataResponse {
        width: image.width(),
        height: image.height(),
        no_of_pages: count_pages(image_bytes),
        format: format_name(image_bytes),
        blurhash: None,
        thumbhash: None,
        potatowebp: None,
    };
    if opts.blurhash || opts.thumbhash || opts.potato_webp {
        // Downscaling to a 16-pixel-wide preview bounds the cost of every
        // hash encoder below.
        let preview_height =
            ((image.height() as u64 * PREVIEW_WIDTH as u64) / image.width() as u64).max(1) as u32;
        let preview = image.resize_exact(PREVIEW_WIDTH, preview_height, FilterType::Nearest);
        if opts.blurhash {
            metadata.blurhash = Some(encode_blurhash(&preview)?);
        }
        if opts.thumbhash {
            metadata.thumbhash = Some(encode_thumbhash(&preview)?);
        }
        if opts.potato_webp {
            let (webp_bytes, _) = encode(&preview, OutputFormat::Webp)?;
            metadata.potatowebp = Some(STANDARD.encode(webp_bytes));
        }
    }
    serde_json::to_vec(&metadata).map_err(|err| EngineError::Internal(anyhow!(err)))
}

fn load_image(
    image_bytes: &[u8],
    read: &ReadOptions,
    max_alloc: u64,
) -> Result<DynamicImage, EngineError> {
    // `page` is 1-based on the wire; page 1 is the plain decode path.
    if read.page > 1 {
        return select_page(image_bytes, read.page);
    }
    let mut reader = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|err| EngineError::Decode(err.to_string()))?;
    reader.limits(decode_limits(max_alloc));
    reader
        .decode()
        .map_err(|err| EngineError::Decode(err.to_string()))
}

fn decode_limits(max_alloc: u64) -> image::Limits {
    let mut limits = image::Limits::default();
    limits.max_alloc = Some(max_alloc);
    limits
}

fn select_page(image_bytes: &[u8], page: u32) -> Result<DynamicImage, EngineError> {
    let pages = count_pages(image_bytes);
    if page > pages {
        return Err(EngineError::PageOutOfRange { page, pages });
    }
    let decoder = GifDecoder::new(Cursor::new(image_bytes))
        .map_err(|err| EngineError::Decode(err.to_string()))?;
    let frame = decoder
        .into_frames()
        .nth((page - 1) as usize)
        .ok_or(EngineError::PageOutOfRange { page, pages })?
        .map_err(|err| EngineError::Decode(err.to_string()))?;
    Ok(DynamicImage::ImageRgba8(frame.into_buffer()))
}

/// Page count as the raster library sees it: animation frames for GIF,
/// one page for everything else.
fn count_pages(image_bytes: &[u8]) -> u32 {
    let is_gif = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.format())
        == Some(ImageFormat::Gif);
    if !is_gif {
        return 1;
    }
    GifDecoder::new(Cursor::new(image_bytes))
        .map(|decoder| decoder.into_frames().count() as u32)
        .unwrap_or(1)
        .max(1)
}

fn format_name(image_bytes: &[u8]) -> &'static str {
    let format = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.format());
    match format {
        Some(ImageFormat::Jpeg) => "jpeg",
        Some(ImageFormat::Png) => "png",
        Some(ImageFormat::Gif) => "gif",
        Some(ImageFormat::WebP) => "webp",
        Some(ImageFormat::Avif) => "avif",
        Some(ImageFormat::Bmp) => "bmp",
        Some(ImageFormat::Tiff) => "tiff",
        Some(ImageFormat::Ico) => "ico",
        _ => "unknown",
    }
}

/// Fills in a missing target dimension from the source aspect ratio using
/// integer arithmetic. Callers guarantee at least one dimension is set.
pub fn resolve_dimensions(src_width: u32, src_height: u32, width: u32, height: u32) -> (u32, u32) {
    let mut width = width as u64;
    let mut height = height as u64;
    if width == 0 {
        width = height * src_width as u64 / src_height.max(1) as u64;
    }
    if height == 0 {
        height = width * src_height as u64 / src_width.max(1) as u64;
    }
    (
        width.min(u32::MAX as u64).max(1) as u32,
        height.min(u32::MAX as u64).max(1) as u32,
    )
}

/// Thumbnail primitive: aspect-fit for `crop = none`/`all`, fill-and-crop
/// for the positional and content-driven strategies, with the size
/// strategy gating whether the image may grow or shrink.
fn thumbnail_with_size(
    image: DynamicImage,
    width: u32,
    height: u32,
    crop: CropStrategy,
    size: SizeStrategy,
) -> DynamicImage {
    if matches!(size, SizeStrategy::Force) {
        return image.resize_exact(width, height, FilterType::Lanczos3);
    }
    let (src_width, src_height) = image.dimensions();
    let fill = !matches!(crop, CropStrategy::None | CropStrategy::All);
    let scale_x = width as f64 / src_width as f64;
    let scale_y = height as f64 / src_height as f64;
    let scale = if fill {
        scale_x.max(scale_y)
    } else {
        scale_x.min(scale_y)
    };
    match size {
        SizeStrategy::Up if scale <= 1.0 => return image,
        SizeStrategy::Down if scale >= 1.0 => return image,
        _ => {}
    }
    if !fill {
        return image.resize(width, height, FilterType::Lanczos3);
    }
    let scaled_width = ((src_width as f64 * scale).round() as u32).max(width);
    let scaled_height = ((src_height as f64 * scale).round() as u32).max(height);
    let scaled = image.resize_exact(scaled_width, scaled_height, FilterType::Lanczos3);
    let (x, y) = crop_origin(&scaled, width, height, crop);
    scaled.crop_imm(x, y, width, height)
}

fn crop_origin(image: &DynamicImage, width: u32, height: u32, crop: CropStrategy) -> (u32, u32) {
    let excess_x = image.width().saturating_sub(width);
    let excess_y = image.height().saturating_sub(height);
    match crop {
        CropStrategy::Low => (0, 0),
        CropStrategy::High => (excess_x, excess_y),
        CropStrategy::Entropy | CropStrategy::Attention | CropStrategy::Last => (
            entropy_offset(image, width, image.height(), excess_x, true),
            entropy_offset(image, image.width(), height, excess_y, false),
        ),
        _ => (excess_x / 2, excess_y / 2),
    }
}

/// Scans candidate crop windows along one axis and returns the offset of
/// the window with the highest luma entropy.
fn entropy_offset(
    image: &DynamicImage,
    window_width: u32,
    window_height: u32,
    excess: u32,
    horizontal: bool,
) -> u32 {
    if excess == 0 {
        return 0;
    }
    let candidates = 8u32.min(excess);
    let step = excess / candidates;
    let mut best_offset = 0;
    let mut best_entropy = f64::MIN;
    for candidate in 0..=candidates {
        let offset = (candidate * step).min(excess);
        let window = if horizontal {
            image.crop_imm(offset, 0, window_width, window_height)
        } else {
            image.crop_imm(0, offset, window_width, window_height)
        };
        let entropy = luma_entropy(&window);
        if entropy > best_entropy {
            best_entropy = entropy;
            best_offset = offset;
        }
    }
    best_offset
}

fn luma_entropy(image: &DynamicImage) -> f64 {
    let luma = image.to_luma8();
    let mut histogram = [0u64; 64];
    for pixel in luma.pixels() {
        histogram[(pixel.0[0] >> 2) as usize] += 1;
    }
    let total = luma.pixels().len() as f64;
    if total == 0.0 {
        return 0.0;
    }
    histogram
        .iter()
        .filter(|count| **count > 0)
        .map(|count| {
            let p = *count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

fn encode(
    image: &DynamicImage,
    format: OutputFormat,
) -> Result<(Vec<u8>, String), EngineError> {
    let mut bytes = Vec::new();
    let content_type = match format {
        OutputFormat::Jpeg => {
            let rgb = image.to_rgb8();
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
            encoder
                .encode(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    image::ColorType::Rgb8.into(),
                )
                .map_err(|err| EngineError::Encode(err.to_string()))?;
            "image/jpeg"
        }
        OutputFormat::Png => {
            image
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
                .map_err(|err| EngineError::Encode(err.to_string()))?;
            "image/png"
        }
        OutputFormat::Avif => {
            image
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Avif)
                .map_err(|err| EngineError::Encode(err.to_string()))?;
            "image/avif"
        }
        OutputFormat::Webp => {
            bytes = encode_webp(image, WEBP_QUALITY)?;
            "image/webp"
        }
        OutputFormat::Auto => {
            return Err(EngineError::UnsupportedOutputFormat(String::new()));
        }
        OutputFormat::Apng => {
            return Err(EngineError::UnsupportedOutputFormat("apng".to_string()));
        }
    };
    Ok((bytes, content_type.to_string()))
}

fn encode_webp(image: &DynamicImage, quality: f32) -> Result<Vec<u8>, EngineError> {
    // The lossy encoder only accepts 8-bit RGB/RGBA buffers.
    let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
    let encoder =
        webp::Encoder::from_image(&rgba).map_err(|err| EngineError::Encode(err.to_string()))?;
    Ok(encoder.encode(quality).to_vec())
}

fn encode_blurhash(preview: &DynamicImage) -> Result<String, EngineError> {
    // The contract is a hash of the low-quality preview a client would
    // actually see, so round-trip through a throwaway JPEG first.
    let mut jpeg = Vec::new();
    let rgb = preview.to_rgb8();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 10);
    encoder
        .encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ColorType::Rgb8.into(),
        )
        .map_err(|err| EngineError::Encode(err.to_string()))?;
    let decoded = image::load_from_memory(&jpeg)
        .map_err(|err| EngineError::Decode(err.to_string()))?
        .to_rgba8();
    blurhash::encode(
        BLURHASH_COMPONENTS,
        BLURHASH_COMPONENTS,
        decoded.width(),
        decoded.height(),
        decoded.as_raw(),
    )
    .map_err(|err| EngineError::Encode(err.to_string()))
}

fn encode_thumbhash(preview: &DynamicImage) -> Result<String, EngineError> {
    let mut png = Vec::new();
    preview
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|err| EngineError::Encode(err.to_string()))?;
    let decoded = image::load_from_memory(&png)
        .map_err(|err| EngineError::Decode(err.to_string()))?
        .to_rgba8();
    let hash = thumbhash::rgba_to_thumb_hash(
        decoded.width() as usize,
        decoded.height() as usize,
        decoded.as_raw(),
    );
    Ok(STANDARD.encode(hash))
}
