//! Thumbnail decoding.
//!
//! Uses zune-jpeg for fast SIMD-accelerated decoding. Embedded EXIF
//! thumbnails are extracted straight from the APP1 segment when the
//! request's [`EmbeddedPolicy`] allows it, and results are box-filtered
//! down to the requested size with rows split across the rayon pool.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use rayon::prelude::*;
use zune_jpeg::JpegDecoder;

use crate::error::{CacheError, CacheResult};
use crate::key::{EmbeddedPolicy, ThumbSize, VirtualKey};

/// Bits per pixel of a decoded payload (RGB8).
pub const BITS_PER_PIXEL: u64 = 24;

/// Decoded image owned by a cache entry.
#[derive(Debug, Clone)]
pub struct Payload {
    /// Raw RGB pixel data.
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl Payload {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: Bytes::from(data),
            width,
            height,
        }
    }

    /// Approximate memory held by the decoded pixels.
    pub fn approx_bytes(&self) -> u64 {
        self.width as u64 * self.height as u64 * BITS_PER_PIXEL / 8
    }

    /// Check that the buffer holds exactly `width * height` RGB pixels.
    pub fn validate(&self) -> CacheResult<()> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.data.len() != expected {
            return Err(CacheError::Decode(format!(
                "{}x{} payload carries {} bytes, expected {}",
                self.width,
                self.height,
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }

    /// Copy the pixels into a fresh buffer so the caller holds no alias of
    /// a payload a worker may be replacing.
    pub fn deep_clone(&self) -> Self {
        Self {
            data: Bytes::copy_from_slice(&self.data),
            width: self.width,
            height: self.height,
        }
    }
}

/// Produces payloads for cache requests. Implementations may fail; failures
/// are recorded per request and never stop the worker.
pub trait Decoder: Send + Sync {
    /// Decode the image file at `path`, fitted into `size`.
    fn decode(&self, path: &Path, size: ThumbSize, policy: EmbeddedPolicy) -> CacheResult<Payload>;

    /// Resolve a virtual item, fitted into `size`.
    fn decode_virtual(&self, key: &VirtualKey, size: ThumbSize) -> CacheResult<Payload>;
}

/// Caller-supplied resolver for virtual items.
pub type VirtualSource = Arc<dyn Fn(&VirtualKey, ThumbSize) -> CacheResult<Payload> + Send + Sync>;

/// Decoder for JPEG files on disk.
#[derive(Default, Clone)]
pub struct FsDecoder {
    virtual_source: Option<VirtualSource>,
}

impl FsDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route virtual keys through `source`.
    pub fn with_virtual_source(mut self, source: VirtualSource) -> Self {
        self.virtual_source = Some(source);
        self
    }
}

impl Decoder for FsDecoder {
    fn decode(&self, path: &Path, size: ThumbSize, policy: EmbeddedPolicy) -> CacheResult<Payload> {
        let jpeg = read_file(path)?;

        if policy != EmbeddedPolicy::Never {
            if let Some(embedded) = extract_embedded_jpeg(&jpeg) {
                // What the full image would be scaled to
                let target = match read_jpeg_dimensions(&jpeg) {
                    Ok((w, h)) => fit_within(w, h, size),
                    Err(_) => (size.width, size.height),
                };
                match decode_jpeg_bytes(embedded) {
                    Ok(thumb) if policy == EmbeddedPolicy::Always || covers(&thumb, target) => {
                        return downscale(&thumb, size);
                    }
                    Ok(_) => {}
                    // A broken embedded thumbnail falls back to the full image
                    Err(e) => tracing::debug!("embedded thumbnail in {}: {e}", path.display()),
                }
            }
        }

        let full = decode_jpeg_bytes(&jpeg)?;
        downscale(&full, size)
    }

    fn decode_virtual(&self, key: &VirtualKey, size: ThumbSize) -> CacheResult<Payload> {
        let source = self.virtual_source.as_ref().ok_or_else(|| {
            CacheError::Unsupported(format!("no virtual source for {}/{}", key.owner, key.id))
        })?;
        let payload = source(key, size)?;
        downscale(&payload, size)
    }
}

fn read_file(path: &Path) -> CacheResult<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}

/// Parse a JPEG header for its dimensions without decoding pixels.
pub fn read_jpeg_dimensions(jpeg: &[u8]) -> CacheResult<(u32, u32)> {
    let mut decoder = JpegDecoder::new(jpeg);
    decoder
        .decode_headers()
        .map_err(|e| CacheError::Decode(format!("Failed to parse JPEG header: {:?}", e)))?;

    let info = decoder
        .info()
        .ok_or_else(|| CacheError::Decode("Failed to get image info from header".into()))?;

    Ok((info.width as u32, info.height as u32))
}

/// Decode JPEG bytes to RGB pixel data.
///
/// Grayscale output is expanded to RGB and alpha is dropped.
pub fn decode_jpeg_bytes(jpeg: &[u8]) -> CacheResult<Payload> {
    let mut decoder = JpegDecoder::new(jpeg);

    let pixels = decoder
        .decode()
        .map_err(|e| CacheError::Decode(format!("Failed to decode JPEG: {:?}", e)))?;

    let info = decoder
        .info()
        .ok_or_else(|| CacheError::Decode("Failed to get image info".into()))?;

    let width = info.width as u32;
    let height = info.height as u32;
    let area = width as usize * height as usize;

    let rgb = match pixels.len() / area.max(1) {
        1 => pixels.iter().flat_map(|&gray| [gray, gray, gray]).collect(),
        3 => pixels,
        4 => pixels.chunks_exact(4).flat_map(|p| [p[0], p[1], p[2]]).collect(),
        n => {
            return Err(CacheError::Decode(format!(
                "Unexpected {n} bytes per pixel in decoded JPEG"
            )))
        }
    };

    Ok(Payload::new(rgb, width, height))
}

/// Locate the thumbnail JPEG embedded in an EXIF APP1 segment.
///
/// Walks the marker segments before the scan data; returns the slice from
/// the embedded SOI up to and including its EOI.
pub fn extract_embedded_jpeg(jpeg: &[u8]) -> Option<&[u8]> {
    if jpeg.len() < 4 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
        return None;
    }

    let mut pos = 2;
    while pos + 4 <= jpeg.len() {
        if jpeg[pos] != 0xFF {
            return None;
        }
        let marker = jpeg[pos + 1];
        // Start of scan: no more metadata segments
        if marker == 0xDA {
            return None;
        }
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        if len < 2 {
            return None;
        }
        let start = pos + 4;
        let end = (pos + 2 + len).min(jpeg.len());

        if marker == 0xE1 && jpeg[start..end].starts_with(b"Exif\0\0") {
            let segment = &jpeg[start + 6..end];
            let soi = segment.windows(2).position(|w| w == [0xFF, 0xD8])?;
            let eoi = segment.windows(2).rposition(|w| w == [0xFF, 0xD9])?;
            if eoi > soi {
                return Some(&segment[soi..eoi + 2]);
            }
            return None;
        }

        pos += 2 + len;
    }
    None
}

/// Whether `payload` is at least as large as `target` in both dimensions.
fn covers(payload: &Payload, target: (u32, u32)) -> bool {
    payload.width >= target.0 && payload.height >= target.1
}

/// Dimensions of `(width, height)` scaled to fit inside `size`, keeping the
/// aspect ratio. Never scales up.
pub fn fit_within(width: u32, height: u32, size: ThumbSize) -> (u32, u32) {
    if width == 0 || height == 0 || size.width == 0 || size.height == 0 {
        return (width, height);
    }
    let scale = (size.width as f64 / width as f64)
        .min(size.height as f64 / height as f64)
        .min(1.0);
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Box-filter `src` down to fit inside `size`.
///
/// Fails if the pixel buffer does not match the payload's dimensions.
pub fn downscale(src: &Payload, size: ThumbSize) -> CacheResult<Payload> {
    src.validate()?;
    let (w, h) = fit_within(src.width, src.height, size);
    if w == src.width && h == src.height {
        return Ok(src.clone());
    }

    let (sw, sh) = (src.width as usize, src.height as usize);
    let (w, h) = (w as usize, h as usize);
    let pixels: &[u8] = &src.data;
    let mut out = vec![0u8; w * h * 3];

    out.par_chunks_mut(w * 3).enumerate().for_each(|(y, row)| {
        let y0 = y * sh / h;
        let y1 = ((y + 1) * sh / h).max(y0 + 1);
        for x in 0..w {
            let x0 = x * sw / w;
            let x1 = ((x + 1) * sw / w).max(x0 + 1);
            let mut sum = [0u32; 3];
            for sy in y0..y1 {
                let line = &pixels[sy * sw * 3..];
                for sx in x0..x1 {
                    let p = &line[sx * 3..sx * 3 + 3];
                    sum[0] += p[0] as u32;
                    sum[1] += p[1] as u32;
                    sum[2] += p[2] as u32;
                }
            }
            let count = ((y1 - y0) * (x1 - x0)) as u32;
            row[x * 3] = (sum[0] / count) as u8;
            row[x * 3 + 1] = (sum[1] / count) as u8;
            row[x * 3 + 2] = (sum[2] / count) as u8;
        }
    });

    Ok(Payload::new(out, w as u32, h as u32))
}
