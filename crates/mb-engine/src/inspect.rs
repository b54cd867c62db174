//! Byte-level image inspection: format sniffing, content hashing, frame
//! counting, and frame sampling for animated inputs.
//!
//! Format and frame-count detection walk the file headers directly; full
//! decoding (the `image` crate) is only reached for sampling frames out of
//! animated files.

use image::AnimationDecoder;
use sha2::{Digest, Sha256};

use mb_core::ImageFormat;

/// Frames handed to the vision client.
#[derive(Debug, Clone)]
pub struct VisionFrame {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Upper bound on frames sampled out of an animated input.
pub const MAX_SAMPLED_FRAMES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMeta {
    pub format: ImageFormat,
    pub frame_count: u32,
}

/// Sniff the format from the leading magic bytes.
pub fn detect_format(data: &[u8]) -> Option<ImageFormat> {
    if data.starts_with(b"\x89PNG") {
        Some(ImageFormat::Png)
    } else if data.len() >= 2 && data[0] == 0xFF && data[1] == 0xD8 {
        Some(ImageFormat::Jpeg)
    } else if data.starts_with(b"GIF8") {
        Some(ImageFormat::Gif)
    } else if data.starts_with(b"RIFF") && data.len() > 12 && &data[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else {
        None
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Format plus frame count, both from header inspection alone.
pub fn metadata(data: &[u8]) -> Option<ImageMeta> {
    let format = detect_format(data)?;
    let frame_count = match format {
        ImageFormat::Gif => gif_frame_count(data),
        ImageFormat::Webp => webp_frame_count(data),
        _ => 1,
    };
    Some(ImageMeta { format, frame_count })
}

/// Count GIF frames by walking the block structure: extensions (0x21) are
/// skipped, image descriptors (0x2C) counted, trailer (0x3B) ends the walk.
fn gif_frame_count(data: &[u8]) -> u32 {
    if data.len() < 13 || !data.starts_with(b"GIF8") {
        return 1;
    }
    // Header (6) + logical screen descriptor (7), then the global color
    // table when its flag is set.
    let mut i = 13;
    let packed = data[10];
    if packed & 0x80 != 0 {
        i += 3 * (2usize << (packed & 0x07));
    }

    let mut frames = 0u32;
    while i < data.len() {
        match data[i] {
            0x21 => {
                // Extension: introducer + label, then data sub-blocks.
                i = skip_sub_blocks(data, i + 2);
            }
            0x2C => {
                frames += 1;
                if i + 10 > data.len() {
                    break;
                }
                let packed = data[i + 9];
                i += 10;
                if packed & 0x80 != 0 {
                    i += 3 * (2usize << (packed & 0x07));
                }
                // LZW minimum code size, then the compressed sub-blocks.
                i = skip_sub_blocks(data, i + 1);
            }
            0x3B => break,
            _ => break, // malformed stream; report what was seen so far
        }
    }
    frames.max(1)
}

fn skip_sub_blocks(data: &[u8], mut i: usize) -> usize {
    while i < data.len() {
        let len = data[i] as usize;
        i += 1;
        if len == 0 {
            break;
        }
        i += len;
    }
    i
}

/// Count WebP frames: one ANMF chunk per frame in animated files.
fn webp_frame_count(data: &[u8]) -> u32 {
    if data.len() < 12 || !data.starts_with(b"RIFF") || &data[8..12] != b"WEBP" {
        return 1;
    }
    let mut i = 12;
    let mut frames = 0u32;
    while i + 8 <= data.len() {
        let size = u32::from_le_bytes([data[i + 4], data[i + 5], data[i + 6], data[i + 7]]) as usize;
        if &data[i..i + 4] == b"ANMF" {
            frames += 1;
        }
        // Chunks are padded to even length.
        i += 8 + size + (size & 1);
    }
    frames.max(1)
}

/// Pick `max_frames` roughly-evenly-spaced frames out of an animated input,
/// re-encoded as PNG. Decode failures yield an empty list so the caller can
/// fall back to the original bytes. Static formats pass through unchanged.
pub fn sample_frames(data: &[u8], max_frames: usize, format: ImageFormat) -> Vec<Vec<u8>> {
    match format {
        ImageFormat::Gif | ImageFormat::Webp => {
            let frames = match decode_frames(data, format) {
                Ok(frames) if !frames.is_empty() => frames,
                _ => return Vec::new(),
            };
            evenly_spaced_indices(frames.len(), max_frames)
                .into_iter()
                .filter_map(|idx| encode_png(&frames[idx]).ok())
                .collect()
        }
        _ => vec![data.to_vec()],
    }
}

/// Frames for a vision call: animated inputs get sampled, everything else
/// (including sampling failures) passes the original bytes through.
pub fn prepare_frames(data: &[u8], format: ImageFormat) -> Vec<VisionFrame> {
    if let Some(meta) = metadata(data) {
        if meta.frame_count > 1 {
            let sampled = sample_frames(data, MAX_SAMPLED_FRAMES, format);
            if !sampled.is_empty() {
                return sampled
                    .into_iter()
                    .map(|bytes| VisionFrame {
                        bytes,
                        mime: "image/png".into(),
                    })
                    .collect();
            }
        }
    }
    vec![VisionFrame {
        bytes: data.to_vec(),
        mime: format.mime().into(),
    }]
}

fn decode_frames(
    data: &[u8],
    format: ImageFormat,
) -> Result<Vec<image::Frame>, image::ImageError> {
    let cursor = std::io::Cursor::new(data);
    match format {
        ImageFormat::Gif => image::codecs::gif::GifDecoder::new(cursor)?
            .into_frames()
            .collect_frames(),
        ImageFormat::Webp => image::codecs::webp::WebPDecoder::new(cursor)?
            .into_frames()
            .collect_frames(),
        _ => Ok(Vec::new()),
    }
}

fn encode_png(frame: &image::Frame) -> Result<Vec<u8>, image::ImageError> {
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(frame.buffer().clone())
        .write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

fn evenly_spaced_indices(total: usize, wanted: usize) -> Vec<usize> {
    if total == 0 || wanted == 0 {
        return Vec::new();
    }
    if total <= wanted {
        return (0..total).collect();
    }
    let mut indices = Vec::with_capacity(wanted);
    for i in 0..wanted {
        let idx = (i as f64 + 0.5) * total as f64 / wanted as f64;
        let idx = (idx as usize).min(total - 1);
        if indices.last() != Some(&idx) {
            indices.push(idx);
        }
    }
    indices
}
