// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Image format detection and the image codec contract
//!
//! The optimizer doesn’t ship image codecs. It determines image type and dimensions from the
//! file headers and hands the actual transformation to an [`ImageOptimizer`] implementation.

use crate::content_type::ContentType;
use crate::error::RewriteError;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Image dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

/// Properties of an image determined from its headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image format
    pub content_type: ContentType,
    /// Image size
    pub dimensions: Dimensions,
    /// GIF with more than one frame
    pub animated: bool,
}

fn be16(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u32::from(u16::from_be_bytes([bytes[0], bytes[1]])))
}

fn le16(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u32::from(u16::from_le_bytes([bytes[0], bytes[1]])))
}

fn be32(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn le24(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 3)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
}

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

fn sniff_png(data: &[u8]) -> Option<ImageInfo> {
    if !data.starts_with(PNG_SIGNATURE) || data.get(12..16)? != b"IHDR" {
        return None;
    }
    Some(ImageInfo {
        content_type: ContentType::Png,
        dimensions: Dimensions {
            width: be32(data, 16)?,
            height: be32(data, 20)?,
        },
        animated: false,
    })
}

/// Skips GIF data sub-blocks starting at `pos`, returns the position after the terminator.
fn skip_gif_sub_blocks(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = usize::from(*data.get(pos)?);
        pos += 1;
        if len == 0 {
            return Some(pos);
        }
        pos += len;
    }
}

/// Counts image frames, stopping at the second one.
fn count_gif_frames(data: &[u8]) -> usize {
    let Some(&flags) = data.get(10) else {
        return 0;
    };
    let mut pos = 13;
    if flags & 0x80 != 0 {
        pos += 3 << ((flags & 0x07) + 1);
    }

    let mut frames = 0;
    while let Some(&block) = data.get(pos) {
        match block {
            // Extension
            0x21 => match skip_gif_sub_blocks(data, pos + 2) {
                Some(next) => pos = next,
                None => break,
            },
            // Image descriptor
            0x2C => {
                frames += 1;
                if frames > 1 {
                    break;
                }
                let Some(&local_flags) = data.get(pos + 9) else {
                    break;
                };
                pos += 10;
                if local_flags & 0x80 != 0 {
                    pos += 3 << ((local_flags & 0x07) + 1);
                }
                // LZW minimum code size, then the image data
                match skip_gif_sub_blocks(data, pos + 1) {
                    Some(next) => pos = next,
                    None => break,
                }
            }
            _ => break,
        }
    }
    frames
}

fn sniff_gif(data: &[u8]) -> Option<ImageInfo> {
    if !data.starts_with(b"GIF87a") && !data.starts_with(b"GIF89a") {
        return None;
    }
    Some(ImageInfo {
        content_type: ContentType::Gif,
        dimensions: Dimensions {
            width: le16(data, 6)?,
            height: le16(data, 8)?,
        },
        animated: count_gif_frames(data) > 1,
    })
}

fn sniff_jpeg(data: &[u8]) -> Option<ImageInfo> {
    if !data.starts_with(&[0xFF, 0xD8]) {
        return None;
    }
    let mut pos = 2;
    loop {
        if *data.get(pos)? != 0xFF {
            return None;
        }
        let marker = *data.get(pos + 1)?;
        match marker {
            // Fill bytes
            0xFF => pos += 1,
            // Markers without payload
            0x01 | 0xD0..=0xD9 => pos += 2,
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                return Some(ImageInfo {
                    content_type: ContentType::Jpeg,
                    dimensions: Dimensions {
                        width: be16(data, pos + 7)?,
                        height: be16(data, pos + 5)?,
                    },
                    animated: false,
                });
            }
            _ => pos += 2 + usize::try_from(be16(data, pos + 2)?).ok()?,
        }
    }
}

fn sniff_webp(data: &[u8]) -> Option<ImageInfo> {
    if data.get(0..4)? != b"RIFF" || data.get(8..12)? != b"WEBP" {
        return None;
    }
    let dimensions = match data.get(12..16)? {
        b"VP8 " => Dimensions {
            width: le16(data, 26)? & 0x3FFF,
            height: le16(data, 28)? & 0x3FFF,
        },
        b"VP8L" => {
            let bits = u32::from_le_bytes(data.get(21..25)?.try_into().ok()?);
            Dimensions {
                width: (bits & 0x3FFF) + 1,
                height: ((bits >> 14) & 0x3FFF) + 1,
            }
        }
        b"VP8X" => Dimensions {
            width: le24(data, 24)? + 1,
            height: le24(data, 27)? + 1,
        },
        _ => return None,
    };
    Some(ImageInfo {
        content_type: ContentType::Webp,
        dimensions,
        animated: false,
    })
}

/// Determines image type and dimensions from the image headers.
pub fn sniff(data: &[u8]) -> Option<ImageInfo> {
    sniff_png(data)
        .or_else(|| sniff_gif(data))
        .or_else(|| sniff_jpeg(data))
        .or_else(|| sniff_webp(data))
}

/// Parameters of an image transformation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    /// Properties of the input image
    pub input: ImageInfo,
    /// Dimensions to resize to, if resizing was requested and makes the image smaller
    pub resize_to: Option<Dimensions>,
    /// Recompress the image in its current format
    pub recompress: bool,
    /// Convert the image to WebP
    pub convert_to_webp: bool,
    /// Quality for JPEG output
    pub jpeg_quality: u8,
    /// Quality for WebP output
    pub webp_quality: u8,
}

/// Result of an image transformation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedImage {
    /// Encoded image
    pub data: Bytes,
    /// Output format
    pub content_type: ContentType,
    /// Output size
    pub dimensions: Dimensions,
}

/// Image codec used for recompression, resizing and format conversion
#[async_trait]
pub trait ImageOptimizer: Debug + Send + Sync {
    /// Transforms an image. Implementations doing expensive work should move it off the async
    /// runtime, e.g. with `tokio::task::spawn_blocking`.
    async fn optimize(
        &self,
        request: &ImageRequest,
        data: Bytes,
    ) -> Result<OptimizedImage, RewriteError>;
}

/// Image optimizer without codecs: returns images unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughImageOptimizer;

#[async_trait]
impl ImageOptimizer for PassThroughImageOptimizer {
    async fn optimize(
        &self,
        request: &ImageRequest,
        data: Bytes,
    ) -> Result<OptimizedImage, RewriteError> {
        Ok(OptimizedImage {
            data,
            content_type: request.input.content_type,
            dimensions: request.input.dimensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gif_image, jpeg_image, png_image};

    #[test]
    fn png() {
        let info = sniff(&png_image(48, 64, 100)).unwrap();
        assert_eq!(info.content_type, ContentType::Png);
        assert_eq!(
            info.dimensions,
            Dimensions {
                width: 48,
                height: 64
            }
        );
        assert!(!info.animated);
    }

    #[test]
    fn gif() {
        let info = sniff(&gif_image(10, 20, 1, 0)).unwrap();
        assert_eq!(info.content_type, ContentType::Gif);
        assert_eq!(info.dimensions.width, 10);
        assert_eq!(info.dimensions.height, 20);
        assert!(!info.animated);

        let animated = gif_image(48, 64, 3, 200);
        assert_eq!(animated.len(), 200);
        assert!(sniff(&animated).unwrap().animated);
    }

    #[test]
    fn jpeg() {
        let info = sniff(&jpeg_image(640, 480, 1000)).unwrap();
        assert_eq!(info.content_type, ContentType::Jpeg);
        assert_eq!(info.dimensions.width, 640);
        assert_eq!(info.dimensions.height, 480);
    }

    #[test]
    fn webp() {
        let mut data = b"RIFF\0\0\0\0WEBPVP8X".to_vec();
        data.extend_from_slice(&[0; 8]);
        data.extend_from_slice(&[99, 0, 0, 49, 0, 0]);
        let info = sniff(&data).unwrap();
        assert_eq!(info.content_type, ContentType::Webp);
        assert_eq!(
            info.dimensions,
            Dimensions {
                width: 100,
                height: 50
            }
        );
    }

    #[test]
    fn garbage() {
        assert_eq!(sniff(b""), None);
        assert_eq!(sniff(b"GIF89"), None);
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n"), None);
        assert_eq!(sniff(b"<html>"), None);
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]), None);
    }
}
