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

use super::{ResourceRewriter, RewriteJob, RewriteOutput};
use crate::content_type::ContentType;
use crate::error::RewriteError;
use crate::image::{sniff, Dimensions, ImageRequest};
use crate::registry::Filter;
use crate::statistics::Stat;
use crate::url_namer::{escape_leaf, leaf_of, ImageDims};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::debug;
use url::Url;

/// Recompresses, resizes and converts images, produces data URLs for small images
pub(crate) struct ImageRewriter;

/// Produces a `data:` URL for the given contents.
pub(crate) fn data_url(content_type: ContentType, data: &[u8]) -> String {
    format!("data:{};base64,{}", content_type.mime_type(), STANDARD.encode(data))
}

/// Computes the size to scale an image to, `None` if it shouldn’t be scaled.
fn target_dimensions(actual: Dimensions, requested: ImageDims) -> Option<Dimensions> {
    if actual.width == 0 || actual.height == 0 {
        return None;
    }
    let scale = |value: u32, numerator: u32, denominator: u32| {
        (u64::from(value) * u64::from(numerator) / u64::from(denominator)) as u32
    };
    let (width, height) = match (requested.width, requested.height) {
        (Some(width), Some(height)) => (width, height),
        (Some(width), None) => (width, scale(actual.height, width, actual.width)),
        (None, Some(height)) => (scale(actual.width, height, actual.height), height),
        (None, None) => return None,
    };
    if width == 0 || height == 0 {
        return None;
    }
    if u64::from(width) * u64::from(height) >= u64::from(actual.width) * u64::from(actual.height)
    {
        return None;
    }
    Some(Dimensions { width, height })
}

/// Leaf name of a rewritten image. The input extension is dropped if the output keeps it, and
/// the dimensions go in front. Names that would be mistaken for dimensions get an `x` prefix.
pub(crate) fn image_name(input: &Url, dims: ImageDims, output_ext: &str) -> String {
    let leaf = leaf_of(input);
    let stem = match leaf.split_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext == output_ext && !leaf.contains('?') => {
            stem.to_owned()
        }
        _ => leaf,
    };
    let escaped = escape_leaf(&stem);
    let ambiguous =
        ImageDims::decode_prefix(&escaped) != Some((ImageDims::default(), escaped.as_str()));
    if dims.is_set() || ambiguous {
        format!("{}{escaped}", dims.encode_prefix())
    } else {
        escaped
    }
}

#[async_trait]
impl ResourceRewriter for ImageRewriter {
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError> {
        let options = job.options.clone();
        let params = job.request.params;
        let input = job.inputs.first().ok_or(RewriteError::ParseFailed)?;
        let data = input.contents().clone();
        let info = sniff(&data).ok_or(RewriteError::ParseFailed)?;

        let recompress = options.is_enabled(Filter::RecompressImages);
        let convert_to_webp = params.webp
            && options.is_enabled(Filter::ConvertToWebp)
            && info.content_type != ContentType::Webp;
        let resize_to = if options.is_enabled(Filter::ResizeImages) {
            target_dimensions(info.dimensions, params.dims)
        } else {
            None
        };

        let mut output = RewriteOutput {
            contents: data.clone(),
            content_type: Some(info.content_type),
            dims: Some(info.dimensions),
            ..Default::default()
        };
        if params.webp {
            output.vary.push("Accept".to_owned());
        }
        if params.save_data {
            output.vary.push("Save-Data".to_owned());
        }

        if info.animated {
            debug!("Not optimizing animated image {}", input.url());
        } else if recompress || convert_to_webp || resize_to.is_some() {
            let Ok(_permit) = job.server.image_permits().clone().try_acquire_owned() else {
                debug!("Too many concurrent image rewrites, dropping {}", input.url());
                job.server
                    .statistics()
                    .increment(Stat::RewritesDroppedOverload);
                return Err(RewriteError::Overload);
            };
            let request = ImageRequest {
                input: info,
                resize_to,
                recompress,
                convert_to_webp,
                jpeg_quality: options.jpeg_quality(params.save_data),
                webp_quality: options.image_webp_quality,
            };
            let optimized = job
                .server
                .image_optimizer()
                .optimize(&request, data.clone())
                .await?;
            if optimized.data.len() < data.len() {
                output.contents = optimized.data;
                output.content_type = Some(optimized.content_type);
                output.optimizable = true;
                output.publish = true;
            }
        }

        let content_type = output.content_type.unwrap_or(info.content_type);
        let size = output.contents.len() as i64;
        if params.inline && size < options.image_inline_max_bytes {
            output.inlined_data = Some(data_url(content_type, &output.contents));
        } else if options.cache_small_images_unrewritten && size < options.image_inline_max_bytes
        {
            debug!("Keeping URL of small image {}", input.url());
            output.optimizable = false;
        }

        output.name = Some(image_name(
            input.url(),
            params.dims,
            content_type.extension(),
        ));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn names() {
        let dims = ImageDims {
            width: Some(48),
            height: Some(64),
        };
        assert_eq!(
            image_name(&url("http://example.com/small.gif"), dims, "gif"),
            "48x64xsmall"
        );
        assert_eq!(
            image_name(&url("http://example.com/bg.png"), ImageDims::default(), "png"),
            "bg"
        );
        assert_eq!(
            image_name(&url("http://example.com/bg.png"), ImageDims::default(), "webp"),
            "bg.png"
        );
        assert_eq!(
            image_name(&url("http://example.com/a.b.png"), ImageDims::default(), "png"),
            "a.b.png"
        );
        assert_eq!(
            image_name(&url("http://example.com/x1.png"), ImageDims::default(), "png"),
            "xx1"
        );
    }

    #[test]
    fn scaling() {
        let actual = Dimensions {
            width: 200,
            height: 100,
        };
        let dims = |width, height| ImageDims { width, height };
        assert_eq!(
            target_dimensions(actual, dims(Some(100), None)),
            Some(Dimensions {
                width: 100,
                height: 50
            })
        );
        assert_eq!(
            target_dimensions(actual, dims(None, Some(20))),
            Some(Dimensions {
                width: 40,
                height: 20
            })
        );
        assert_eq!(target_dimensions(actual, dims(Some(400), Some(200))), None);
        assert_eq!(target_dimensions(actual, dims(None, None)), None);
        assert_eq!(target_dimensions(actual, dims(Some(1), Some(0))), None);
    }

    #[test]
    fn data_urls() {
        assert_eq!(data_url(ContentType::Gif, b"GIF89a"), "data:image/gif;base64,R0lGODlh");
    }
}
