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

use super::{ResourceRewriter, RewriteJob, RewriteOutput, RewriteRequest, RewriterId};
use crate::content_type::ContentType;
use crate::css::{self, ReferenceKind, Stylesheet};
use crate::error::RewriteError;
use crate::registry::Filter;
use crate::server_context::ServerContext;
use crate::url_namer::{escape_leaf, leaf_of, trim_url, PAGESPEED_MARKER};

use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;
use url::Url;

/// Minifies stylesheets and rewrites the images they reference
pub(crate) struct CssRewriter;

/// Determines the nested rewrites for the images referenced by a stylesheet.
fn nested_requests(
    server: &ServerContext,
    job: &RewriteJob,
    css_url: &Url,
    sheet: &Stylesheet,
) -> Vec<(Range<usize>, RewriteRequest)> {
    let options = &job.options;
    let id = if options.is_enabled(Filter::RecompressImages) {
        RewriterId::Image
    } else if options.is_enabled(Filter::CacheExtendImages) {
        RewriterId::CacheExtend
    } else {
        return Vec::new();
    };

    sheet
        .references
        .iter()
        .filter(|reference| reference.kind == ReferenceKind::Url)
        .filter(|reference| {
            !reference.url.starts_with("data:") && !reference.url.contains(PAGESPEED_MARKER)
        })
        .filter_map(|reference| {
            let url = css_url.join(&reference.url).ok()?;
            if id == RewriterId::Image && !ContentType::from_path(url.path()).is_image() {
                return None;
            }
            if !server.lawyer().is_authorized(&url, &job.request.base) {
                return None;
            }
            let request = RewriteRequest::new(id, vec![url], job.request.base.clone());
            Some((reference.range.clone(), request))
        })
        .collect()
}

#[async_trait]
impl ResourceRewriter for CssRewriter {
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError> {
        let input = job.inputs.first().ok_or(RewriteError::ParseFailed)?;
        let css_url = input.url().clone();
        let text = input.text();
        let sheet = css::parse(&text)?;

        let server = job.server.clone();
        let (ranges, requests): (Vec<_>, Vec<_>) =
            nested_requests(&server, job, &css_url, &sheet)
                .into_iter()
                .unzip();
        let outcomes = job.rewrite_nested(requests).await;

        let edits = ranges
            .into_iter()
            .zip(outcomes)
            .filter_map(|(range, outcome)| {
                let url = Url::parse(outcome?.url()?).ok()?;
                Some((range, css::quote_url(&trim_url(&url, &css_url))))
            })
            .collect::<Vec<_>>();
        let edited = !edits.is_empty();
        let rewritten = css::minify(&css::apply_edits(&text, edits));

        Ok(RewriteOutput {
            optimizable: edited || rewritten.len() < text.len(),
            publish: true,
            contents: Bytes::from(rewritten),
            content_type: Some(ContentType::Css),
            name: Some(format!("A.{}", escape_leaf(&leaf_of(&css_url)))),
            ..Default::default()
        })
    }
}
