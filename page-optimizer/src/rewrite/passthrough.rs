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

//! Rewrites that don’t transform their input much: renaming, inlining and dependency
//! collection

use super::{ResourceRewriter, RewriteJob, RewriteOutput};
use crate::content_type::ContentType;
use crate::css::{self, ReferenceKind};
use crate::error::RewriteError;
use crate::html::is_safe_raw_text;
use crate::js;
use crate::property_cache::Dependency;
use crate::registry::Filter;
use crate::url_namer::is_relative;

use async_trait::async_trait;
use log::debug;
use serde_json::Map;

/// Renames a resource so that it can be cached for a long time
pub(crate) struct CacheExtender;

/// Loads a stylesheet for inlining
pub(crate) struct CssInliner;

/// Loads a script for inlining
pub(crate) struct JavascriptInliner;

/// Loads a resource to record its validity and the resources it imports
pub(crate) struct DependencyCollector;

#[async_trait]
impl ResourceRewriter for CacheExtender {
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError> {
        let input = job.inputs.first().ok_or(RewriteError::ParseFailed)?;
        Ok(RewriteOutput {
            optimizable: true,
            publish: true,
            contents: input.contents().clone(),
            content_type: Some(input.content_type()),
            ..Default::default()
        })
    }
}

fn inline_output(text: String, element: &str, limit: i64) -> RewriteOutput {
    let mut output = RewriteOutput::default();
    if text.len() as i64 >= limit {
        debug!("Not inlining {element} contents of {} bytes", text.len());
    } else if !is_safe_raw_text(element, &text) {
        debug!("Not inlining {element} contents that would close the element");
    } else {
        output.optimizable = true;
        output.inlined_data = Some(text);
    }
    output
}

#[async_trait]
impl ResourceRewriter for CssInliner {
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError> {
        let input = job.inputs.first().ok_or(RewriteError::ParseFailed)?;
        let text = input.text();
        let sheet = css::parse(&text)?;

        // Inlined into the document, relative references have to be resolved first
        let edits = sheet
            .references
            .iter()
            .filter(|reference| is_relative(&reference.url))
            .filter_map(|reference| {
                let url = input.url().join(&reference.url).ok()?;
                let replacement = match reference.kind {
                    ReferenceKind::Url => css::quote_url(url.as_str()),
                    ReferenceKind::Import => format!("\"{url}\""),
                };
                Some((reference.range.clone(), replacement))
            })
            .collect();
        let mut text = css::apply_edits(&text, edits);
        if job.options.is_enabled(Filter::RewriteCss) {
            text = css::minify(&text);
        }

        let mut output = inline_output(text, "style", job.options.css_inline_max_bytes);
        output.content_type = Some(ContentType::Css);
        Ok(output)
    }
}

#[async_trait]
impl ResourceRewriter for JavascriptInliner {
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError> {
        let input = job.inputs.first().ok_or(RewriteError::ParseFailed)?;
        let mut text = input.text();
        if job.options.is_enabled(Filter::RewriteJavascript) {
            text = js::minify(&text);
        }

        let mut output = inline_output(text, "script", job.options.js_inline_max_bytes);
        output.content_type = Some(ContentType::Javascript);
        Ok(output)
    }
}

#[async_trait]
impl ResourceRewriter for DependencyCollector {
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError> {
        let input = job.inputs.first().ok_or(RewriteError::ParseFailed)?;
        let mut output = RewriteOutput {
            content_type: Some(input.content_type()),
            ..Default::default()
        };
        if input.content_type() != ContentType::Css {
            return Ok(output);
        }

        // Imported stylesheets share the validity of the importing one
        let validity = vec![input.input_info(0)];
        let Ok(sheet) = css::parse(&input.text()) else {
            return Ok(output);
        };
        output.dependencies = sheet
            .references
            .iter()
            .filter(|reference| {
                reference.kind == ReferenceKind::Import
                    && css::media_applies_to_screen(&reference.media)
            })
            .filter_map(|reference| input.url().join(&reference.url).ok())
            .enumerate()
            .map(|(index, url)| Dependency {
                url: url.to_string(),
                content_type: ContentType::Css,
                validity_info: validity.clone(),
                order_key: vec![index as i32],
                extra: Map::new(),
            })
            .collect();
        Ok(output)
    }
}
