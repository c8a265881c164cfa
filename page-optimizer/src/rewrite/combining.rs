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

//! Combining multiple stylesheets or scripts into one resource

use super::{ResourceRewriter, RewriteJob, RewriteOutput};
use crate::content_type::ContentType;
use crate::css::{self, ReferenceKind};
use crate::error::RewriteError;
use crate::js;
use crate::registry::Filter;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;

pub(crate) struct CssCombiner;

pub(crate) struct JavascriptCombiner;

fn check_size(combined: &str, limit: i64) -> Result<(), RewriteError> {
    if limit >= 0 && combined.len() as i64 > limit {
        debug!("Combined resource of {} bytes exceeds limit", combined.len());
        return Err(RewriteError::SizeLimitExceeded);
    }
    Ok(())
}

#[async_trait]
impl ResourceRewriter for CssCombiner {
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError> {
        let minify = job.options.is_enabled(Filter::RewriteCss);
        let mut parts = Vec::with_capacity(job.inputs.len());
        for (index, input) in job.inputs.iter().enumerate() {
            let text = input.text();
            let sheet = css::parse(&text)?;
            // @import is only valid at the start of a stylesheet
            if index > 0
                && sheet
                    .references
                    .iter()
                    .any(|reference| reference.kind == ReferenceKind::Import)
            {
                debug!("Not combining {}: it contains @import", input.url());
                return Err(RewriteError::ParseFailed);
            }
            parts.push(if minify { css::minify(&text) } else { text });
        }

        let combined = parts.join("\n");
        check_size(&combined, job.options.max_combined_css_bytes)?;
        Ok(RewriteOutput {
            optimizable: true,
            publish: true,
            contents: Bytes::from(combined),
            content_type: Some(ContentType::Css),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ResourceRewriter for JavascriptCombiner {
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError> {
        let minify = job.options.is_enabled(Filter::RewriteJavascript);
        let mut parts = Vec::with_capacity(job.inputs.len());
        for input in &job.inputs {
            let text = input.text();
            if js::uses_strict_mode(&text) {
                debug!("Not combining {}: strict mode would spread", input.url());
                return Err(RewriteError::ParseFailed);
            }
            parts.push(if minify { js::minify(&text) } else { text });
        }

        let combined = parts.join(";\n");
        check_size(&combined, job.options.max_combined_js_bytes)?;
        Ok(RewriteOutput {
            optimizable: true,
            publish: true,
            contents: Bytes::from(combined),
            content_type: Some(ContentType::Javascript),
            ..Default::default()
        })
    }
}
