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
use crate::js;

use async_trait::async_trait;
use bytes::Bytes;

/// Minifies external scripts
pub(crate) struct JavascriptRewriter;

#[async_trait]
impl ResourceRewriter for JavascriptRewriter {
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError> {
        let input = job.inputs.first().ok_or(RewriteError::ParseFailed)?;
        let text = input.text();
        let minified = js::minify(&text);
        Ok(RewriteOutput {
            optimizable: minified.len() < text.len(),
            publish: true,
            contents: Bytes::from(minified),
            content_type: Some(ContentType::Javascript),
            ..Default::default()
        })
    }
}
