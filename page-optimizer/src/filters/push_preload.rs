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

use http::header;
use log::trace;
use url::Url;

use super::{FilterContext, HtmlFilter};
use crate::dependencies::is_valid;
use crate::driver::DriverState;
use crate::property_cache::Dependency;
use crate::registry::Filter;

/// Produces the `Link` header value preloading a dependency.
fn link_value(dependency: &Dependency, document: &Url) -> Option<String> {
    let destination = dependency.content_type.preload_as()?;
    let url = Url::parse(&dependency.url).ok()?;
    let target = if url.origin() == document.origin() {
        let mut target = url.path().to_owned();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    } else {
        url.into()
    };
    Some(format!("<{target}>; rel=preload; as={destination}; nopush"))
}

/// Sends preload hints for the dependencies recorded by previous responses
#[derive(Debug)]
pub(crate) struct PushPreloadFilter;

impl HtmlFilter for PushPreloadFilter {
    fn filter(&self) -> Filter {
        Filter::PushPreload
    }

    fn determine_enabled(&mut self, state: &DriverState) -> bool {
        !state.page.dependencies().dependencies.is_empty()
    }

    fn start_document(&mut self, ctx: &mut FilterContext<'_>) {
        let now_ms = ctx.server.now_ms();
        let mut values = Vec::new();
        // Hints stop at the first dependency that is no longer valid
        for dependency in ctx
            .page
            .dependencies()
            .dependencies
            .iter()
            .take_while(|dependency| is_valid(dependency, now_ms, ctx.server.purges()))
        {
            if let Some(value) = link_value(dependency, &ctx.url) {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        for value in values {
            trace!("Adding preload hint {value}");
            ctx.headers.add(header::LINK, &value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_type::ContentType;
    use serde_json::Map;

    #[test]
    fn link_values() {
        let document = Url::parse("http://example.com/dir/page.html").unwrap();
        let mut dependency = Dependency {
            url: "http://example.com/b.js.pagespeed.jm.0123456789.js".to_owned(),
            content_type: ContentType::Javascript,
            validity_info: Vec::new(),
            order_key: vec![0],
            extra: Map::new(),
        };
        assert_eq!(
            link_value(&dependency, &document).as_deref(),
            Some("</b.js.pagespeed.jm.0123456789.js>; rel=preload; as=script; nopush")
        );

        dependency.url = "https://cdn.example.com/a.css?x=1".to_owned();
        dependency.content_type = ContentType::Css;
        assert_eq!(
            link_value(&dependency, &document).as_deref(),
            Some("<https://cdn.example.com/a.css?x=1>; rel=preload; as=style; nopush")
        );
    }
}
