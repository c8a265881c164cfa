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

//! Beacon instrumentation
//!
//! A beacon is a script reporting back which candidates (images, CSS selectors, page panels)
//! are visible without scrolling. The results end up in the `dom` cohort of the property page
//! and are used by other filters on later requests. A page is instrumented when its candidates
//! changed or no beacon reported back yet, unless a beacon was injected recently.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::{debug, trace};
use maud::{html, PreEscaped};
use url::Url;

use super::redirect_on_size_limit::js_string;
use super::{FilterContext, HtmlFilter};
use crate::css;
use crate::hasher::hash_parts;
use crate::html::{NodeId, NodeKind};
use crate::property_cache::{BeaconKind, BeaconMetadata, BeaconNonce};
use crate::registry::Filter;

/// Path beacons report to, relative to the page origin
pub const BEACON_PATH: &str = "/pagespeed_beacon";

/// Attribute marking instrumented images
const URL_HASH_ATTRIBUTE: &str = "data-pagespeed-url-hash";

/// Outstanding nonces kept per page and beacon kind
pub(crate) const MAX_NONCES: usize = 8;

/// Produces the key identifying an image in beacon results.
pub(crate) fn image_key(url: &Url) -> String {
    hash_parts(&[url.as_str()])
}

fn generate_nonce() -> Option<String> {
    let mut buffer = [0; 12];
    match getrandom::getrandom(&mut buffer) {
        Ok(()) => Some(URL_SAFE_NO_PAD.encode(buffer)),
        Err(err) => {
            debug!("Failed generating beacon nonce: {err}");
            None
        }
    }
}

/// Browser side of the beacon. Candidates are checked against the initial viewport, visible
/// ones are posted back.
fn beacon_script(kind: BeaconKind, page: &Url, nonce: &str, candidates: &[String]) -> String {
    let data = serde_json::to_string(candidates)
        .unwrap_or_else(|_| "[]".to_owned())
        .replace("</", "<\\/");
    let check = match kind {
        BeaconKind::CriticalImages => {
            "var e=document.querySelectorAll('img[data-pagespeed-url-hash]');\
            for(var i=0;i<e.length;i++){var h=e[i].getAttribute('data-pagespeed-url-hash');\
            if(c.indexOf(h)>=0&&v(e[i])&&r.indexOf(h)<0)r.push(h);}"
        }
        BeaconKind::CriticalCss => {
            "for(var i=0;i<c.length;i++){try{var e=document.querySelectorAll(c[i]);\
            for(var j=0;j<e.length;j++)if(v(e[j])){r.push(c[i]);break;}}catch(x){}}"
        }
        BeaconKind::SplitHtml => {
            "for(var i=0;i<c.length;i++){var e=document.getElementById(c[i]);\
            if(e&&v(e))r.push(c[i]);}"
        }
    };
    let target = format!(
        "{BEACON_PATH}?url={}&id={}&n={nonce}",
        js_string(&percent_encoding::utf8_percent_encode(
            page.as_str(),
            percent_encoding::NON_ALPHANUMERIC
        )
        .to_string()),
        kind.id()
    );
    format!(
        "(function(){{var c={data};var f=function(){{var r=[];\
        var v=function(e){{var b=e.getBoundingClientRect();\
        return b.width>0&&b.height>0&&\
        b.top<(window.innerHeight||document.documentElement.clientHeight);}};\
        {check}\
        var d='{id}='+r.map(encodeURIComponent).join(',');\
        if(navigator.sendBeacon){{navigator.sendBeacon(\"{target}\",\
        new Blob([d],{{type:'application/x-www-form-urlencoded'}}));}}\
        else{{var x=new XMLHttpRequest();x.open('POST',\"{target}\");\
        x.setRequestHeader('Content-Type','application/x-www-form-urlencoded');x.send(d);}}}};\
        if(document.readyState=='complete')f();else window.addEventListener('load',f);}})();",
        id = kind.id(),
    )
}

/// Checks whether a new beacon should be injected into the page.
fn needs_beacon(
    metadata: Option<&BeaconMetadata>,
    candidates: &[String],
    now_ms: i64,
    reinstrument_ms: i64,
) -> bool {
    let Some(metadata) = metadata else {
        return true;
    };
    if metadata
        .nonces
        .iter()
        .any(|nonce| nonce.timestamp_ms + reinstrument_ms > now_ms)
    {
        return false;
    }
    metadata.candidate_keys != candidates || metadata.critical_keys.is_empty()
}

/// Instruments the page with a beacon of the given kind
#[derive(Debug)]
pub(crate) struct BeaconFilter {
    kind: BeaconKind,
    candidates: Vec<String>,
    body: Option<NodeId>,
}

impl BeaconFilter {
    fn new(kind: BeaconKind) -> Self {
        Self {
            kind,
            candidates: Vec::new(),
            body: None,
        }
    }

    pub(crate) fn critical_images() -> Self {
        Self::new(BeaconKind::CriticalImages)
    }

    pub(crate) fn critical_css() -> Self {
        Self::new(BeaconKind::CriticalCss)
    }

    pub(crate) fn split_html() -> Self {
        Self::new(BeaconKind::SplitHtml)
    }

    fn add_candidate(&mut self, key: String) {
        if !self.candidates.contains(&key) {
            self.candidates.push(key);
        }
    }
}

impl HtmlFilter for BeaconFilter {
    fn filter(&self) -> Filter {
        match self.kind {
            BeaconKind::CriticalImages => Filter::CriticalImagesBeacon,
            BeaconKind::CriticalCss => Filter::CriticalCssBeacon,
            BeaconKind::SplitHtml => Filter::SplitHtmlBeacon,
        }
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if self.body.is_none() && ctx.doc.is_element(node, "body") {
            self.body = Some(node);
        }

        match self.kind {
            BeaconKind::CriticalImages => {
                if !ctx.doc.is_element(node, "img") {
                    return;
                }
                let Some(url) = ctx
                    .doc
                    .attribute(node, "src")
                    .map(|src| src.trim().to_owned())
                    .filter(|src| !src.is_empty() && !src.starts_with("data:"))
                    .and_then(|src| ctx.base.join(&src).ok())
                else {
                    return;
                };
                let key = image_key(&url);
                ctx.doc.set_attribute(node, URL_HASH_ATTRIBUTE, &key);
                self.add_candidate(key);
            }
            BeaconKind::SplitHtml => {
                if let Some(id) = ctx.doc.attribute(node, "id") {
                    let id = id.trim();
                    if !id.is_empty() {
                        let id = id.to_owned();
                        self.add_candidate(id);
                    }
                }
            }
            BeaconKind::CriticalCss => {}
        }
    }

    fn end_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if self.kind != BeaconKind::CriticalCss || !ctx.doc.is_element(node, "style") {
            return;
        }
        match css::parse(&ctx.doc.text_content(node)) {
            Ok(stylesheet) => {
                for selector in stylesheet.selectors {
                    self.add_candidate(selector);
                }
            }
            Err(err) => trace!("Not collecting selectors from unparsable style: {err:?}"),
        }
    }

    fn end_document(&mut self, ctx: &mut FilterContext<'_>) {
        if self.candidates.is_empty() {
            return;
        }
        let now_ms = ctx.server.now_ms();
        let reinstrument_ms = ctx.options.beacon_reinstrument_time_sec.saturating_mul(1000);
        let mut candidates = std::mem::take(&mut self.candidates);
        candidates.sort();
        if !needs_beacon(
            ctx.page.dom().beacons.get(&self.kind),
            &candidates,
            now_ms,
            reinstrument_ms,
        ) {
            trace!("No {} beacon needed", self.kind.id());
            return;
        }
        let Some(nonce) = generate_nonce() else {
            return;
        };

        let script = html! {
            script {
                (PreEscaped(beacon_script(self.kind, &ctx.url, &nonce, &candidates)))
            }
        }
        .into_string();
        let parent = self
            .body
            .filter(|body| ctx.doc.is_attached(*body))
            .unwrap_or_else(|| ctx.doc.root());
        if ctx
            .doc
            .append_child(parent, NodeKind::characters(script))
            .is_none()
        {
            return;
        }

        debug!("Instrumenting page with {} beacon", self.kind.id());
        let metadata = ctx.page.dom_mut().beacons.entry(self.kind).or_default();
        if metadata.candidate_keys != candidates {
            metadata
                .critical_keys
                .retain(|key| candidates.contains(key));
            metadata.candidate_keys = candidates;
            metadata.last_change_ms = now_ms;
        }
        metadata.nonces.push(BeaconNonce {
            nonce,
            timestamp_ms: now_ms,
        });
        if metadata.nonces.len() > MAX_NONCES {
            let excess = metadata.nonces.len() - MAX_NONCES;
            metadata.nonces.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|key| (*key).to_owned()).collect()
    }

    #[test]
    fn beacon_decision() {
        let candidates = keys(&["a", "b"]);
        assert!(needs_beacon(None, &candidates, 1000, 5000));

        let mut metadata = BeaconMetadata {
            candidate_keys: candidates.clone(),
            critical_keys: keys(&["a"]),
            ..Default::default()
        };
        assert!(!needs_beacon(Some(&metadata), &candidates, 1000, 5000));
        assert!(needs_beacon(Some(&metadata), &keys(&["a", "c"]), 1000, 5000));

        metadata.nonces.push(BeaconNonce {
            nonce: "n".to_owned(),
            timestamp_ms: 1000,
        });
        assert!(!needs_beacon(Some(&metadata), &keys(&["a", "c"]), 2000, 5000));
        assert!(needs_beacon(Some(&metadata), &keys(&["a", "c"]), 6000, 5000));
    }

    #[test]
    fn script_escaping() {
        let page = Url::parse("http://example.com/page?x=1").unwrap();
        let script = beacon_script(
            BeaconKind::CriticalCss,
            &page,
            "abc",
            &keys(&["</script>"]),
        );
        assert!(!script.contains("</script>"));
        assert!(script.contains(
            "/pagespeed_beacon?url=http%3A%2F%2Fexample%2Ecom%2Fpage%3Fx%3D1&id=cs&n=abc"
        ));
    }
}
