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

//! Insertion of an analytics snippet into pages that don’t contain one yet

use log::debug;
use maud::{html, PreEscaped};

use super::redirect_on_size_limit::js_string;
use super::{FilterContext, HtmlFilter};
use crate::driver::DriverState;
use crate::html::{NodeId, NodeKind};
use crate::registry::Filter;
use crate::statistics::Stat;

fn analytics_js(id: &str, speed_tracking: bool) -> String {
    let create = if speed_tracking {
        format!("ga('create','{id}','auto',{{'siteSpeedSampleRate':100}});")
    } else {
        format!("ga('create','{id}','auto');")
    };
    format!(
        "(function(i,s,o,g,r,a,m){{i['GoogleAnalyticsObject']=r;i[r]=i[r]||function(){{\
        (i[r].q=i[r].q||[]).push(arguments)}},i[r].l=1*new Date();a=s.createElement(o),\
        m=s.getElementsByTagName(o)[0];a.async=1;a.src=g;m.parentNode.insertBefore(a,m)\
        }})(window,document,'script','//www.google-analytics.com/analytics.js','ga');\
        {create}ga('send','pageview');"
    )
}

fn ga_js(id: &str, speed_tracking: bool) -> String {
    let speed = if speed_tracking {
        "_gaq.push(['_setSiteSpeedSampleRate',100]);"
    } else {
        ""
    };
    format!(
        "var _gaq=_gaq||[];_gaq.push(['_setAccount','{id}']);{speed}\
        _gaq.push(['_trackPageview']);(function(){{var ga=document.createElement('script');\
        ga.type='text/javascript';ga.async=true;ga.src=('https:'==document.location.protocol?\
        'https://ssl':'http://www')+'.google-analytics.com/ga.js';\
        var s=document.getElementsByTagName('script')[0];s.parentNode.insertBefore(ga,s);}})();"
    )
}

/// Adds the analytics snippet to the end of `<head>`, or the start of `<body>` if there is no
/// head. Pages referencing the analytics id already are left alone.
#[derive(Debug, Default)]
pub(crate) struct InsertGaFilter {
    done: bool,
    found: bool,
}

impl InsertGaFilter {
    fn snippet(ctx: &FilterContext<'_>) -> String {
        // Quotes in the id would break out of the string literals
        let id = js_string(&ctx.options.ga_id).replace('\'', "\\'");
        let code = if ctx.options.use_analytics_js {
            analytics_js(&id, ctx.options.increase_speed_tracking)
        } else {
            ga_js(&id, ctx.options.increase_speed_tracking)
        };
        html! {
            script { (PreEscaped(code)) }
        }
        .into_string()
    }

    fn insert(&mut self, ctx: &mut FilterContext<'_>, parent: NodeId) {
        self.done = true;
        if self.found {
            debug!("Page contains the analytics snippet already");
            return;
        }
        let snippet = Self::snippet(ctx);
        if ctx
            .doc
            .append_child(parent, NodeKind::characters(snippet))
            .is_some()
        {
            ctx.server
                .statistics()
                .increment(Stat::AnalyticsSnippetsInserted);
        }
    }
}

impl HtmlFilter for InsertGaFilter {
    fn filter(&self) -> Filter {
        Filter::InsertGa
    }

    fn determine_enabled(&mut self, state: &DriverState) -> bool {
        !state.options.ga_id.trim().is_empty()
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if !self.done && ctx.doc.is_element(node, "body") {
            self.insert(ctx, node);
        }
    }

    fn end_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if self.done {
            return;
        }
        if ctx.doc.is_element(node, "script")
            && ctx.doc.text_content(node).contains(ctx.options.ga_id.trim())
        {
            self.found = true;
        } else if ctx.doc.is_element(node, "head") {
            self.insert(ctx, node);
        }
    }
}
