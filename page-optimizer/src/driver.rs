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

//! Streaming rewriting of HTML documents
//!
//! The driver tokenizes the document as it arrives, builds a tree of the parts that weren’t
//! written out yet and delivers events to the filter chain. On every flush it waits for the
//! rewrites started so far, but no longer than the rewrite deadline, lets the filters render the
//! outcomes and writes out everything that is complete.

use http::{HeaderMap, HeaderValue, Method};
use log::{debug, info, trace, warn};
use std::fmt::Debug;
use std::mem::take;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use url::Url;

use crate::configuration::{RequestOptions, RewriteOptions};
use crate::dependencies::{self, DependencyTracker};
use crate::error::Error;
use crate::fetch::FetchRequest;
use crate::filters::{create_filters, FilterContext, HtmlFilter};
use crate::headers::ResponseHeaders;
use crate::html::{Document, HtmlWriter, Lexer, NodeId, NodeKind, Token};
use crate::property_cache::{DependenciesCohort, PropertyPage};
use crate::registry::{Filter, ScriptUsage};
use crate::rewrite::{initiate, RewriteHandle, RewriteRequest, Slot};
use crate::server_context::{page_key, ServerContext};
use crate::statistics::Stat;

/// Request header marking requests sent to purge downstream caches
pub const PURGE_REQUEST_HEADER: &str = "psa-purge-request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Rewriting,
    PassThrough,
    Finished,
}

struct PendingRewrite {
    filter: usize,
    token: usize,
    key: String,
    handle: RewriteHandle,
    slots: Vec<Slot>,
    cancelled: bool,
}

/// Everything filters can see and change while a document is rewritten
pub(crate) struct DriverState {
    pub(crate) server: Arc<ServerContext>,
    pub(crate) options: Arc<RewriteOptions>,
    pub(crate) request_headers: HeaderMap,
    /// Document URL with option overrides removed
    pub(crate) url: Url,
    /// Base URL for relative references, changed by `<base href>`
    pub(crate) base: Url,
    pub(crate) doc: Document,
    pub(crate) headers: ResponseHeaders,
    pub(crate) page: PropertyPage,
    pub(crate) dependencies: DependencyTracker,
    base_seen: bool,
    pending: Vec<PendingRewrite>,
    next_token: usize,
    rewrites_initiated: usize,
    rewrites_rendered: usize,
}

impl DriverState {
    pub(crate) fn initiate(
        &mut self,
        filter: usize,
        request: RewriteRequest,
        slots: Vec<Slot>,
    ) -> usize {
        let key = request.metadata_key(&self.options);
        if let Some(pending) = self
            .pending
            .iter_mut()
            .find(|pending| pending.filter == filter && pending.key == key)
        {
            pending.slots.extend(slots);
            return pending.token;
        }

        let token = self.next_token;
        self.next_token += 1;
        self.rewrites_initiated += 1;
        trace!("Document {} initiating rewrite {key}", self.url);
        let handle = initiate(&self.server, &self.options, request, true);
        self.pending.push(PendingRewrite {
            filter,
            token,
            key,
            handle,
            slots,
            cancelled: false,
        });
        token
    }

    /// Marks a pending rewrite as not to be rendered. The rewrite itself keeps running and
    /// populates the caches. Returns `false` if there is no such pending rewrite.
    pub(crate) fn cancel(&mut self, token: usize, reason: &str) -> bool {
        let Some(pending) = self
            .pending
            .iter_mut()
            .find(|pending| pending.token == token && !pending.cancelled)
        else {
            return false;
        };
        debug!("Cancelling rewrite {}: {reason}", pending.key);
        pending.cancelled = true;
        self.server.statistics().increment(Stat::RewritesCancelled);
        true
    }

    fn abandon_pending(&mut self) {
        let count = self.pending.len();
        if count > 0 {
            debug!("Abandoning {count} pending rewrites of {}", self.url);
            self.server
                .statistics()
                .add(Stat::RewritesAbandoned, count as u64);
            self.pending.clear();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    StartElement(NodeId),
    EndElement(NodeId),
    Characters(NodeId),
    Comment(NodeId),
    Cdata(NodeId),
    Directive(NodeId),
    Flush,
    EndDocument,
}

impl Event {
    fn node(self) -> Option<NodeId> {
        match self {
            Self::StartElement(node)
            | Self::EndElement(node)
            | Self::Characters(node)
            | Self::Comment(node)
            | Self::Cdata(node)
            | Self::Directive(node) => Some(node),
            Self::Flush | Self::EndDocument => None,
        }
    }
}

fn dispatch(filters: &mut [Box<dyn HtmlFilter>], state: &mut DriverState, event: Event) {
    for (index, filter) in filters.iter_mut().enumerate() {
        // Filters further down the chain don’t see nodes removed by earlier ones
        if let Some(node) = event.node() {
            if !state.doc.is_attached(node) {
                return;
            }
        }
        let mut ctx = FilterContext::new(state, index);
        match event {
            Event::StartElement(node) => filter.start_element(&mut ctx, node),
            Event::EndElement(node) => filter.end_element(&mut ctx, node),
            Event::Characters(node) => filter.characters(&mut ctx, node),
            Event::Comment(node) => filter.comment(&mut ctx, node),
            Event::Cdata(node) => filter.cdata(&mut ctx, node),
            Event::Directive(node) => filter.directive(&mut ctx, node),
            Event::Flush => filter.flush(&mut ctx),
            Event::EndDocument => filter.end_document(&mut ctx),
        }
    }
}

/// Adds a token to the document. Returns the resulting events and the node created, if any.
fn build(doc: &mut Document, token: Token) -> (Vec<Event>, Option<NodeId>) {
    let mut events = Vec::new();
    let created = match token {
        Token::StartTag {
            name,
            attributes,
            self_closing,
        } => {
            events.extend(
                doc.close_implied_by(&name)
                    .into_iter()
                    .map(Event::EndElement),
            );
            let node = doc.push_element(&name, attributes, self_closing);
            events.push(Event::StartElement(node));
            if !doc.is_open(node) {
                events.push(Event::EndElement(node));
            }
            node
        }
        Token::EndTag { name } => match doc.close_element(&name) {
            Some(closed) => {
                events.extend(closed.into_iter().map(Event::EndElement));
                return (events, None);
            }
            None => {
                // Stray end tag, kept as text
                let node = doc.push_node(NodeKind::characters(format!("</{name}>")));
                events.push(Event::Characters(node));
                node
            }
        },
        Token::Characters(text) => {
            let node = doc.push_node(NodeKind::Characters(text));
            events.push(Event::Characters(node));
            node
        }
        Token::Comment(text) => {
            let node = doc.push_node(NodeKind::Comment(text));
            events.push(Event::Comment(node));
            node
        }
        Token::Cdata(text) => {
            let node = doc.push_node(NodeKind::Cdata(text));
            events.push(Event::Cdata(node));
            node
        }
        Token::Directive(text) => {
            let node = doc.push_node(NodeKind::Directive(text));
            events.push(Event::Directive(node));
            node
        }
    };
    (events, Some(created))
}

/// Decides the options for a document from the configuration and the request overrides.
/// Returns `None` if the document shouldn’t be rewritten.
fn document_options(
    global: &Arc<RewriteOptions>,
    overrides: RequestOptions,
) -> Option<Arc<RewriteOptions>> {
    if overrides.disabled {
        return None;
    }

    let mut overrides = overrides;
    let requested = global.with_overrides(&overrides);
    let active = requested.active_filters();
    if overrides.noscript {
        overrides.disable.extend(
            active
                .iter()
                .copied()
                .filter(|filter| filter.script_usage() != ScriptUsage::NeverInjectsScripts),
        );
    } else if active
        .iter()
        .any(|filter| filter.script_usage() == ScriptUsage::WillInjectScripts)
        && !requested.disabled_filters.contains(&Filter::SupportNoscript)
    {
        overrides.enable.insert(Filter::SupportNoscript);
    }

    let options = if overrides.is_empty() {
        global.clone()
    } else {
        Arc::new(global.with_overrides(&overrides))
    };
    if options.active_filters().is_empty() {
        None
    } else {
        Some(options)
    }
}

/// Rewrites HTML documents, one at a time
///
/// A driver is set up with the request and response headers, then receives the document in
/// chunks through [`RewriteDriver::parse_text`]. Output goes to the [`HtmlWriter`] as soon as
/// it is complete: on [`RewriteDriver::flush`] and [`RewriteDriver::finish_parse`]. After
/// [`RewriteDriver::clear`] the driver can process another document.
pub struct RewriteDriver<W: HtmlWriter> {
    server: Arc<ServerContext>,
    writer: W,
    request_method: Method,
    request_headers: HeaderMap,
    headers: ResponseHeaders,
    state: Option<DriverState>,
    filters: Vec<Box<dyn HtmlFilter>>,
    lexer: Lexer,
    incomplete: Vec<u8>,
    mode: Mode,
    window_start: Instant,
    parsed_bytes: u64,
    size_limited: bool,
    redirect_pending: bool,
    write_failed: bool,
    purge_attempted: bool,
}

impl<W: HtmlWriter + Debug> Debug for RewriteDriver<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewriteDriver")
            .field("writer", &self.writer)
            .field("mode", &self.mode)
            .field("filters", &self.filters.len())
            .field("parsed_bytes", &self.parsed_bytes)
            .finish_non_exhaustive()
    }
}

impl<W: HtmlWriter> RewriteDriver<W> {
    /// Creates a driver writing to `writer`.
    pub fn new(server: Arc<ServerContext>, writer: W) -> Self {
        Self {
            server,
            writer,
            request_method: Method::GET,
            request_headers: HeaderMap::new(),
            headers: ResponseHeaders::default(),
            state: None,
            filters: Vec::new(),
            lexer: Lexer::new(),
            incomplete: Vec::new(),
            mode: Mode::Idle,
            window_start: Instant::now(),
            parsed_bytes: 0,
            size_limited: false,
            redirect_pending: false,
            write_failed: false,
            purge_attempted: false,
        }
    }

    /// Sets the headers of the request the document is produced for.
    pub fn set_request_headers(&mut self, method: Method, headers: HeaderMap) {
        self.request_method = method;
        self.request_headers = headers;
    }

    /// Sets the headers of the origin response. Filters may change them until the first output
    /// is written.
    pub fn set_response_headers(&mut self, headers: ResponseHeaders) {
        match &mut self.state {
            Some(state) => state.headers = headers,
            None => self.headers = headers,
        }
    }

    /// Current response headers
    pub fn response_headers(&self) -> &ResponseHeaders {
        match &self.state {
            Some(state) => &state.headers,
            None => &self.headers,
        }
    }

    /// Options applying to the current document
    pub fn options(&self) -> Option<&Arc<RewriteOptions>> {
        self.state.as_ref().map(|state| &state.options)
    }

    /// The output destination
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// The output destination
    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Starts processing a document. Query parameters and request headers may change the
    /// options or turn rewriting off, the document is passed through unchanged then.
    pub async fn start_parse(&mut self, url: Url) -> Result<(), Error> {
        if self.mode != Mode::Idle {
            return Err(Error::Aborted(
                "start_parse called while a document is being processed".to_owned(),
            ));
        }

        let (overrides, url) = RequestOptions::from_request(&url, &self.request_headers);
        let no_transform = self.server.options().respect_no_transform
            && self.headers.has_cache_control_directive("no-transform");
        let options = if no_transform {
            debug!("Response for {url} requests no transformation, passing through");
            None
        } else {
            document_options(self.server.options(), overrides)
        };

        let (options, page) = match options {
            Some(options) => {
                let key = page_key(&options, &url);
                let deadline = Duration::from_millis(options.fetch_deadline_ms);
                let page = timeout(
                    deadline,
                    PropertyPage::read(self.server.property_store(), &key),
                )
                .await
                .unwrap_or_else(|_| {
                    warn!("Reading property page {key} timed out");
                    PropertyPage::empty(&key)
                });
                (options, page)
            }
            None => {
                debug!("Passing through {url} unchanged");
                self.mode = Mode::PassThrough;
                (self.server.options().clone(), PropertyPage::empty(""))
            }
        };

        self.state = Some(DriverState {
            server: self.server.clone(),
            options,
            request_headers: self.request_headers.clone(),
            base: url.clone(),
            url,
            doc: Document::new(),
            headers: take(&mut self.headers),
            page,
            dependencies: DependencyTracker::default(),
            base_seen: false,
            pending: Vec::new(),
            next_token: 0,
            rewrites_initiated: 0,
            rewrites_rendered: 0,
        });
        self.window_start = Instant::now();
        if self.mode == Mode::PassThrough {
            return Ok(());
        }

        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        let mut filters = create_filters(&state.options);
        filters.retain_mut(|filter| filter.determine_enabled(state));
        debug!(
            "Rewriting {} with filters {:?}",
            state.url,
            filters.iter().map(|f| f.filter().name()).collect::<Vec<_>>()
        );
        for (index, filter) in filters.iter_mut().enumerate() {
            filter.start_document(&mut FilterContext::new(state, index));
        }
        self.filters = filters;
        self.mode = Mode::Rewriting;
        Ok(())
    }

    /// Processes the next chunk of the document. Chunks may split tags and UTF-8 sequences
    /// anywhere.
    pub async fn parse_text(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.mode {
            Mode::Idle | Mode::Finished => {
                return Err(Error::Aborted(
                    "parse_text called without start_parse".to_owned(),
                ))
            }
            Mode::PassThrough => {
                if self.incomplete.is_empty() {
                    if let Ok(text) = std::str::from_utf8(data) {
                        return self.write(text);
                    }
                }
                self.incomplete.extend_from_slice(data);
                let text = self.take_text();
                return self.write(&text);
            }
            Mode::Rewriting => {}
        }
        if self.write_failed {
            return Ok(());
        }

        self.incomplete.extend_from_slice(data);
        let text = self.take_text();
        let tokens = self.lexer.feed(&text);
        for (token, length) in tokens {
            self.process(token, length);
        }
        Ok(())
    }

    /// Decodes the complete UTF-8 sequences received so far.
    fn take_text(&mut self) -> String {
        let complete = match std::str::from_utf8(&self.incomplete) {
            Ok(_) => self.incomplete.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => self.incomplete.len(),
        };
        let head = self.incomplete.drain(..complete).collect::<Vec<_>>();
        String::from_utf8(head)
            .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
    }

    fn process(&mut self, token: Token, length: usize) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        self.parsed_bytes += length as u64;
        let limit = state.options.max_html_parse_bytes;

        let (events, created) = build(&mut state.doc, token);
        if self.write_failed {
            return;
        }
        if self.size_limited {
            // Filters reacting to the limit get the first element starting after it
            if self.redirect_pending {
                let started = events.iter().find_map(|event| match event {
                    Event::StartElement(node) => Some(*node),
                    _ => None,
                });
                if let Some(node) = started {
                    self.redirect_pending = false;
                    for (index, filter) in self.filters.iter_mut().enumerate() {
                        filter.size_limit_exceeded(&mut FilterContext::new(state, index), node);
                    }
                }
            }
            return;
        }

        if limit >= 0 && self.parsed_bytes > limit as u64 && created.is_some() {
            info!(
                "Document {} exceeds {limit} bytes, no longer rewriting",
                state.url
            );
            self.size_limited = true;
            self.redirect_pending = true;
            self.server
                .statistics()
                .increment(Stat::HtmlSizeLimitExceeded);
            state.abandon_pending();
            return;
        }

        for event in events {
            if let Event::StartElement(node) = event {
                if !state.base_seen && state.doc.is_element(node, "base") {
                    if let Some(href) = state.doc.attribute(node, "href") {
                        match state.url.join(href.trim()) {
                            Ok(base) => {
                                trace!("Document base changed to {base}");
                                state.base = base;
                                state.base_seen = true;
                            }
                            Err(err) => debug!("Ignoring invalid base URL {href}: {err}"),
                        }
                    }
                }
            }
            dispatch(&mut self.filters, state, event);
        }
    }

    /// Writes out everything that is complete. Rewrites that don’t finish before the rewrite
    /// deadline keep their original references.
    pub async fn flush(&mut self) -> Result<(), Error> {
        match self.mode {
            Mode::Idle | Mode::Finished => {
                return Err(Error::Aborted("flush called without start_parse".to_owned()))
            }
            Mode::PassThrough => {
                self.write("")?;
                return self.flush_writer();
            }
            Mode::Rewriting => {}
        }
        self.render().await?;
        self.flush_writer()
    }

    async fn render(&mut self) -> Result<(), Error> {
        if self.write_failed {
            return Ok(());
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        if !self.size_limited {
            dispatch(&mut self.filters, state, Event::Flush);
        }

        let deadline =
            self.window_start + Duration::from_millis(state.options.rewrite_deadline_ms);
        let tokens = state
            .pending
            .iter()
            .map(|rewrite| rewrite.token)
            .collect::<Vec<_>>();
        for token in tokens {
            let Some(index) = state.pending.iter().position(|rewrite| rewrite.token == token)
            else {
                continue;
            };
            let slots = &state.pending[index].slots;
            if !slots.is_empty() && slots.iter().all(|slot| !state.doc.is_attached(slot.node())) {
                state.cancel(token, "element removed from the document");
            }

            let mut rewrite = state.pending.remove(index);
            let outcome = if rewrite.cancelled {
                for slot in &mut rewrite.slots {
                    slot.disable_rendering();
                }
                None
            } else {
                match timeout_at(deadline, rewrite.handle.wait()).await {
                    Ok(outcome) => {
                        state.rewrites_rendered += 1;
                        Some(outcome)
                    }
                    Err(_) => {
                        debug!(
                            "Rewrite {} missed the deadline, keeping the original",
                            rewrite.key
                        );
                        self.server.statistics().increment(Stat::RewritesAbandoned);
                        None
                    }
                }
            };
            if let Some(filter) = self.filters.get_mut(rewrite.filter) {
                let mut ctx = FilterContext::new(state, rewrite.filter);
                filter.render(
                    &mut ctx,
                    rewrite.token,
                    outcome.as_deref(),
                    &mut rewrite.slots,
                );
            }
        }

        state.dependencies.capture(&state.doc, &state.base);
        let html = state.doc.flush();
        self.write(&html)?;
        self.window_start = Instant::now();
        Ok(())
    }

    fn write(&mut self, text: &str) -> Result<(), Error> {
        if self.write_failed {
            return Ok(());
        }
        let headers = match &mut self.state {
            Some(state) => &mut state.headers,
            None => &mut self.headers,
        };

        let mut result = Ok(());
        if !headers.is_committed() {
            headers.commit();
            result = self.writer.write_headers(headers);
        }
        if result.is_ok() && !text.is_empty() {
            result = self.writer.write(text);
        }
        if let Err(err) = &result {
            warn!("Writing document failed, dropping further output: {err}");
            self.write_failed = true;
        }
        result
    }

    fn flush_writer(&mut self) -> Result<(), Error> {
        if self.write_failed {
            return Ok(());
        }
        let result = self.writer.flush();
        if result.is_err() {
            self.write_failed = true;
        }
        result
    }

    /// Processes the end of the document, writes out the remaining output and stores what was
    /// learned about the document.
    pub async fn finish_parse(&mut self) -> Result<(), Error> {
        match self.mode {
            Mode::Idle | Mode::Finished => {
                return Err(Error::Aborted(
                    "finish_parse called without start_parse".to_owned(),
                ))
            }
            Mode::PassThrough => {
                let text = self.take_remaining_text();
                self.mode = Mode::Finished;
                self.write(&text)?;
                return self.flush_writer();
            }
            Mode::Rewriting => {}
        }

        let text = self.take_remaining_text();
        let mut tokens = self.lexer.feed(&text);
        tokens.extend(self.lexer.finish());
        for (token, length) in tokens {
            self.process(token, length);
        }
        if let Some(state) = self.state.as_mut() {
            let closed = state.doc.close_all();
            if !self.size_limited && !self.write_failed {
                for node in closed {
                    dispatch(&mut self.filters, state, Event::EndElement(node));
                }
                dispatch(&mut self.filters, state, Event::EndDocument);
            }
        }

        self.mode = Mode::Finished;
        let result = self.render().await;
        let result = result.and_then(|_| self.flush_writer());
        self.store_properties().await;
        self.purge_downstream().await;
        result
    }

    fn take_remaining_text(&mut self) -> String {
        let remaining = take(&mut self.incomplete);
        String::from_utf8_lossy(&remaining).into_owned()
    }

    async fn store_properties(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let store = self.server.property_store();
        if state.options.is_enabled(Filter::CollectDependencies) && !self.size_limited {
            let merged = dependencies::merge(
                &state.page.dependencies().dependencies,
                state.dependencies.dependencies(),
                self.server.now_ms(),
                self.server.purges(),
            );
            trace!(
                "Storing {} dependencies for {}",
                merged.len(),
                state.page.key()
            );
            state
                .page
                .write_dependencies(
                    store,
                    DependenciesCohort {
                        dependencies: merged,
                        ..Default::default()
                    },
                )
                .await;
        }
        state.page.write_dom(store).await;
    }

    /// Asks the downstream cache to drop the page if too few rewrites made it into it, so that
    /// the next request gets a better optimized version.
    async fn purge_downstream(&mut self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let options = &state.options;
        if self.purge_attempted
            || options.downstream_cache_purge_location_prefix.is_empty()
            || state.rewrites_initiated == 0
            || self.request_method != Method::GET
            || self.request_headers.contains_key(PURGE_REQUEST_HEADER)
        {
            return;
        }
        let percentage = state.rewrites_rendered * 100 / state.rewrites_initiated;
        if percentage >= options.downstream_cache_rewritten_percentage_threshold as usize {
            return;
        }

        let mut target = options
            .downstream_cache_purge_location_prefix
            .trim_end_matches('/')
            .to_owned();
        target.push_str(state.url.path());
        if let Some(query) = state.url.query() {
            target.push('?');
            target.push_str(query);
        }
        let url = match Url::parse(&target) {
            Ok(url) => url,
            Err(err) => {
                warn!("Invalid downstream cache purge URL {target}: {err}");
                return;
            }
        };
        let method = options.downstream_cache_purge_method.as_str();
        let Ok(method) = Method::from_bytes(method.as_bytes()) else {
            return;
        };

        self.purge_attempted = true;
        info!("Only {percentage}% of rewrites completed in time, purging {url} downstream");
        self.server
            .statistics()
            .increment(Stat::DownstreamCachePurgeAttempts);
        let mut headers = HeaderMap::new();
        headers.insert(PURGE_REQUEST_HEADER, HeaderValue::from_static("1"));
        let request = FetchRequest {
            method,
            url,
            headers,
        };
        let deadline = Duration::from_millis(options.fetch_deadline_ms);
        match timeout(deadline, self.server.fetcher().fetch(request)).await {
            Ok(Ok(response)) => trace!("Purge request returned status {}", response.status),
            Ok(Err(err)) => debug!("Purge request failed: {err}"),
            Err(_) => debug!("Purge request timed out"),
        }
    }

    /// Resets the driver so that it can process another document. Rewrites still running
    /// continue in the background.
    pub fn clear(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.pending.clear();
        }
        self.request_method = Method::GET;
        self.request_headers.clear();
        self.headers = ResponseHeaders::default();
        self.state = None;
        self.filters.clear();
        self.lexer.reset();
        self.incomplete.clear();
        self.mode = Mode::Idle;
        self.parsed_bytes = 0;
        self.size_limited = false;
        self.redirect_pending = false;
        self.write_failed = false;
        self.purge_attempted = false;
    }
}

impl<W: HtmlWriter> Drop for RewriteDriver<W> {
    fn drop(&mut self) {
        if self.mode == Mode::Rewriting {
            debug!("Driver dropped before the document was finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::RewriteLevel;
    use crate::testing::{gif_image, MockUrlFetcher, StringWriter, TestImageOptimizer};

    use http::StatusCode;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    /// Counts the element and document events it receives
    struct CountingFilter(Arc<AtomicUsize>);

    impl HtmlFilter for CountingFilter {
        fn filter(&self) -> Filter {
            Filter::AddIds
        }

        fn start_element(&mut self, _ctx: &mut FilterContext<'_>, _node: NodeId) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }

        fn end_element(&mut self, _ctx: &mut FilterContext<'_>, _node: NodeId) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }

        fn end_document(&mut self, _ctx: &mut FilterContext<'_>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn server(filters: &[Filter]) -> Arc<ServerContext> {
        let options = RewriteOptions {
            rewrite_level: RewriteLevel::PassThrough,
            enabled_filters: filters.iter().copied().collect::<BTreeSet<_>>(),
            ..Default::default()
        };
        ServerContext::builder(options, Arc::new(MockUrlFetcher::new()))
            .build()
            .unwrap()
    }

    async fn rewrite(server: &Arc<ServerContext>, url: &str, chunks: &[&[u8]]) -> String {
        let mut driver = RewriteDriver::new(server.clone(), StringWriter::default());
        driver.start_parse(Url::parse(url).unwrap()).await.unwrap();
        for chunk in chunks {
            driver.parse_text(chunk).await.unwrap();
        }
        driver.finish_parse().await.unwrap();
        driver.writer().text()
    }

    #[test(tokio::test)]
    async fn passthrough_without_filters() {
        let server = server(&[]);
        let html = "<html><body><P>Unclosed <b>markup</i></body>";
        assert_eq!(
            rewrite(&server, "http://example.com/", &[html.as_bytes()]).await,
            html
        );
    }

    #[test(tokio::test)]
    async fn output_identical_without_changes() {
        let server = server(&[Filter::AddIds]);
        let html = "<!DOCTYPE html>\n<html><head><title>a < b</title></head><body class=x>\
            <p>Text<br/>more</p><!-- comment --><script>if (a</b) {}</script></body></html>";
        assert_eq!(
            rewrite(&server, "http://example.com/", &[html.as_bytes()]).await,
            html
        );
    }

    #[test(tokio::test)]
    async fn chunks_split_anywhere() {
        let server = server(&[Filter::AddIds]);
        let html = "<p title=\"äöü\">Grüße</p>";
        let bytes = html.as_bytes();
        let chunks = bytes.chunks(1).collect::<Vec<_>>();
        assert_eq!(rewrite(&server, "http://example.com/", &chunks).await, html);
    }

    #[test(tokio::test)]
    async fn disabled_by_query_parameter() {
        let server = server(&[Filter::AddIds]);
        let html = "<div>x</div>";
        assert_eq!(
            rewrite(&server, "http://example.com/?PageSpeed=off", &[html.as_bytes()]).await,
            html
        );
        assert_eq!(
            rewrite(&server, "http://example.com/", &[html.as_bytes()]).await,
            "<div id=\"PageSpeed-0\">x</div>"
        );
    }

    #[test(tokio::test)]
    async fn no_transform_respected() {
        let server = server(&[Filter::AddIds]);
        let mut driver = RewriteDriver::new(server.clone(), StringWriter::default());
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-transform"),
        );
        driver.set_response_headers(ResponseHeaders::from_headers(StatusCode::OK, headers));
        driver
            .start_parse(Url::parse("http://example.com/").unwrap())
            .await
            .unwrap();
        driver.parse_text(b"<div>x</div>").await.unwrap();
        driver.finish_parse().await.unwrap();
        assert_eq!(driver.writer().text(), "<div>x</div>");
    }

    #[test(tokio::test)]
    async fn misuse_reported() {
        let server = server(&[]);
        let mut driver = RewriteDriver::new(server, StringWriter::default());
        assert!(driver.parse_text(b"x").await.is_err());
        assert!(driver.flush().await.is_err());
        driver
            .start_parse(Url::parse("http://example.com/").unwrap())
            .await
            .unwrap();
        assert!(driver
            .start_parse(Url::parse("http://example.com/").unwrap())
            .await
            .is_err());
        driver.finish_parse().await.unwrap();
        assert!(driver.finish_parse().await.is_err());

        driver.clear();
        driver
            .start_parse(Url::parse("http://example.com/").unwrap())
            .await
            .unwrap();
    }

    #[test(tokio::test)]
    async fn flush_writes_complete_parts() {
        let server = server(&[Filter::AddIds]);
        let mut driver = RewriteDriver::new(server, StringWriter::default());
        driver
            .start_parse(Url::parse("http://example.com/").unwrap())
            .await
            .unwrap();
        driver.parse_text(b"<html><body><p>one</p><p>tw").await.unwrap();
        driver.flush().await.unwrap();
        assert_eq!(driver.writer().text(), "<html><body><p>one</p><p>tw");
        assert!(driver.writer().headers_written());
        driver.parse_text(b"o</p></body></html>").await.unwrap();
        driver.finish_parse().await.unwrap();
        assert_eq!(
            driver.writer().text(),
            "<html><body><p>one</p><p>two</p></body></html>"
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn cancelled_rewrite_keeps_original() {
        let script = "var a = 1;  // comment\n";
        let fetcher = Arc::new(MockUrlFetcher::new());
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/javascript"),
        );
        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=300"),
        );
        fetcher.add_response("http://example.com/a.js", StatusCode::OK, headers, script);
        let options = RewriteOptions {
            rewrite_level: RewriteLevel::PassThrough,
            enabled_filters: [Filter::RewriteJavascript].into_iter().collect(),
            ..Default::default()
        };
        let server = ServerContext::builder(options, fetcher).build().unwrap();

        let html = "<script src=a.js></script>";
        let mut driver = RewriteDriver::new(server.clone(), StringWriter::default());
        driver
            .start_parse(Url::parse("http://example.com/").unwrap())
            .await
            .unwrap();
        driver.parse_text(html.as_bytes()).await.unwrap();
        let state = driver.state.as_mut().unwrap();
        assert!(state.cancel(0, "testing"));
        assert!(!state.cancel(0, "testing"));
        driver.finish_parse().await.unwrap();
        assert_eq!(driver.writer().text(), html);
        assert_eq!(server.statistics().get(Stat::RewritesCancelled), 1);
        assert_eq!(server.statistics().get(Stat::RewritesAbandoned), 0);

        // The rewrite still completed and is used next time
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            rewrite(&server, "http://example.com/", &[html.as_bytes()]).await,
            format!(
                "<script src=\"a.js.pagespeed.jm.{}.js\"></script>",
                crate::hasher::hash_bytes(crate::js::minify(script).as_bytes())
            )
        );
    }

    #[test(tokio::test)]
    async fn events_stop_after_write_failure() {
        let server = server(&[Filter::AddIds]);
        let mut driver = RewriteDriver::new(server, StringWriter::failing());
        driver
            .start_parse(Url::parse("http://example.com/").unwrap())
            .await
            .unwrap();
        let events = Arc::new(AtomicUsize::new(0));
        driver.filters.push(Box::new(CountingFilter(events.clone())));

        driver.parse_text(b"<div>x</div>").await.unwrap();
        assert_eq!(events.load(Ordering::Relaxed), 2);
        assert!(matches!(driver.flush().await, Err(Error::Io(_))));

        driver.parse_text(b"<div>y</div><p>open").await.unwrap();
        driver.finish_parse().await.unwrap();
        assert_eq!(events.load(Ordering::Relaxed), 2);
        assert_eq!(driver.writer().text(), "");
    }

    #[test(tokio::test(start_paused = true))]
    async fn disabled_slot_keeps_original_image() {
        let fetcher = Arc::new(MockUrlFetcher::new());
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("image/gif"),
        );
        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=300"),
        );
        fetcher.add_response(
            "http://example.com/small.gif",
            StatusCode::OK,
            headers,
            gif_image(10, 10, 1, 100),
        );
        let options = RewriteOptions {
            rewrite_level: RewriteLevel::PassThrough,
            enabled_filters: [Filter::InlineImages, Filter::RecompressImages]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let server = ServerContext::builder(options, fetcher)
            .image_optimizer(Arc::new(TestImageOptimizer::new()))
            .build()
            .unwrap();

        let html = "<img src=small.gif>";
        let mut driver = RewriteDriver::new(server.clone(), StringWriter::default());
        driver
            .start_parse(Url::parse("http://example.com/").unwrap())
            .await
            .unwrap();
        driver.parse_text(html.as_bytes()).await.unwrap();
        let state = driver.state.as_mut().unwrap();
        assert_eq!(state.pending.len(), 1);
        state.pending[0].slots[0].disable_rendering();
        driver.finish_parse().await.unwrap();
        assert_eq!(driver.writer().text(), html);

        // Same rewrite without the slot disabled
        let output = rewrite(&server, "http://example.com/", &[html.as_bytes()]).await;
        assert!(output.starts_with("<img src=\"data:image/"), "{output}");
    }
}
