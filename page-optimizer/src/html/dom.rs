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

//! The not yet flushed part of an HTML document
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Closed subtrees are serialized and
//! dropped on [`Document::flush`], open elements stay in the tree until their end tag arrives.
//! Once a node is flushed its id no longer resolves.

use super::lexer::{Attribute, QuoteStyle};
use super::{escape_attribute, is_void_element, unescape};

use std::borrow::Cow;
use std::collections::HashMap;

/// Identifier of a document node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

const ROOT: NodeId = NodeId(0);

/// How an element was or will be closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStyle {
    /// With an end tag
    Explicit,
    /// By another tag or the end of the document, no end tag is written
    Implicit,
    /// Void element, no end tag
    Void,
    /// `<tag/>` syntax
    SelfClosing,
}

/// An element node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    source_name: String,
    attributes: Vec<Attribute>,
    close_style: CloseStyle,
    end_name: Option<String>,
    start_flushed: bool,
}

impl Element {
    /// Creates an element with double-quoted attributes.
    pub fn new(name: &str, attributes: &[(&str, &str)]) -> Self {
        let name = name.to_ascii_lowercase();
        let close_style = if is_void_element(&name) {
            CloseStyle::Void
        } else {
            CloseStyle::Explicit
        };
        Self {
            source_name: name.clone(),
            name,
            attributes: attributes
                .iter()
                .map(|(name, value)| Attribute {
                    name: (*name).to_owned(),
                    value: Some(escape_attribute(value)),
                    quote: QuoteStyle::Double,
                })
                .collect(),
            close_style,
            end_name: None,
            start_flushed: false,
        }
    }

    /// Lowercase element name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attributes in document order
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// How the element is closed
    pub fn close_style(&self) -> CloseStyle {
        self.close_style
    }

    fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.is(name))
    }

    fn write_start_tag(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.source_name);
        for attribute in &self.attributes {
            attribute.serialize(out);
        }
        if self.close_style == CloseStyle::SelfClosing {
            out.push_str("/>");
        } else {
            out.push('>');
        }
    }

    fn write_end_tag(&self, out: &mut String) {
        if self.close_style == CloseStyle::Explicit {
            out.push_str("</");
            out.push_str(self.end_name.as_deref().unwrap_or(&self.source_name));
            out.push('>');
        }
    }
}

/// Node contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The document itself
    Root,
    /// An element
    Element(Box<Element>),
    /// Character data as it is written into the document
    Characters(String),
    /// A comment
    Comment(String),
    /// A CDATA section
    Cdata(String),
    /// A `<!DOCTYPE>` or processing instruction, contents between the angle brackets
    Directive(String),
}

impl NodeKind {
    /// Creates an element node with double-quoted attributes.
    pub fn element(name: &str, attributes: &[(&str, &str)]) -> Self {
        Self::Element(Box::new(Element::new(name, attributes)))
    }

    /// Creates a character node, `text` is inserted verbatim.
    pub fn characters(text: impl Into<String>) -> Self {
        Self::Characters(text.into())
    }
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Element names closing an open `<p>` implicitly
const CLOSES_P: &[&str] = &[
    "address",
    "article",
    "aside",
    "blockquote",
    "details",
    "div",
    "dl",
    "fieldset",
    "figure",
    "footer",
    "form",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "header",
    "hr",
    "main",
    "menu",
    "nav",
    "ol",
    "p",
    "pre",
    "section",
    "table",
    "ul",
];

fn closes_implicitly(open: &str, new: &str) -> bool {
    match open {
        "p" => CLOSES_P.contains(&new),
        "li" => new == "li",
        "option" => new == "option" || new == "optgroup",
        "optgroup" => new == "optgroup",
        "dt" | "dd" => new == "dt" || new == "dd",
        "td" | "th" => matches!(new, "td" | "th" | "tr" | "thead" | "tbody" | "tfoot"),
        "tr" => matches!(new, "tr" | "thead" | "tbody" | "tfoot"),
        "thead" | "tbody" | "tfoot" => matches!(new, "thead" | "tbody" | "tfoot"),
        _ => false,
    }
}

/// An HTML document under construction
#[derive(Debug)]
pub struct Document {
    nodes: HashMap<NodeId, Node>,
    open: Vec<NodeId>,
    next_id: usize,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            Node {
                kind: NodeKind::Root,
                parent: None,
                children: Vec::new(),
            },
        );
        Self {
            nodes,
            open: Vec::new(),
            next_id: 1,
        }
    }

    /// Drops all nodes.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// The document node
    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// Node contents
    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(&id).map(|node| &node.kind)
    }

    /// Element data if the node is an element
    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match self.kind(id)? {
            NodeKind::Element(element) => Some(element.as_ref()),
            _ => None,
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes.get_mut(&id)?.kind {
            NodeKind::Element(element) => Some(element.as_mut()),
            _ => None,
        }
    }

    /// Lowercase element name if the node is an element
    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(Element::name)
    }

    /// Checks whether the node is an element with the given lowercase name.
    pub fn is_element(&self, id: NodeId, name: &str) -> bool {
        self.name(id) == Some(name)
    }

    /// Parent of a node
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id)?.parent
    }

    /// Children of a node that weren’t flushed yet
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    /// Checks whether the node is still part of the document.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == ROOT {
                return true;
            }
            match self.nodes.get(&current).and_then(|node| node.parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Checks whether the start tag of an element was written out already. Changes to its
    /// name or attributes have no effect then.
    pub fn is_start_written(&self, id: NodeId) -> bool {
        self.element(id).is_some_and(|element| element.start_flushed)
    }

    /// Checks whether the element didn’t receive its end tag yet.
    pub fn is_open(&self, id: NodeId) -> bool {
        self.open.contains(&id)
    }

    /// Innermost open element or the document node
    pub fn current(&self) -> NodeId {
        self.open.last().copied().unwrap_or(ROOT)
    }

    /// Open elements, outermost first
    pub fn open_elements(&self) -> &[NodeId] {
        &self.open
    }

    /// Decoded attribute value. Attributes without a value produce an empty string.
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<Cow<'_, str>> {
        let attribute = self.element(id)?.attribute(name)?;
        Some(attribute.value.as_deref().map_or(Cow::Borrowed(""), unescape))
    }

    /// Checks whether an element has an attribute.
    pub fn has_attribute(&self, id: NodeId, name: &str) -> bool {
        self.element(id)
            .is_some_and(|element| element.attribute(name).is_some())
    }

    /// Sets an attribute, keeping its position if it exists already. The value is escaped and
    /// written in double quotes.
    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> bool {
        let Some(element) = self.element_mut(id) else {
            return false;
        };
        let value = Some(escape_attribute(value));
        if let Some(attribute) = element.attributes.iter_mut().find(|attr| attr.is(name)) {
            attribute.value = value;
            attribute.quote = QuoteStyle::Double;
        } else {
            element.attributes.push(Attribute {
                name: name.to_owned(),
                value,
                quote: QuoteStyle::Double,
            });
        }
        true
    }

    /// Removes an attribute, returns `false` if it wasn’t there.
    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> bool {
        let Some(element) = self.element_mut(id) else {
            return false;
        };
        let len = element.attributes.len();
        element.attributes.retain(|attr| !attr.is(name));
        element.attributes.len() != len
    }

    /// Changes the name of an element.
    pub fn rename_element(&mut self, id: NodeId, name: &str) -> bool {
        let Some(element) = self.element_mut(id) else {
            return false;
        };
        element.name = name.to_ascii_lowercase();
        element.source_name = name.to_owned();
        element.end_name = None;
        true
    }

    fn add_node(&mut self, kind: NodeKind, parent: NodeId) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                kind,
                parent: Some(parent),
                children: Vec::new(),
            },
        );
        id
    }

    /// Closes the open elements implicitly closed by the start tag of `name`, returns the
    /// elements closed, innermost first.
    pub fn close_implied_by(&mut self, name: &str) -> Vec<NodeId> {
        let name = name.to_ascii_lowercase();
        let mut closed = Vec::new();
        while let Some(&top) = self.open.last() {
            if !self
                .name(top)
                .is_some_and(|open| closes_implicitly(open, &name))
            {
                break;
            }
            self.open.pop();
            if let Some(element) = self.element_mut(top) {
                element.close_style = CloseStyle::Implicit;
            }
            closed.push(top);
        }
        closed
    }

    /// Adds an element from a start tag to the innermost open element. Void and self-closing
    /// elements are closed immediately, others become the innermost open element.
    pub fn push_element(
        &mut self,
        source_name: &str,
        attributes: Vec<Attribute>,
        self_closing: bool,
    ) -> NodeId {
        let name = source_name.to_ascii_lowercase();
        let close_style = if is_void_element(&name) {
            if self_closing {
                CloseStyle::SelfClosing
            } else {
                CloseStyle::Void
            }
        } else if self_closing && !super::is_raw_text_element(&name) {
            CloseStyle::SelfClosing
        } else {
            CloseStyle::Explicit
        };
        let element = Element {
            name,
            source_name: source_name.to_owned(),
            attributes,
            close_style,
            end_name: None,
            start_flushed: false,
        };
        let parent = self.current();
        let id = self.add_node(NodeKind::Element(Box::new(element)), parent);
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(id);
        }
        if close_style == CloseStyle::Explicit {
            self.open.push(id);
        }
        id
    }

    /// Processes an end tag. Returns the elements closed, innermost first, the last one being
    /// closed explicitly. Returns `None` if no element with this name is open.
    pub fn close_element(&mut self, source_name: &str) -> Option<Vec<NodeId>> {
        let name = source_name.to_ascii_lowercase();
        let index = self
            .open
            .iter()
            .rposition(|&id| self.name(id) == Some(name.as_str()))?;
        let mut closed = self.open.split_off(index);
        closed.reverse();
        for (i, &id) in closed.iter().enumerate() {
            let explicit = i + 1 == closed.len();
            if let Some(element) = self.element_mut(id) {
                if explicit {
                    element.end_name = Some(source_name.to_owned());
                } else {
                    element.close_style = CloseStyle::Implicit;
                }
            }
        }
        Some(closed)
    }

    /// Closes all open elements at the end of the document, innermost first.
    pub fn close_all(&mut self) -> Vec<NodeId> {
        let mut closed = std::mem::take(&mut self.open);
        closed.reverse();
        for &id in &closed {
            if let Some(element) = self.element_mut(id) {
                element.close_style = CloseStyle::Implicit;
            }
        }
        closed
    }

    /// Adds a non-element node to the innermost open element.
    pub fn push_node(&mut self, kind: NodeKind) -> NodeId {
        let parent = self.current();
        self.append_child(parent, kind).unwrap_or(ROOT)
    }

    /// Appends a node to the children of `parent`.
    pub fn append_child(&mut self, parent: NodeId, kind: NodeKind) -> Option<NodeId> {
        if !self.nodes.contains_key(&parent) {
            return None;
        }
        let id = self.add_node(kind, parent);
        self.nodes.get_mut(&parent)?.children.push(id);
        Some(id)
    }

    fn insert_at(&mut self, existing: NodeId, kind: NodeKind, offset: usize) -> Option<NodeId> {
        let parent = self.parent(existing)?;
        let index = self
            .children(parent)
            .iter()
            .position(|&child| child == existing)?;
        let id = self.add_node(kind, parent);
        self.nodes
            .get_mut(&parent)?
            .children
            .insert(index + offset, id);
        Some(id)
    }

    /// Inserts a node in front of an existing one.
    pub fn insert_before(&mut self, existing: NodeId, kind: NodeKind) -> Option<NodeId> {
        self.insert_at(existing, kind, 0)
    }

    /// Inserts a node after an existing one.
    pub fn insert_after(&mut self, existing: NodeId, kind: NodeKind) -> Option<NodeId> {
        self.insert_at(existing, kind, 1)
    }

    fn contains_open(&self, id: NodeId) -> bool {
        self.open
            .iter()
            .any(|&open| open == id || self.is_ancestor(id, open))
    }

    fn is_ancestor(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        while let Some(parent) = self.parent(id) {
            if parent == ancestor {
                return true;
            }
            id = parent;
        }
        false
    }

    fn drop_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                self.drop_subtree(child);
            }
        }
    }

    fn detach(&mut self, id: NodeId) -> Option<(NodeId, usize)> {
        let parent = self.parent(id)?;
        let siblings = &mut self.nodes.get_mut(&parent)?.children;
        let index = siblings.iter().position(|&child| child == id)?;
        siblings.remove(index);
        Some((parent, index))
    }

    /// Removes a node with its children. Open elements and their ancestors cannot be removed.
    pub fn delete_node(&mut self, id: NodeId) -> bool {
        if id == ROOT || self.contains_open(id) || self.detach(id).is_none() {
            return false;
        }
        self.drop_subtree(id);
        true
    }

    /// Replaces a closed node by a new one.
    pub fn replace_node(&mut self, id: NodeId, kind: NodeKind) -> Option<NodeId> {
        if id == ROOT || self.contains_open(id) {
            return None;
        }
        let (parent, index) = self.detach(id)?;
        self.drop_subtree(id);
        let new = self.add_node(kind, parent);
        self.nodes.get_mut(&parent)?.children.insert(index, new);
        Some(new)
    }

    /// Concatenated character data of the direct children.
    pub fn text_content(&self, id: NodeId) -> String {
        self.children(id)
            .iter()
            .filter_map(|&child| match self.kind(child) {
                Some(NodeKind::Characters(text)) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replaces the children of a closed element by a single character node.
    pub fn set_text_content(&mut self, id: NodeId, text: &str) -> bool {
        if self.element(id).is_none() || self.is_open(id) {
            return false;
        }
        let children = self
            .nodes
            .get_mut(&id)
            .map(|node| std::mem::take(&mut node.children))
            .unwrap_or_default();
        for child in children {
            self.drop_subtree(child);
        }
        self.append_child(id, NodeKind::characters(text)).is_some()
    }

    /// Replaces the contents of a character node.
    pub fn set_characters(&mut self, id: NodeId, text: &str) -> bool {
        match self.nodes.get_mut(&id).map(|node| &mut node.kind) {
            Some(NodeKind::Characters(existing)) => {
                text.clone_into(existing);
                true
            }
            _ => false,
        }
    }

    fn serialize(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        match &node.kind {
            NodeKind::Root => {}
            NodeKind::Element(element) => {
                if !element.start_flushed {
                    element.write_start_tag(out);
                }
            }
            NodeKind::Characters(text) => out.push_str(text),
            NodeKind::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeKind::Cdata(text) => {
                out.push_str("<![CDATA[");
                out.push_str(text);
                out.push_str("]]>");
            }
            NodeKind::Directive(text) => {
                out.push('<');
                out.push_str(text);
                out.push('>');
            }
        }
        for &child in &node.children {
            self.serialize(child, out);
        }
        if let NodeKind::Element(element) = &node.kind {
            element.write_end_tag(out);
        }
    }

    /// Serializes everything that can be written already: closed subtrees and the start tags of
    /// open elements. Closed subtrees are removed from the document.
    pub fn flush(&mut self) -> String {
        let mut out = String::new();
        let mut parent = ROOT;
        let mut level = 0;
        loop {
            let open_child = self.open.get(level).copied();
            let children = self
                .nodes
                .get_mut(&parent)
                .map(|node| std::mem::take(&mut node.children))
                .unwrap_or_default();

            let mut kept = Vec::new();
            for child in children {
                if !kept.is_empty() {
                    kept.push(child);
                } else if Some(child) == open_child {
                    if let Some(element) = self.element_mut(child) {
                        if !element.start_flushed {
                            element.write_start_tag(&mut out);
                            element.start_flushed = true;
                        }
                    }
                    kept.push(child);
                } else {
                    self.serialize(child, &mut out);
                    self.drop_subtree(child);
                }
            }
            if let Some(node) = self.nodes.get_mut(&parent) {
                node.children = kept;
            }

            match open_child {
                Some(child) => {
                    parent = child;
                    level += 1;
                }
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html::lexer::{Lexer, Token};

    /// Builds a document the way the driver does, without filters.
    fn build(doc: &mut Document, lexer: &mut Lexer, html: &str) {
        for (token, _) in lexer.feed(html) {
            apply(doc, token);
        }
    }

    fn apply(doc: &mut Document, token: Token) {
        match token {
            Token::StartTag {
                name,
                attributes,
                self_closing,
            } => {
                doc.close_implied_by(&name);
                doc.push_element(&name, attributes, self_closing);
            }
            Token::EndTag { name } => {
                if doc.close_element(&name).is_none() {
                    doc.push_node(NodeKind::characters(format!("</{name}>")));
                }
            }
            Token::Characters(text) => {
                doc.push_node(NodeKind::Characters(text));
            }
            Token::Comment(text) => {
                doc.push_node(NodeKind::Comment(text));
            }
            Token::Cdata(text) => {
                doc.push_node(NodeKind::Cdata(text));
            }
            Token::Directive(text) => {
                doc.push_node(NodeKind::Directive(text));
            }
        }
    }

    fn round_trip(html: &str) -> String {
        let mut doc = Document::new();
        let mut lexer = Lexer::new();
        build(&mut doc, &mut lexer, html);
        for (token, _) in lexer.finish() {
            apply(&mut doc, token);
        }
        doc.close_all();
        doc.flush()
    }

    #[test]
    fn serialization_preserved() {
        for html in [
            "<!DOCTYPE html><html><head><title>T</title></head>\
            <body class=x id='y' hidden></body></html>",
            "<ul><li>a<li>b</ul><p>one<p>two<div>three</div>",
            "<br/><img src=a.png><br></p><!-- c --><![CDATA[d]]>",
            "<table><tr><td>1<td>2<tr><td>3</table>",
            "<div><span>unclosed",
        ] {
            assert_eq!(round_trip(html), html);
        }
    }

    #[test]
    fn implicit_closes() {
        let mut doc = Document::new();
        let mut lexer = Lexer::new();
        build(&mut doc, &mut lexer, "<ul><li>a<li>b");
        let open = doc
            .open_elements()
            .iter()
            .map(|&id| doc.name(id).unwrap().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(open, vec!["ul", "li"]);
        let ul = doc.open_elements()[0];
        assert_eq!(doc.children(ul).len(), 2);
    }

    #[test]
    fn mutations() {
        let mut doc = Document::new();
        let mut lexer = Lexer::new();
        build(
            &mut doc,
            &mut lexer,
            "<div><img src='a.png' alt=\"x &amp; y\"><span>text</span>",
        );
        let div = doc.open_elements()[0];
        let img = doc.children(div)[0];
        let span = doc.children(div)[1];

        assert_eq!(doc.attribute(img, "ALT").unwrap(), "x & y");
        assert!(doc.set_attribute(img, "src", "b\".png"));
        assert!(doc.set_attribute(img, "width", "10"));
        assert!(doc.remove_attribute(img, "alt"));
        assert!(!doc.remove_attribute(img, "alt"));
        assert_eq!(doc.text_content(span), "text");

        doc.insert_before(img, NodeKind::Comment("before".to_owned()));
        doc.insert_after(span, NodeKind::element("hr", &[]));
        doc.rename_element(span, "b");
        assert!(!doc.delete_node(div));

        assert_eq!(
            doc.flush(),
            "<div><!--before--><img src=\"b&quot;.png\" width=\"10\"><b>text</b><hr>"
        );
        assert!(!doc.is_attached(img));
        assert!(doc.is_attached(div));

        let p = doc.append_child(div, NodeKind::element("p", &[])).unwrap();
        doc.set_text_content(p, "new");
        let replaced = doc.append_child(div, NodeKind::characters("x")).unwrap();
        doc.replace_node(replaced, NodeKind::characters("y"));
        doc.close_element("div");
        assert_eq!(doc.flush(), "<p>new</p>y</div>");
    }

    #[test]
    fn stray_end_tag() {
        assert_eq!(round_trip("a</b>c"), "a</b>c");
    }
}
