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

//! Places in the document where rewritten URLs go

use crate::html::{Document, NodeId};

/// Where a slot is located
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlotLocation {
    /// An attribute containing a single URL
    Attribute {
        /// The element
        node: NodeId,
        /// Attribute name, lowercase
        attribute: String,
    },
    /// One candidate of a `srcset` attribute
    SrcsetCandidate {
        /// The element
        node: NodeId,
        /// Attribute name, lowercase
        attribute: String,
        /// Position of the candidate
        index: usize,
    },
}

/// A reference to a resource in the document, rendered once the rewrite completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Slot {
    location: SlotLocation,
    disabled: bool,
}

/// Splits a `srcset` attribute into URLs and descriptors, following the HTML parsing rules.
/// URLs are kept as they are, so commas inside a URL (e.g. `data:` URLs) don’t split candidates.
pub(crate) fn parse_srcset(value: &str) -> Vec<(String, String)> {
    let is_space = |c: char| c.is_ascii_whitespace();
    let mut candidates = Vec::new();
    let mut rest = value;
    loop {
        rest = rest.trim_start_matches(|c: char| is_space(c) || c == ',');
        if rest.is_empty() {
            break;
        }

        let url_end = rest.find(is_space).unwrap_or(rest.len());
        let (url, remainder) = rest.split_at(url_end);
        rest = remainder;

        // Trailing commas end the candidate without descriptors
        let trimmed = url.trim_end_matches(',');
        if trimmed.len() != url.len() {
            if !trimmed.is_empty() {
                candidates.push((trimmed.to_owned(), String::new()));
            }
            continue;
        }

        let mut depth = 0usize;
        let descriptor_end = rest
            .char_indices()
            .find(|&(_, c)| match c {
                '(' => {
                    depth += 1;
                    false
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    false
                }
                ',' => depth == 0,
                _ => false,
            })
            .map_or(rest.len(), |(index, _)| index);
        let (descriptor, remainder) = rest.split_at(descriptor_end);
        rest = remainder;
        candidates.push((url.to_owned(), descriptor.trim().to_owned()));
    }
    candidates
}

/// Produces a `srcset` attribute value from URLs and descriptors.
pub(crate) fn serialize_srcset(candidates: &[(String, String)]) -> String {
    candidates
        .iter()
        .map(|(url, descriptor)| {
            if descriptor.is_empty() {
                url.clone()
            } else {
                format!("{url} {descriptor}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl Slot {
    /// A slot for an attribute value.
    pub(crate) fn attribute(node: NodeId, attribute: &str) -> Self {
        Self {
            location: SlotLocation::Attribute {
                node,
                attribute: attribute.to_ascii_lowercase(),
            },
            disabled: false,
        }
    }

    /// A slot for one `srcset` candidate.
    pub(crate) fn srcset_candidate(node: NodeId, attribute: &str, index: usize) -> Self {
        Self {
            location: SlotLocation::SrcsetCandidate {
                node,
                attribute: attribute.to_ascii_lowercase(),
                index,
            },
            disabled: false,
        }
    }

    pub(crate) fn location(&self) -> &SlotLocation {
        &self.location
    }

    /// The element containing the slot
    pub(crate) fn node(&self) -> NodeId {
        match &self.location {
            SlotLocation::Attribute { node, .. } | SlotLocation::SrcsetCandidate { node, .. } => {
                *node
            }
        }
    }

    /// Keeps the original reference, e.g. because another filter replaced the element.
    pub(crate) fn disable_rendering(&mut self) {
        self.disabled = true;
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Writes a new reference into the document. Returns `false` if the slot is disabled or
    /// its element is gone.
    pub(crate) fn render(&self, doc: &mut Document, value: &str) -> bool {
        if self.disabled || !doc.is_attached(self.node()) {
            return false;
        }
        match &self.location {
            SlotLocation::Attribute { node, attribute } => {
                doc.set_attribute(*node, attribute, value)
            }
            SlotLocation::SrcsetCandidate {
                node,
                attribute,
                index,
            } => {
                let Some(current) = doc.attribute(*node, attribute) else {
                    return false;
                };
                let mut candidates = parse_srcset(&current);
                let Some(candidate) = candidates.get_mut(*index) else {
                    return false;
                };
                value.clone_into(&mut candidate.0);
                let serialized = serialize_srcset(&candidates);
                doc.set_attribute(*node, attribute, &serialized)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html::NodeKind;

    #[test]
    fn attribute_slot() {
        let mut doc = Document::new();
        let img = doc.push_node(NodeKind::element("img", &[("src", "a.png")]));
        let slot = Slot::attribute(img, "SRC");
        assert_eq!(slot.node(), img);
        assert!(slot.render(&mut doc, "b.png"));
        assert_eq!(doc.attribute(img, "src").as_deref(), Some("b.png"));

        let mut disabled = slot.clone();
        disabled.disable_rendering();
        assert!(!disabled.render(&mut doc, "c.png"));
        assert_eq!(doc.attribute(img, "src").as_deref(), Some("b.png"));
    }

    #[test]
    fn srcset_slot() {
        let mut doc = Document::new();
        let img = doc.push_node(NodeKind::element(
            "img",
            &[("srcset", "a.png 1x,b.png   2x, c.png")],
        ));
        assert!(Slot::srcset_candidate(img, "srcset", 1).render(&mut doc, "B.png"));
        assert_eq!(
            doc.attribute(img, "srcset").as_deref(),
            Some("a.png 1x, B.png 2x, c.png")
        );
        assert!(!Slot::srcset_candidate(img, "srcset", 5).render(&mut doc, "x.png"));
    }

    #[test]
    fn srcset_parsing() {
        assert_eq!(
            parse_srcset(" a.png 100w , b.png"),
            vec![
                ("a.png".to_owned(), "100w".to_owned()),
                ("b.png".to_owned(), String::new())
            ]
        );
        assert_eq!(
            parse_srcset("data:image/png;base64,AAAA 1x, b.png 2x"),
            vec![
                ("data:image/png;base64,AAAA".to_owned(), "1x".to_owned()),
                ("b.png".to_owned(), "2x".to_owned())
            ]
        );
        assert_eq!(
            parse_srcset("a.png, b.png 2x,,c.png (x, y) 3x"),
            vec![
                ("a.png".to_owned(), String::new()),
                ("b.png".to_owned(), "2x".to_owned()),
                ("c.png".to_owned(), "(x, y) 3x".to_owned())
            ]
        );
        assert!(parse_srcset(" , ").is_empty());
    }

    #[test]
    fn srcset_slot_keeps_data_urls() {
        let mut doc = Document::new();
        let img = doc.push_node(NodeKind::element(
            "img",
            &[("srcset", "data:image/png;base64,AAAA 1x, b.png 2x")],
        ));
        assert!(Slot::srcset_candidate(img, "srcset", 1).render(&mut doc, "B.png"));
        assert_eq!(
            doc.attribute(img, "srcset").as_deref(),
            Some("data:image/png;base64,AAAA 1x, B.png 2x")
        );
    }
}
