//! Typed markup tree over a content document.
//!
//! Content documents are parsed into an arena of nodes. Extraction and application work
//! against the [`MarkupTree`] capability trait, so they never depend on how the tree is
//! stored or which parser produced it.

use std::borrow::Cow;

use anyhow::{anyhow, Context};
use once_cell::sync::Lazy;
use regex::Regex;

use super::xml::{
    local_name, parse_fragment_events, parse_xml_events, write_end, write_event,
    write_start_like, XmlEvent,
};

static XML_DECL_ENCODING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*<\?xml[^>]*encoding\s*=\s*["']([A-Za-z0-9._:-]+)["']"#).expect("decl enc")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// A set of element local names, compared case-insensitively.
#[derive(Clone, Debug)]
pub struct TagSet {
    names: Vec<&'static str>,
}

impl TagSet {
    pub fn new(names: &[&'static str]) -> Self {
        Self {
            names: names.to_vec(),
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(tag))
    }
}

/// What the block extractor and applier need from a markup tree.
pub trait MarkupTree {
    fn root(&self) -> NodeId;

    /// Element and text children, in document order.
    fn children(&self, node: NodeId) -> Vec<NodeId>;

    /// Lower-cased local element name, `None` for non-element nodes.
    fn tag_name(&self, node: NodeId) -> Option<Cow<'_, str>>;

    fn matches(&self, node: NodeId, tags: &TagSet) -> bool {
        self.tag_name(node)
            .map(|name| tags.contains(&name))
            .unwrap_or(false)
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<&str>;

    /// Concatenated character data of all descendant text nodes.
    fn text_content(&self, node: NodeId) -> String;

    /// Replace the node's children with the parsed `markup`.
    fn set_content(&mut self, node: NodeId, markup: &str) -> anyhow::Result<()>;

    /// Insert `markup` as the following sibling(s) of `node`; returns the first inserted node.
    fn insert_after(&mut self, node: NodeId, markup: &str) -> anyhow::Result<NodeId>;

    /// Append `markup` as the last child(ren) of `node`; returns the first inserted node.
    fn append_child(&mut self, node: NodeId, markup: &str) -> anyhow::Result<NodeId>;

    /// All descendants of `node` in document (pre-)order, excluding `node` itself.
    fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(node).into_iter().rev().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).into_iter().rev());
        }
        out
    }

    fn parent(&self, node: NodeId) -> Option<NodeId>;
}

#[derive(Clone, Debug)]
enum NodeData {
    Root,
    Element {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Text(String),
    /// Declarations, comments, CDATA, processing instructions and doctypes: kept verbatim.
    Opaque(XmlEvent),
}

#[derive(Clone, Debug)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: NodeData,
}

/// One parsed content document. Detached nodes stay in the arena but are never reachable
/// from the root again.
#[derive(Clone, Debug)]
pub struct Document {
    name: String,
    nodes: Vec<Node>,
}

impl Document {
    /// Decode and parse one archive entry.
    pub fn parse(name: &str, bytes: &[u8]) -> anyhow::Result<Self> {
        let (text, transcoded) = decode_markup(bytes);
        let events = parse_xml_events(&text).with_context(|| format!("parse xml: {name}"))?;
        let mut doc = Self {
            name: name.to_string(),
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                data: NodeData::Root,
            }],
        };
        let root = doc.root();
        doc.graft(root, None, events)
            .with_context(|| format!("build tree: {name}"))?;
        if transcoded {
            doc.mark_utf8();
        }
        Ok(doc)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialize the whole document back to UTF-8 bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        for child in &self.node(self.root()).children {
            self.write_node(&mut out, *child)?;
        }
        Ok(out)
    }

    /// Serialized children of `node`.
    pub fn inner_markup(&self, node: NodeId) -> anyhow::Result<String> {
        let mut out = Vec::new();
        for child in &self.node(node).children {
            self.write_node(&mut out, *child)?;
        }
        String::from_utf8(out).context("inner markup utf8")
    }

    /// First element with the given local name, in document order.
    pub fn find_first(&self, tag: &str) -> Option<NodeId> {
        self.descendants(self.root()).into_iter().find(|n| {
            self.tag_name(*n)
                .map(|t| t.eq_ignore_ascii_case(tag))
                .unwrap_or(false)
        })
    }

    /// Body inner markup for inline preview; falls back to the whole document.
    pub fn body_markup(&self) -> anyhow::Result<String> {
        match self.find_first("body") {
            Some(body) => self.inner_markup(body),
            None => self.inner_markup(self.root()),
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    fn push_node(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            data,
        });
        id
    }

    /// Build nodes from `events` under `parent`, inserting top-level results at `at`
    /// (or appending when `None`). Returns the top-level nodes created.
    fn graft(
        &mut self,
        parent: NodeId,
        at: Option<usize>,
        events: Vec<XmlEvent>,
    ) -> anyhow::Result<Vec<NodeId>> {
        let mut top: Vec<NodeId> = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        for ev in events {
            let cur = stack.last().copied().unwrap_or(parent);
            let created = match ev {
                XmlEvent::Start { name, attrs } => {
                    let id = self.push_node(
                        cur,
                        NodeData::Element {
                            name,
                            attrs,
                            self_closing: false,
                        },
                    );
                    Some((id, true))
                }
                XmlEvent::End { name } => {
                    let open = stack
                        .pop()
                        .ok_or_else(|| anyhow!("unbalanced end tag </{name}>"))?;
                    if let NodeData::Element { name: open_name, .. } = &self.node(open).data {
                        if open_name != &name {
                            return Err(anyhow!("mismatched end tag </{name}> for <{open_name}>"));
                        }
                    }
                    None
                }
                XmlEvent::Empty { name, attrs } => {
                    let id = self.push_node(
                        cur,
                        NodeData::Element {
                            name,
                            attrs,
                            self_closing: true,
                        },
                    );
                    Some((id, false))
                }
                XmlEvent::Text { text } => Some((self.push_node(cur, NodeData::Text(text)), false)),
                other => Some((self.push_node(cur, NodeData::Opaque(other)), false)),
            };
            if let Some((id, opens)) = created {
                if stack.is_empty() {
                    top.push(id);
                } else {
                    self.node_mut(cur).children.push(id);
                }
                if opens {
                    stack.push(id);
                }
            }
        }
        if let Some(open) = stack.last() {
            return Err(anyhow!("unclosed element {:?}", self.tag_name(*open)));
        }
        let siblings = &mut self.node_mut(parent).children;
        let pos = at.unwrap_or(siblings.len()).min(siblings.len());
        siblings.splice(pos..pos, top.iter().copied());
        Ok(top)
    }

    fn detach_children(&mut self, node: NodeId) {
        let children = std::mem::take(&mut self.node_mut(node).children);
        for child in children {
            self.node_mut(child).parent = None;
        }
    }

    fn mark_utf8(&mut self) {
        let root = self.root();
        for child in self.node(root).children.clone() {
            if let NodeData::Opaque(XmlEvent::Decl { encoding, .. }) = &mut self.node_mut(child).data {
                *encoding = Some("UTF-8".to_string());
            }
        }
    }

    fn write_node(&self, out: &mut Vec<u8>, id: NodeId) -> anyhow::Result<()> {
        let node = self.node(id);
        match &node.data {
            NodeData::Root => {
                for child in &node.children {
                    self.write_node(out, *child)?;
                }
            }
            NodeData::Element {
                name,
                attrs,
                self_closing,
            } => {
                if *self_closing && node.children.is_empty() {
                    write_start_like(out, name, attrs, true);
                } else {
                    write_start_like(out, name, attrs, false);
                    for child in &node.children {
                        self.write_node(out, *child)?;
                    }
                    write_end(out, name);
                }
            }
            NodeData::Text(text) => write_event(
                out,
                &XmlEvent::Text {
                    text: text.clone(),
                },
            )?,
            NodeData::Opaque(ev) => write_event(out, ev)?,
        }
        Ok(())
    }
}

impl MarkupTree for Document {
    fn root(&self) -> NodeId {
        NodeId(0)
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.node(node).children.clone()
    }

    fn tag_name(&self, node: NodeId) -> Option<Cow<'_, str>> {
        match &self.node(node).data {
            NodeData::Element { name, .. } => {
                let local = local_name(name);
                if local.bytes().any(|b| b.is_ascii_uppercase()) {
                    Some(Cow::Owned(local.to_ascii_lowercase()))
                } else {
                    Some(Cow::Borrowed(local))
                }
            }
            _ => None,
        }
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.node(node).data {
            NodeData::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        if let NodeData::Text(t) = &self.node(node).data {
            out.push_str(t);
        }
        for d in self.descendants(node) {
            match &self.node(d).data {
                NodeData::Text(t) => out.push_str(t),
                NodeData::Opaque(XmlEvent::CData { text }) => out.push_str(text),
                _ => {}
            }
        }
        out
    }

    fn set_content(&mut self, node: NodeId, markup: &str) -> anyhow::Result<()> {
        let events = parse_fragment_events(markup)?;
        self.detach_children(node);
        self.graft(node, None, events)?;
        Ok(())
    }

    fn insert_after(&mut self, node: NodeId, markup: &str) -> anyhow::Result<NodeId> {
        let parent = self
            .node(node)
            .parent
            .ok_or_else(|| anyhow!("cannot insert after a detached or root node"))?;
        let pos = self
            .node(parent)
            .children
            .iter()
            .position(|c| *c == node)
            .ok_or_else(|| anyhow!("node missing from its parent"))?;
        let events = parse_fragment_events(markup)?;
        let top = self.graft(parent, Some(pos + 1), events)?;
        top.first()
            .copied()
            .ok_or_else(|| anyhow!("empty markup inserted"))
    }

    fn append_child(&mut self, node: NodeId, markup: &str) -> anyhow::Result<NodeId> {
        let events = parse_fragment_events(markup)?;
        let top = self.graft(node, None, events)?;
        top.first()
            .copied()
            .ok_or_else(|| anyhow!("empty markup appended"))
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).parent
    }
}

/// Decode entry bytes to text. Returns whether the input was not UTF-8 (so the declaration
/// must be rewritten on output).
fn decode_markup(bytes: &[u8]) -> (Cow<'_, str>, bool) {
    let bytes = strip_bom(bytes);
    if let Ok(s) = std::str::from_utf8(bytes) {
        return (Cow::Borrowed(s), false);
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]).into_owned();
    let encoding = XML_DECL_ENCODING_RE
        .captures(&head)
        .and_then(|c| encoding_rs::Encoding::for_label(c[1].as_bytes()))
        .unwrap_or(encoding_rs::WINDOWS_1252);
    let (text, _, _) = encoding.decode(bytes);
    (Cow::Owned(text.into_owned()), true)
}

pub fn strip_bom(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &data[3..]
    } else {
        data
    }
}
