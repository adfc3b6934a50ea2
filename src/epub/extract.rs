use once_cell::sync::Lazy;
use serde::Serialize;

use super::tree::{MarkupTree, NodeId, TagSet};
use crate::textutil::{char_len, normalize_text};

/// Class carried by every translation node this crate inserts.
pub const TRANSLATION_CLASS: &str = "epub-translator-text";
/// Attribute carried by every translation node this crate inserts.
pub const TRANSLATION_ATTR: &str = "data-epub-translator";

pub static TRANSLATABLE_TAGS: Lazy<TagSet> = Lazy::new(|| {
    TagSet::new(&[
        "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "li", "dt", "dd", "blockquote",
    ])
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading,
    ListItem,
    Quotation,
}

impl BlockKind {
    pub fn classify(tag: &str) -> Self {
        match tag {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => Self::Heading,
            "li" | "dt" | "dd" => Self::ListItem,
            "blockquote" => Self::Quotation,
            _ => Self::Paragraph,
        }
    }
}

/// One leaf translatable node and its normalized text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub node: NodeId,
    pub kind: BlockKind,
    pub tag: String,
    pub text: String,
}

impl Block {
    pub fn char_len(&self) -> usize {
        char_len(&self.text)
    }
}

/// Leaf translatable blocks of `doc`, in document order, with empty ones dropped.
///
/// Selection is two-pass: first every node matching the tag set, then only those with no
/// matching descendant. A single pass over a broad set like `div`/`p` would also pick up
/// containers and send their children's text twice.
pub fn extract_blocks<T: MarkupTree>(doc: &T) -> Vec<Block> {
    extract_blocks_with(doc, &TRANSLATABLE_TAGS)
}

pub fn extract_blocks_with<T: MarkupTree>(doc: &T, tags: &TagSet) -> Vec<Block> {
    let candidates: Vec<NodeId> = doc
        .descendants(doc.root())
        .into_iter()
        .filter(|n| doc.matches(*n, tags))
        .collect();

    let mut blocks = Vec::new();
    for node in candidates {
        if is_translation_artifact(doc, node) || has_artifact_ancestor(doc, node) {
            continue;
        }
        if doc.descendants(node).iter().any(|d| doc.matches(*d, tags)) {
            continue;
        }
        let text = normalize_text(&doc.text_content(node));
        if text.is_empty() {
            continue;
        }
        let tag = doc
            .tag_name(node)
            .map(|t| t.into_owned())
            .unwrap_or_default();
        blocks.push(Block {
            node,
            kind: BlockKind::classify(&tag),
            tag,
            text,
        });
    }
    blocks
}

pub fn is_translation_artifact<T: MarkupTree>(doc: &T, node: NodeId) -> bool {
    if doc.attribute(node, TRANSLATION_ATTR).is_some() {
        return true;
    }
    doc.attribute(node, "class")
        .map(|c| c.split_ascii_whitespace().any(|c| c == TRANSLATION_CLASS))
        .unwrap_or(false)
}

fn has_artifact_ancestor<T: MarkupTree>(doc: &T, node: NodeId) -> bool {
    let mut cur = doc.parent(node);
    while let Some(p) = cur {
        if is_translation_artifact(doc, p) {
            return true;
        }
        cur = doc.parent(p);
    }
    false
}
