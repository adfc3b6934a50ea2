use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::chunk::Chunk;
use super::extract::{Block, BlockKind, TRANSLATION_ATTR, TRANSLATION_CLASS};
use super::tree::MarkupTree;
use crate::textutil::{escape_attr, escape_text, strip_markup};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationMode {
    /// Overwrite each block's content with its translation.
    Replace,
    /// Keep the original and insert the translation next to it.
    #[default]
    Bilingual,
}

impl TranslationMode {
    pub fn parse(s: Option<&str>) -> Self {
        match s.unwrap_or("bilingual").trim().to_ascii_lowercase().as_str() {
            "replace" => Self::Replace,
            _ => Self::Bilingual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Bilingual => "bilingual",
        }
    }
}

/// What happened when a result array was applied to a chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub expected: usize,
    pub received: usize,
}

impl ApplyOutcome {
    pub fn is_count_mismatch(&self) -> bool {
        self.expected != self.received
    }
}

/// Write `result` back into `doc`, positionally: `result[i]` belongs to `chunk.blocks[i]`.
///
/// Positions past the end of `result` count as empty translations; extra entries are
/// ignored. Either way the mismatch is reported in the outcome.
pub fn apply_chunk<T: MarkupTree>(
    doc: &mut T,
    chunk: &Chunk,
    result: &[String],
    mode: TranslationMode,
) -> anyhow::Result<ApplyOutcome> {
    for (i, block) in chunk.blocks.iter().enumerate() {
        let translated = result.get(i).map(|s| strip_markup(s)).unwrap_or_default();
        match mode {
            TranslationMode::Replace => {
                doc.set_content(block.node, &escape_text(&translated))
                    .with_context(|| format!("replace <{}> block {i}", block.tag))?;
            }
            TranslationMode::Bilingual => {
                if translated.is_empty() {
                    continue;
                }
                insert_translation(doc, block, &translated)
                    .with_context(|| format!("insert translation for <{}> block {i}", block.tag))?;
            }
        }
    }
    Ok(ApplyOutcome {
        expected: chunk.len(),
        received: result.len(),
    })
}

/// Place a marked translation node according to the block's kind.
///
/// List items and quotations get the translation inside them, so list numbering and
/// quotation styling stay intact; headings and paragraphs get a following sibling.
fn insert_translation<T: MarkupTree>(
    doc: &mut T,
    block: &Block,
    translated: &str,
) -> anyhow::Result<()> {
    match block.kind {
        BlockKind::ListItem | BlockKind::Quotation => {
            doc.append_child(block.node, &translation_markup("div", translated))?;
        }
        BlockKind::Heading | BlockKind::Paragraph => {
            let tag = if block.tag.is_empty() { "p" } else { block.tag.as_str() };
            doc.insert_after(block.node, &translation_markup(tag, translated))?;
        }
    }
    Ok(())
}

fn translation_markup(tag: &str, translated: &str) -> String {
    format!(
        r#"<{tag} class="{}" {}="true">{}</{tag}>"#,
        escape_attr(TRANSLATION_CLASS),
        TRANSLATION_ATTR,
        escape_text(translated)
    )
}
