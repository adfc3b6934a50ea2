use super::extract::Block;

/// Per-block separator cost counted against the character budget (the blank line between
/// block texts in the request).
pub const BLOCK_SEPARATOR_CHARS: usize = 2;
pub const BLOCK_SEPARATOR: &str = "\n\n";

pub const DEFAULT_CHUNK_CHAR_BUDGET: usize = 4096;

/// Contiguous run of blocks sent to the generation service in one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub blocks: Vec<Block>,
    /// Sum of block text lengths plus one separator per block.
    pub char_count: usize,
}

impl Chunk {
    fn empty() -> Self {
        Self {
            blocks: Vec::new(),
            char_count: 0,
        }
    }

    fn push(&mut self, block: Block) {
        self.char_count += block.char_len() + BLOCK_SEPARATOR_CHARS;
        self.blocks.push(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.blocks.iter().map(|b| b.text.as_str()).collect()
    }

    /// Block texts joined by a blank line, as sent in the request.
    pub fn joined_text(&self) -> String {
        self.texts().join(BLOCK_SEPARATOR)
    }

    /// A singleton chunk whose one block already exceeds the budget on its own.
    pub fn is_oversized(&self, char_budget: usize) -> bool {
        self.char_count > char_budget
    }
}

/// Greedy left-to-right packing of `blocks` into chunks.
///
/// A block joins the open chunk while the running count stays within `char_budget` and
/// the chunk holds fewer than `max_blocks` (0 or `None` = unbounded). A block that alone
/// exceeds the budget becomes its own chunk. Single pass, no rebalancing.
pub fn chunk_blocks(blocks: &[Block], char_budget: usize, max_blocks: Option<usize>) -> Vec<Chunk> {
    let max_blocks = max_blocks.filter(|n| *n > 0);
    let mut chunks = Vec::new();
    let mut cur = Chunk::empty();

    for block in blocks {
        let cost = block.char_len() + BLOCK_SEPARATOR_CHARS;
        let over_budget = cur.char_count + cost > char_budget;
        let at_cap = max_blocks.map(|m| cur.len() >= m).unwrap_or(false);
        if !cur.is_empty() && (over_budget || at_cap) {
            chunks.push(std::mem::replace(&mut cur, Chunk::empty()));
        }
        cur.push(block.clone());
    }
    if !cur.is_empty() {
        chunks.push(cur);
    }
    chunks
}
