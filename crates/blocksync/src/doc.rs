//! Block-tree document model.
//!
//! A [`Document`] is an ordered sequence of top-level block ids (the order
//! list) plus a table of blocks. Every id in the order list exists in the
//! table; ids are never reused; table entries with no order-list reference are
//! considered deleted.

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Raw tag strings as they appear on the wire.
pub mod tags {
    pub const PARAGRAPH: &str = "paragraph";
    pub const HEADING1: &str = "heading1";
    pub const HEADING2: &str = "heading2";
    pub const HEADING3: &str = "heading3";
    pub const DIVIDER: &str = "divider";
    pub const ORDERED_LIST: &str = "ordered_list";
    pub const UNORDERED_LIST: &str = "unordered_list";
    pub const TODO_CHECKED: &str = "todo_checked";
    pub const TODO_UNCHECKED: &str = "todo_unchecked";
    pub const QUOTE: &str = "quote";
    pub const CODE: &str = "code";
    pub const TOGGLE: &str = "toggle";
    pub const FOREIGN: &str = "foreign";
}

pub type BlockId = String;

/// Structural kind of a block. Closed set; anything the decoder does not
/// recognize lands in `Unknown` and is carried through rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockTag {
    Paragraph,
    Heading1,
    Heading2,
    Heading3,
    Divider,
    OrderedListItem,
    UnorderedListItem,
    CheckedListItem,
    UncheckedListItem,
    Blockquote,
    Code,
    /// Container block holding nested children instead of a character run.
    Toggle,
    /// Opaque block owned by some other editor surface (embed, media, ...).
    /// The subtype is whatever metadata the wire carried.
    Foreign(Option<String>),
    Unknown(String),
}

impl BlockTag {
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            tags::PARAGRAPH => BlockTag::Paragraph,
            tags::HEADING1 => BlockTag::Heading1,
            tags::HEADING2 => BlockTag::Heading2,
            tags::HEADING3 => BlockTag::Heading3,
            tags::DIVIDER => BlockTag::Divider,
            tags::ORDERED_LIST => BlockTag::OrderedListItem,
            tags::UNORDERED_LIST => BlockTag::UnorderedListItem,
            tags::TODO_CHECKED => BlockTag::CheckedListItem,
            tags::TODO_UNCHECKED => BlockTag::UncheckedListItem,
            tags::QUOTE => BlockTag::Blockquote,
            tags::CODE => BlockTag::Code,
            tags::TOGGLE => BlockTag::Toggle,
            tags::FOREIGN => BlockTag::Foreign(None),
            other => BlockTag::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BlockTag::Paragraph => tags::PARAGRAPH,
            BlockTag::Heading1 => tags::HEADING1,
            BlockTag::Heading2 => tags::HEADING2,
            BlockTag::Heading3 => tags::HEADING3,
            BlockTag::Divider => tags::DIVIDER,
            BlockTag::OrderedListItem => tags::ORDERED_LIST,
            BlockTag::UnorderedListItem => tags::UNORDERED_LIST,
            BlockTag::CheckedListItem => tags::TODO_CHECKED,
            BlockTag::UncheckedListItem => tags::TODO_UNCHECKED,
            BlockTag::Blockquote => tags::QUOTE,
            BlockTag::Code => tags::CODE,
            BlockTag::Toggle => tags::TOGGLE,
            BlockTag::Foreign(_) => tags::FOREIGN,
            BlockTag::Unknown(raw) => raw,
        }
    }

    /// Container blocks hold child blocks instead of a character run.
    pub fn is_container(&self) -> bool {
        matches!(self, BlockTag::Toggle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
}

impl Alignment {
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "center" => Alignment::Center,
            "right" => Alignment::Right,
            _ => Alignment::Left,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Alignment::Left => "left",
            Alignment::Center => "center",
            Alignment::Right => "right",
        }
    }
}

/// Inline formatting attribute toggled by run tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineAttr {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Code,
    /// Attribute name this client does not model; preserved verbatim.
    Other(String),
}

impl InlineAttr {
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "bold" => InlineAttr::Bold,
            "italic" => InlineAttr::Italic,
            "underline" => InlineAttr::Underline,
            "strikethrough" => InlineAttr::Strikethrough,
            "code" => InlineAttr::Code,
            other => InlineAttr::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InlineAttr::Bold => "bold",
            InlineAttr::Italic => "italic",
            InlineAttr::Underline => "underline",
            InlineAttr::Strikethrough => "strikethrough",
            InlineAttr::Code => "code",
            InlineAttr::Other(raw) => raw,
        }
    }
}

/// One token of a character run: a literal character or a format toggle.
#[derive(Debug, Clone, PartialEq)]
pub enum RunToken {
    Char(char),
    Format { attr: InlineAttr, on: bool },
}

/// Contiguous text sharing one set of active attributes, outermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub text: String,
    pub attrs: Vec<InlineAttr>,
}

/// Ordered token sequence composing a block's text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterRun {
    tokens: Vec<RunToken>,
}

impl CharacterRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Self {
        let mut run = Self::new();
        run.push_str(text);
        run
    }

    pub fn tokens(&self) -> &[RunToken] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn push_token(&mut self, token: RunToken) {
        self.tokens.push(token);
    }

    pub(crate) fn insert_token(&mut self, index: usize, token: RunToken) {
        let index = index.min(self.tokens.len());
        self.tokens.insert(index, token);
    }

    pub fn push_char(&mut self, c: char) {
        self.tokens.push(RunToken::Char(c));
    }

    pub fn push_str(&mut self, text: &str) {
        for c in text.chars() {
            self.push_char(c);
        }
    }

    pub fn format_on(&mut self, attr: InlineAttr) {
        self.tokens.push(RunToken::Format { attr, on: true });
    }

    pub fn format_off(&mut self, attr: InlineAttr) {
        self.tokens.push(RunToken::Format { attr, on: false });
    }

    /// Literal characters with formatting stripped.
    pub fn plain_text(&self) -> String {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                RunToken::Char(c) => Some(*c),
                RunToken::Format { .. } => None,
            })
            .collect()
    }

    /// Reconstruct formatted spans by scanning left to right with an
    /// active-attribute stack. A literal appends to the open span; an
    /// attribute-on closes the open span and pushes the attribute; an
    /// attribute-off pops it. An "off" with no matching "on" is a no-op.
    pub fn spans(&self) -> Vec<Span> {
        let mut spans = Vec::new();
        let mut stack: Vec<InlineAttr> = Vec::new();
        let mut text = String::new();

        let flush = |spans: &mut Vec<Span>, stack: &[InlineAttr], text: &mut String| {
            if !text.is_empty() {
                spans.push(Span {
                    text: std::mem::take(text),
                    attrs: stack.to_vec(),
                });
            }
        };

        for token in &self.tokens {
            match token {
                RunToken::Char(c) => text.push(*c),
                RunToken::Format { attr, on: true } => {
                    flush(&mut spans, &stack, &mut text);
                    stack.push(attr.clone());
                }
                RunToken::Format { attr, on: false } => {
                    if let Some(idx) = stack.iter().rposition(|a| a == attr) {
                        flush(&mut spans, &stack, &mut text);
                        stack.remove(idx);
                    }
                }
            }
        }
        flush(&mut spans, &stack, &mut text);
        spans
    }
}

/// Leaf blocks carry a character run; container blocks carry child ids.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockContent {
    Run(CharacterRun),
    Children(Vec<BlockId>),
}

/// Scalar attributes supplied at block creation. Attribute values never
/// affect position; only the order list does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockAttrs {
    pub indent: u32,
    pub alignment: Alignment,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub tag: BlockTag,
    pub indent: u32,
    pub alignment: Alignment,
    pub color: Option<String>,
    pub content: BlockContent,
}

impl Block {
    pub fn new(id: BlockId, tag: BlockTag, attrs: BlockAttrs) -> Self {
        let content = if tag.is_container() {
            BlockContent::Children(Vec::new())
        } else {
            BlockContent::Run(CharacterRun::new())
        };
        Self {
            id,
            tag,
            indent: attrs.indent,
            alignment: attrs.alignment,
            color: attrs.color,
            content,
        }
    }

    pub fn run(&self) -> Option<&CharacterRun> {
        match &self.content {
            BlockContent::Run(run) => Some(run),
            BlockContent::Children(_) => None,
        }
    }

    pub fn children(&self) -> Option<&[BlockId]> {
        match &self.content {
            BlockContent::Children(ids) => Some(ids),
            BlockContent::Run(_) => None,
        }
    }
}

/// Source of fresh block ids. Injected so the model carries no global mutable
/// state; production uses [`UuidIds`], tests use [`SequentialIds`].
pub trait IdGenerator: Send {
    fn next_id(&mut self) -> BlockId;
}

/// Random v4 UUID ids.
#[derive(Debug, Default)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_id(&mut self) -> BlockId {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic `prefix-N` ids.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: u64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 0,
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&mut self) -> BlockId {
        let id = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        id
    }
}

/// An ordered rich-text document: order list + block table.
pub struct Document {
    order: Vec<BlockId>,
    blocks: HashMap<BlockId, Block>,
    ids: Box<dyn IdGenerator>,
}

impl Document {
    pub fn new() -> Self {
        Self::with_ids(Box::new(UuidIds))
    }

    pub fn with_ids(ids: Box<dyn IdGenerator>) -> Self {
        Self {
            order: Vec::new(),
            blocks: HashMap::new(),
            ids,
        }
    }

    /// Top-level block ids in document order.
    pub fn order(&self) -> &[BlockId] {
        &self.order
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn block_mut(&mut self, id: &str) -> Option<&mut Block> {
        self.blocks.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Create a block and append its id to the order list.
    pub fn append_block(&mut self, tag: BlockTag, attrs: BlockAttrs) -> BlockId {
        let id = self.ids.next_id();
        self.blocks
            .insert(id.clone(), Block::new(id.clone(), tag, attrs));
        self.order.push(id.clone());
        id
    }

    /// Create a block and append its id to a container block's child list.
    pub fn append_child(
        &mut self,
        parent: &str,
        tag: BlockTag,
        attrs: BlockAttrs,
    ) -> Result<BlockId> {
        let id = self.ids.next_id();
        let block = Block::new(id.clone(), tag, attrs);
        let parent_block = self.blocks.get_mut(parent).ok_or_else(|| {
            SyncError::ApplicationError(format!("parent block {} not found", parent))
        })?;
        match &mut parent_block.content {
            BlockContent::Children(children) => children.push(id.clone()),
            BlockContent::Run(_) => {
                return Err(SyncError::ApplicationError(format!(
                    "block {} is not a container",
                    parent
                )))
            }
        }
        self.blocks.insert(id.clone(), block);
        Ok(id)
    }

    /// Empty the order list and block table atomically. Used for "replace"
    /// semantics before rewriting a document's content.
    pub fn clear(&mut self) {
        self.order.clear();
        self.blocks.clear();
    }

    pub(crate) fn insert_block(&mut self, block: Block) {
        self.blocks.insert(block.id.clone(), block);
    }

    pub(crate) fn push_order(&mut self, id: BlockId, index: usize) {
        let index = index.min(self.order.len());
        self.order.insert(index, id);
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.blocks.contains_key(id)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("order", &self.order)
            .field("blocks", &self.blocks)
            .finish()
    }
}
