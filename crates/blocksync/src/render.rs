//! Semantic renderer: walks a decoded document once and emits grouped,
//! nested markup.
//!
//! Dispatch is an exhaustive match on the block tag. Adjacent list items of
//! the same kind merge into one wrapping list; container blocks recurse with
//! a depth ceiling; opaque, unknown, and unresolved blocks render explicit
//! placeholders instead of failing.

use crate::crdt::codec;
use crate::crdt::Replica;
use crate::doc::{Block, BlockTag, CharacterRun, Document, InlineAttr, Span};
use crate::error::Result;

/// Default recursion ceiling for container blocks.
pub const MAX_CONTAINER_DEPTH: usize = 10;

/// Kind of list wrapper a block belongs to, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Ordered,
    Unordered,
    Todo,
}

impl ListKind {
    fn of(tag: &BlockTag) -> Option<ListKind> {
        match tag {
            BlockTag::OrderedListItem => Some(ListKind::Ordered),
            BlockTag::UnorderedListItem => Some(ListKind::Unordered),
            BlockTag::CheckedListItem | BlockTag::UncheckedListItem => Some(ListKind::Todo),
            _ => None,
        }
    }

    fn open_tag(&self) -> &'static str {
        match self {
            ListKind::Ordered => "<ol>",
            ListKind::Unordered => "<ul>",
            ListKind::Todo => r#"<ul data-kind="todo">"#,
        }
    }

    fn close_tag(&self) -> &'static str {
        match self {
            ListKind::Ordered => "</ol>",
            ListKind::Unordered | ListKind::Todo => "</ul>",
        }
    }
}

/// Renders a document to semantic HTML.
#[derive(Debug, Clone)]
pub struct HtmlRenderer {
    max_depth: usize,
}

impl Default for HtmlRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl HtmlRenderer {
    pub fn new() -> Self {
        Self {
            max_depth: MAX_CONTAINER_DEPTH,
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Render the whole document.
    pub fn render(&self, doc: &Document) -> String {
        let mut out = String::new();
        self.render_ids(doc, doc.order(), 0, &mut out);
        out
    }

    fn render_ids(&self, doc: &Document, ids: &[String], depth: usize, out: &mut String) {
        let mut open_list: Option<ListKind> = None;
        for id in ids {
            let Some(block) = doc.block(id) else {
                // Referenced but undecodable: mark it, keep going.
                close_list(&mut open_list, out);
                out.push_str(&format!(
                    r#"<div data-unresolved-block="{}"></div>"#,
                    escape(id)
                ));
                continue;
            };

            let kind = ListKind::of(&block.tag);
            if open_list != kind {
                close_list(&mut open_list, out);
                if let Some(kind) = kind {
                    out.push_str(kind.open_tag());
                    open_list = Some(kind);
                }
            }
            self.render_block(doc, block, depth, out);
        }
        close_list(&mut open_list, out);
    }

    fn render_block(&self, doc: &Document, block: &Block, depth: usize, out: &mut String) {
        let attrs = block_attrs(block);
        match &block.tag {
            BlockTag::Paragraph => wrap(out, "p", &attrs, &render_run_of(block)),
            BlockTag::Heading1 => wrap(out, "h1", &attrs, &render_run_of(block)),
            BlockTag::Heading2 => wrap(out, "h2", &attrs, &render_run_of(block)),
            BlockTag::Heading3 => wrap(out, "h3", &attrs, &render_run_of(block)),
            BlockTag::Divider => out.push_str("<hr />"),
            BlockTag::OrderedListItem | BlockTag::UnorderedListItem => {
                wrap(out, "li", &attrs, &render_run_of(block));
            }
            BlockTag::CheckedListItem | BlockTag::UncheckedListItem => {
                let checked = block.tag == BlockTag::CheckedListItem;
                out.push_str(&format!(
                    r#"<li data-checked="{}"{}>{}</li>"#,
                    checked,
                    attrs,
                    render_run_of(block)
                ));
            }
            BlockTag::Blockquote => wrap(out, "blockquote", &attrs, &render_run_of(block)),
            BlockTag::Code => {
                // Code content is literal; inline formatting does not apply.
                let text = block.run().map(CharacterRun::plain_text).unwrap_or_default();
                out.push_str(&format!("<pre><code>{}</code></pre>", escape(&text)));
            }
            BlockTag::Toggle => {
                if depth >= self.max_depth {
                    out.push_str(&format!(
                        r#"<div data-depth-limit="{}" data-block-id="{}"></div>"#,
                        self.max_depth,
                        escape(&block.id)
                    ));
                    return;
                }
                out.push_str(&format!("<details{}>", attrs));
                if let Some(children) = block.children() {
                    self.render_ids(doc, children, depth + 1, out);
                }
                out.push_str("</details>");
            }
            BlockTag::Foreign(subtype) => {
                let subtype = subtype.as_deref().unwrap_or("opaque");
                out.push_str(&format!(
                    r#"<div data-foreign-block="{}" data-block-id="{}"></div>"#,
                    escape(subtype),
                    escape(&block.id)
                ));
            }
            BlockTag::Unknown(raw) => {
                out.push_str(&format!(
                    r#"<div data-unknown-block="{}" data-block-id="{}"></div>"#,
                    escape(raw),
                    escape(&block.id)
                ));
            }
        }
    }
}

fn close_list(open: &mut Option<ListKind>, out: &mut String) {
    if let Some(kind) = open.take() {
        out.push_str(kind.close_tag());
    }
}

fn render_run_of(block: &Block) -> String {
    block.run().map(render_run).unwrap_or_default()
}

/// Render a character run's spans as nested inline markup, closing tags
/// innermost-first.
fn render_run(run: &CharacterRun) -> String {
    let mut out = String::new();
    for Span { text, attrs } in run.spans() {
        for attr in &attrs {
            match attr {
                InlineAttr::Bold => out.push_str("<strong>"),
                InlineAttr::Italic => out.push_str("<em>"),
                InlineAttr::Underline => out.push_str("<u>"),
                InlineAttr::Strikethrough => out.push_str("<s>"),
                InlineAttr::Code => out.push_str("<code>"),
                InlineAttr::Other(name) => {
                    out.push_str(&format!(r#"<span data-attr="{}">"#, escape(name)));
                }
            }
        }
        out.push_str(&escape(&text));
        for attr in attrs.iter().rev() {
            out.push_str(match attr {
                InlineAttr::Bold => "</strong>",
                InlineAttr::Italic => "</em>",
                InlineAttr::Underline => "</u>",
                InlineAttr::Strikethrough => "</s>",
                InlineAttr::Code => "</code>",
                InlineAttr::Other(_) => "</span>",
            });
        }
    }
    out
}

/// Style/data attributes shared by every rendered element.
fn block_attrs(block: &Block) -> String {
    let mut out = String::new();
    if block.indent > 0 {
        out.push_str(&format!(r#" data-indent="{}""#, block.indent));
    }
    let mut style = String::new();
    if block.alignment != crate::doc::Alignment::Left {
        style.push_str(&format!("text-align:{};", block.alignment.as_str()));
    }
    if let Some(color) = &block.color {
        style.push_str(&format!("color:{};", escape(color)));
    }
    if !style.is_empty() {
        out.push_str(&format!(r#" style="{}""#, style));
    }
    out
}

fn wrap(out: &mut String, tag: &str, attrs: &str, body: &str) {
    out.push_str(&format!("<{}{}>{}</{}>", tag, attrs, body, tag));
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Read path: decode a raw snapshot buffer and render it.
///
/// The buffer is `[version byte][varint length][CRDT payload]`; the decode
/// cascade of the update codec applies to the payload, and the merge is
/// best-effort — blocks that fail to resolve render explicit placeholders
/// rather than emptying the output.
pub fn render_snapshot(bytes: &[u8]) -> Result<String> {
    Ok(HtmlRenderer::new().render(decode_snapshot_doc(bytes)?.doc()))
}

/// Decode a raw snapshot buffer into a replica holding the document.
pub fn decode_snapshot_doc(bytes: &[u8]) -> Result<Replica> {
    let update = codec::decode_snapshot(bytes)?;
    let mut replica = Replica::new(0);
    replica.apply(&update);
    Ok(replica)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::codec::UpdateFormat;
    use crate::crdt::StateVector;
    use crate::doc::{BlockAttrs, BlockContent, BlockTag, SequentialIds};

    fn doc_with(f: impl FnOnce(&mut Document)) -> Document {
        let mut doc = Document::with_ids(Box::new(SequentialIds::new("b")));
        f(&mut doc);
        doc
    }

    fn set_text(doc: &mut Document, id: &str, text: &str) {
        if let BlockContent::Run(run) = &mut doc.block_mut(id).unwrap().content {
            run.push_str(text);
        }
    }

    #[test]
    fn test_scenario_b_bold_run() {
        let doc = doc_with(|doc| {
            let p = doc.append_block(BlockTag::Paragraph, BlockAttrs::default());
            if let BlockContent::Run(run) = &mut doc.block_mut(&p).unwrap().content {
                run.push_str("Hi ");
                run.format_on(InlineAttr::Bold);
                run.push_str("there");
                run.format_off(InlineAttr::Bold);
            }
        });
        assert_eq!(
            HtmlRenderer::new().render(&doc),
            "<p>Hi <strong>there</strong></p>"
        );
    }

    #[test]
    fn test_list_grouping() {
        let doc = doc_with(|doc| {
            for i in 0..3 {
                let id = doc.append_block(BlockTag::UnorderedListItem, BlockAttrs::default());
                set_text(doc, &id, &format!("u{}", i));
            }
            let id = doc.append_block(BlockTag::OrderedListItem, BlockAttrs::default());
            set_text(doc, &id, "o0");
        });
        assert_eq!(
            HtmlRenderer::new().render(&doc),
            "<ul><li>u0</li><li>u1</li><li>u2</li></ul><ol><li>o0</li></ol>"
        );
    }

    #[test]
    fn test_list_closes_around_non_list_block() {
        let doc = doc_with(|doc| {
            let a = doc.append_block(BlockTag::UnorderedListItem, BlockAttrs::default());
            set_text(doc, &a, "a");
            let p = doc.append_block(BlockTag::Paragraph, BlockAttrs::default());
            set_text(doc, &p, "mid");
            let b = doc.append_block(BlockTag::UnorderedListItem, BlockAttrs::default());
            set_text(doc, &b, "b");
        });
        assert_eq!(
            HtmlRenderer::new().render(&doc),
            "<ul><li>a</li></ul><p>mid</p><ul><li>b</li></ul>"
        );
    }

    #[test]
    fn test_todo_items_share_one_list() {
        let doc = doc_with(|doc| {
            let a = doc.append_block(BlockTag::CheckedListItem, BlockAttrs::default());
            set_text(doc, &a, "done");
            let b = doc.append_block(BlockTag::UncheckedListItem, BlockAttrs::default());
            set_text(doc, &b, "todo");
        });
        assert_eq!(
            HtmlRenderer::new().render(&doc),
            r#"<ul data-kind="todo"><li data-checked="true">done</li><li data-checked="false">todo</li></ul>"#
        );
    }

    #[test]
    fn test_scenario_e_unknown_block_renders_placeholder() {
        let doc = doc_with(|doc| {
            doc.append_block(
                BlockTag::Unknown("kanban-board".into()),
                BlockAttrs::default(),
            );
        });
        let html = HtmlRenderer::new().render(&doc);
        assert!(html.contains(r#"data-unknown-block="kanban-board""#));
        assert!(html.contains(r#"data-block-id="b-0""#));
    }

    #[test]
    fn test_foreign_block_placeholder_carries_metadata() {
        let doc = doc_with(|doc| {
            doc.append_block(
                BlockTag::Foreign(Some("embed".into())),
                BlockAttrs::default(),
            );
        });
        let html = HtmlRenderer::new().render(&doc);
        assert!(html.contains(r#"data-foreign-block="embed""#));
        assert!(html.contains(r#"data-block-id="b-0""#));
    }

    #[test]
    fn test_toggle_depth_limit() {
        let mut doc = Document::with_ids(Box::new(SequentialIds::new("t")));
        let mut parent = doc.append_block(BlockTag::Toggle, BlockAttrs::default());
        for _ in 0..12 {
            parent = doc
                .append_child(&parent, BlockTag::Toggle, BlockAttrs::default())
                .unwrap();
        }

        let html = HtmlRenderer::new().render(&doc);
        assert!(html.contains("data-depth-limit"));
        assert_eq!(html.matches("<details").count(), MAX_CONTAINER_DEPTH);
    }

    #[test]
    fn test_toggle_balance_never_overcloses() {
        // Unbalanced off-toggles must not emit extra closing tags.
        let doc = doc_with(|doc| {
            let p = doc.append_block(BlockTag::Paragraph, BlockAttrs::default());
            if let BlockContent::Run(run) = &mut doc.block_mut(&p).unwrap().content {
                run.format_off(InlineAttr::Bold);
                run.push_str("x");
                run.format_on(InlineAttr::Italic);
                run.push_str("y");
                run.format_off(InlineAttr::Bold);
                run.format_off(InlineAttr::Italic);
                run.format_off(InlineAttr::Italic);
            }
        });
        let html = HtmlRenderer::new().render(&doc);
        assert_eq!(html.matches("<em>").count(), html.matches("</em>").count());
        assert_eq!(html.matches("<strong>").count(), 0);
        assert_eq!(html.matches("</strong>").count(), 0);
    }

    #[test]
    fn test_divider_and_quote_and_code() {
        let doc = doc_with(|doc| {
            doc.append_block(BlockTag::Divider, BlockAttrs::default());
            let q = doc.append_block(BlockTag::Blockquote, BlockAttrs::default());
            set_text(doc, &q, "wise");
            let c = doc.append_block(BlockTag::Code, BlockAttrs::default());
            set_text(doc, &c, "a < b");
        });
        assert_eq!(
            HtmlRenderer::new().render(&doc),
            "<hr /><blockquote>wise</blockquote><pre><code>a &lt; b</code></pre>"
        );
    }

    #[test]
    fn test_block_attrs_render_as_style() {
        let doc = doc_with(|doc| {
            let id = doc.append_block(
                BlockTag::Paragraph,
                BlockAttrs {
                    indent: 2,
                    alignment: crate::doc::Alignment::Center,
                    color: Some("red".into()),
                },
            );
            set_text(doc, &id, "hey");
        });
        assert_eq!(
            HtmlRenderer::new().render(&doc),
            r#"<p data-indent="2" style="text-align:center;color:red;">hey</p>"#
        );
    }

    #[test]
    fn test_escapes_text() {
        let doc = doc_with(|doc| {
            let p = doc.append_block(BlockTag::Paragraph, BlockAttrs::default());
            set_text(doc, &p, "<script>&\"");
        });
        assert_eq!(
            HtmlRenderer::new().render(&doc),
            "<p>&lt;script&gt;&amp;&quot;</p>"
        );
    }

    #[test]
    fn test_render_snapshot_end_to_end() {
        let mut replica = Replica::new(3);
        replica.transact(|tx| {
            let p = tx.append_block(BlockTag::Paragraph, BlockAttrs::default());
            tx.append_text(&p, "Hello").unwrap();
        });
        let update = replica.diff(&StateVector::new());
        let bytes = codec::encode_snapshot(&update, UpdateFormat::Compact);

        assert_eq!(render_snapshot(&bytes).unwrap(), "<p>Hello</p>");
    }

    #[test]
    fn test_render_snapshot_legacy_payload() {
        let mut replica = Replica::new(3);
        replica.transact(|tx| {
            let h = tx.append_block(BlockTag::Heading2, BlockAttrs::default());
            tx.append_text(&h, "Title").unwrap();
        });
        let update = replica.diff(&StateVector::new());
        let bytes = codec::encode_snapshot(&update, UpdateFormat::Legacy);

        assert_eq!(render_snapshot(&bytes).unwrap(), "<h2>Title</h2>");
    }
}
