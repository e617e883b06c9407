//! Cross-reference linker: one pass after assembly that installs the index
//! bookmark and turns every return placeholder into an internal hyperlink.
//!
//! Running it twice on the same document is harmless: an existing bookmark
//! of the configured name is reused, and paragraphs already converted still
//! match as placeholders and are rewritten with an identical hyperlink.

use crate::document::{Document, Paragraph, ParagraphLocation, Run, RunColor, RunFormat};
use crate::template::{parse_color, TemplateDefinition};
use tracing::{debug, info, warn};

/// Visible text placed after the bookmark start when the bookmark is made
/// visible for debugging.
pub const VISIBLE_BOOKMARK_MARKER: &str = "[TOC_ANCHOR]";

/// Where the bookmark ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkPlacement {
    /// A bookmark with the configured name was already present.
    Existing,
    /// Installed on the first paragraph containing the anchor keyword.
    Keyword(ParagraphLocation),
    /// Keyword not found; installed on the first paragraph.
    Fallback(ParagraphLocation),
}

/// Outcome of one linking pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReport {
    pub bookmark: BookmarkPlacement,
    pub links_created: usize,
}

/// Installs the index bookmark and return-to-index hyperlinks.
#[derive(Debug, Clone)]
pub struct CrossReferenceLinker<'a> {
    template: &'a TemplateDefinition,
    visible_bookmark: bool,
}

impl<'a> CrossReferenceLinker<'a> {
    pub fn new(template: &'a TemplateDefinition, visible_bookmark: bool) -> Self {
        Self {
            template,
            visible_bookmark,
        }
    }

    /// Run the pass over `doc`.
    pub fn link(&self, doc: &mut Document) -> LinkReport {
        let bookmark = self.ensure_bookmark(doc);
        let links_created = self.link_placeholders(doc);
        info!(
            bookmark = %self.template.bookmark_name,
            links_created,
            "cross references linked"
        );
        LinkReport {
            bookmark,
            links_created,
        }
    }

    fn is_placeholder(&self, p: &Paragraph) -> bool {
        p.text().trim() == self.template.return_link.text.trim()
    }

    fn ensure_bookmark(&self, doc: &mut Document) -> BookmarkPlacement {
        let name = &self.template.bookmark_name;
        if doc.bookmark_count(name) > 0 {
            debug!(bookmark = %name, "bookmark already present, reusing");
            return BookmarkPlacement::Existing;
        }

        let keyword = self.template.anchor_keyword.as_str();
        let found = doc
            .paragraphs()
            .into_iter()
            .find(|(_, p)| !self.is_placeholder(p) && p.text().contains(keyword))
            .map(|(loc, _)| loc);

        let placement = match found {
            Some(loc) => BookmarkPlacement::Keyword(loc),
            None => {
                let first = doc.paragraphs().first().map(|(loc, _)| *loc);
                let loc = match first {
                    Some(loc) => loc,
                    None => doc.push_paragraph(Paragraph::new()),
                };
                warn!(
                    keyword,
                    bookmark = %name,
                    "anchor keyword not found, bookmarking the first paragraph"
                );
                BookmarkPlacement::Fallback(loc)
            }
        };

        let loc = match placement {
            BookmarkPlacement::Keyword(loc) | BookmarkPlacement::Fallback(loc) => loc,
            BookmarkPlacement::Existing => return placement,
        };
        let marker = self.visible_bookmark.then_some(VISIBLE_BOOKMARK_MARKER);
        if let Some(id) = doc.insert_bookmark_range(loc, name, marker) {
            debug!(bookmark = %name, id, ?loc, "bookmark installed");
        }
        placement
    }

    fn link_run(&self) -> Run {
        let style = &self.template.return_link;
        let color = match style.color.as_deref().and_then(parse_color) {
            Some(hex) => RunColor::Rgb(hex),
            None => RunColor::ThemeHyperlink,
        };
        Run::new(style.text.clone()).with_format(RunFormat {
            style_id: Some("Hyperlink".to_string()),
            font_name: Some(style.font_name.clone()),
            font_size_pt: Some(style.font_size),
            bold: None,
            underline: style.underline,
            color: Some(color),
        })
    }

    fn link_placeholders(&self, doc: &mut Document) -> usize {
        let targets: Vec<ParagraphLocation> = doc
            .paragraphs()
            .into_iter()
            .filter(|(_, p)| self.is_placeholder(p))
            .map(|(loc, _)| loc)
            .collect();

        let anchor = &self.template.bookmark_name;
        targets
            .into_iter()
            .filter(|loc| doc.replace_paragraph_content_with_hyperlink(*loc, anchor, self.link_run()))
            .count()
    }
}
