//! Append one document to the end of another, keeping section boundaries.

use super::package::{rel_types, Package};
use super::xml::XmlElement;
use super::{Block, Document, Inline, Paragraph};
use crate::error::Csv2DocxError;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// Attributes that hold a relationship id of the main document part.
const REL_ATTRIBUTES: &[&str] = &["r:embed", "r:id", "r:link", "r:pict"];

/// What [`Document::append_document`] carried over.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposeReport {
    pub blocks_appended: usize,
    pub media_copied: usize,
    pub hyperlinks_copied: usize,
    /// Relationship ids of the appended document that could not be carried.
    pub relationships_skipped: Vec<String>,
    /// Bookmarks renamed because the master already used the name.
    pub bookmarks_renamed: usize,
}

impl Document {
    /// Append `other` after the current content.
    ///
    /// The current last section is closed with a section break so both
    /// documents keep their own page setup. Images and external hyperlinks
    /// are re-registered in this package; bookmark ids are shifted above the
    /// ones already in use and clashing names get a numeric suffix. Headers
    /// and footers of `other` are not carried.
    pub fn append_document(&mut self, other: Document) -> ComposeReport {
        let mut report = ComposeReport::default();
        let Document {
            body: mut other_body,
            section: other_section,
            package: other_package,
        } = other;

        // ── Close the current section ──
        if let Some(section) = self.section.take() {
            let props = XmlElement::new("w:pPr").with_child(section);
            self.body.push(Block::Paragraph(Paragraph {
                raw_props: Some(props),
                ..Default::default()
            }));
        }

        // ── Relationships ──
        let rel_map = self.import_relationships(&other_package, &mut report);

        // ── Bookmarks ──
        let offset = self.next_bookmark_id();
        let taken = self.bookmark_names();
        let mut renamer = BookmarkRenamer::new(taken);

        for block in &mut other_body {
            rewrite_block(block, &rel_map, offset, &mut renamer);
        }
        report.bookmarks_renamed = renamer.renamed;
        report.blocks_appended = other_body.len();
        self.body.append(&mut other_body);

        self.section = other_section.map(|mut s| {
            s.children.retain(|n| match n {
                super::xml::XmlNode::Element(e) => {
                    e.name != "w:headerReference" && e.name != "w:footerReference"
                }
                super::xml::XmlNode::Text(_) => true,
            });
            s
        });

        debug!(
            blocks = report.blocks_appended,
            media = report.media_copied,
            "appended document"
        );
        report
    }

    fn import_relationships(
        &mut self,
        other: &Package,
        report: &mut ComposeReport,
    ) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for rel in other.relationships() {
            match rel.rel_type.as_str() {
                rel_types::IMAGE if !rel.external => {
                    let part = Package::part_name_for_target(&rel.target);
                    match other.part(&part) {
                        Some(bytes) => {
                            let ext = part.rsplit_once('.').map(|(_, e)| e).unwrap_or("png");
                            let id = self.package.add_media(bytes.to_vec(), ext);
                            map.insert(rel.id.clone(), id);
                            report.media_copied += 1;
                        }
                        None => {
                            warn!(rel = %rel.id, part = %part, "image part missing from appended document");
                            report.relationships_skipped.push(rel.id.clone());
                        }
                    }
                }
                rel_types::HYPERLINK => {
                    let id = self
                        .package
                        .add_relationship(rel_types::HYPERLINK, &rel.target, rel.external);
                    map.insert(rel.id.clone(), id);
                    report.hyperlinks_copied += 1;
                }
                // Styles, numbering, theme and the like belong to the master.
                rel_types::STYLES => {}
                _ => report.relationships_skipped.push(rel.id.clone()),
            }
        }
        if !report.relationships_skipped.is_empty() {
            warn!(
                skipped = ?report.relationships_skipped,
                "appended document has relationships that were not carried over"
            );
        }
        map
    }
}

/// Open `path` and append it to `master`.
///
/// A missing file is not an error: it is logged and `Ok(None)` is returned.
pub fn append_document_file(
    master: &mut Document,
    path: &Path,
) -> Result<Option<ComposeReport>, Csv2DocxError> {
    if !path.exists() {
        warn!(path = %path.display(), "closing document not found, skipping");
        return Ok(None);
    }
    let other = Document::open(path)?;
    Ok(Some(master.append_document(other)))
}

struct BookmarkRenamer {
    taken: BTreeSet<String>,
    renames: HashMap<String, String>,
    renamed: usize,
}

impl BookmarkRenamer {
    fn new(taken: BTreeSet<String>) -> Self {
        Self {
            taken,
            renames: HashMap::new(),
            renamed: 0,
        }
    }

    fn rename(&mut self, name: &str) -> String {
        if let Some(done) = self.renames.get(name) {
            return done.clone();
        }
        if !self.taken.contains(name) {
            self.taken.insert(name.to_string());
            self.renames.insert(name.to_string(), name.to_string());
            return name.to_string();
        }
        let mut n = 2;
        let fresh = loop {
            let candidate = format!("{name}_{n}");
            if !self.taken.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        self.taken.insert(fresh.clone());
        self.renames.insert(name.to_string(), fresh.clone());
        self.renamed += 1;
        fresh
    }
}

fn rewrite_block(
    block: &mut Block,
    rel_map: &HashMap<String, String>,
    offset: u32,
    renamer: &mut BookmarkRenamer,
) {
    match block {
        Block::Paragraph(p) => {
            if let Some(props) = &mut p.raw_props {
                rewrite_raw(props, rel_map, offset, renamer);
            }
            for inline in &mut p.content {
                match inline {
                    Inline::Picture(pic) => {
                        if let Some(id) = rel_map.get(&pic.rel_id) {
                            pic.rel_id = id.clone();
                        }
                    }
                    Inline::BookmarkStart { id, name } => {
                        *id += offset;
                        *name = renamer.rename(name);
                    }
                    Inline::BookmarkEnd { id } => *id += offset,
                    Inline::Raw { xml, .. } => rewrite_raw(xml, rel_map, offset, renamer),
                    Inline::Run(_) | Inline::Hyperlink { .. } => {}
                }
            }
        }
        Block::Table(t) => {
            for prop in &mut t.props {
                rewrite_raw(prop, rel_map, offset, renamer);
            }
            for row in &mut t.rows {
                for cell in &mut row.cells {
                    for inner in &mut cell.blocks {
                        rewrite_block(inner, rel_map, offset, renamer);
                    }
                }
            }
        }
        Block::Raw(el) => rewrite_raw(el, rel_map, offset, renamer),
    }
}

fn rewrite_raw(
    el: &mut XmlElement,
    rel_map: &HashMap<String, String>,
    offset: u32,
    renamer: &mut BookmarkRenamer,
) {
    el.walk_mut(&mut |e| {
        for key in REL_ATTRIBUTES {
            if let Some(new_id) = e.attr(key).and_then(|old| rel_map.get(old)).cloned() {
                e.set_attr(*key, new_id);
            }
        }
        if e.name == "w:bookmarkStart" || e.name == "w:bookmarkEnd" {
            if let Some(id) = e.attr("w:id").and_then(|v| v.parse::<u32>().ok()) {
                e.set_attr("w:id", (id + offset).to_string());
            }
            if let Some(name) = e.attr("w:name").map(str::to_string) {
                e.set_attr("w:name", renamer.rename(&name));
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ParagraphLocation, Run};

    fn doc_with(texts: &[&str]) -> Document {
        let mut doc = Document::blank();
        for t in texts {
            doc.push_paragraph(Paragraph::new().with_run(Run::new(*t)));
        }
        doc
    }

    #[test]
    fn appends_blocks_after_a_section_break() {
        let mut master = doc_with(&["body"]);
        let other = doc_with(&["closing"]);
        let report = master.append_document(other);

        assert_eq!(report.blocks_appended, 1);
        assert_eq!(master.body.len(), 3);
        let Block::Paragraph(brk) = &master.body[1] else {
            panic!("expected section break paragraph")
        };
        assert!(brk.raw_props.as_ref().unwrap().child("w:sectPr").is_some());
        let texts: Vec<String> = master.paragraphs().iter().map(|(_, p)| p.text()).collect();
        assert_eq!(texts, vec!["body", "", "closing"]);
        assert!(master.section.is_some());
    }

    #[test]
    fn images_are_copied_and_relinked() {
        let mut master = Document::blank();
        master.embed_image(vec![9, 9], "png");

        let mut other = Document::blank();
        let rel = other.embed_image(vec![1, 2, 3], "png");
        let mut p = Paragraph::new();
        p.push(Inline::Picture(crate::document::Picture {
            rel_id: rel,
            name: "a.png".into(),
            width_emu: 10,
            height_emu: 10,
        }));
        other.push_paragraph(p);

        let report = master.append_document(other);
        assert_eq!(report.media_copied, 1);
        let (_, p) = *master.paragraphs().last().unwrap();
        let pic = p.pictures().next().unwrap();
        assert_eq!(master.media(&pic.rel_id), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn bookmarks_are_renumbered_and_renamed() {
        let mut master = doc_with(&["Contents"]);
        master.insert_bookmark_range(ParagraphLocation::Body(0), "TOC_ANCHOR", None);

        let mut other = doc_with(&["Appendix"]);
        other.insert_bookmark_range(ParagraphLocation::Body(0), "TOC_ANCHOR", None);

        let report = master.append_document(other);
        assert_eq!(report.bookmarks_renamed, 1);
        assert_eq!(master.bookmark_count("TOC_ANCHOR"), 1);
        assert!(master.bookmark_names().contains("TOC_ANCHOR_2"));

        let (_, last) = *master.paragraphs().last().unwrap();
        assert!(matches!(last.content.first(), Some(Inline::BookmarkStart { id: 1, .. })));
    }

    #[test]
    fn appended_document_survives_save_and_reopen() {
        let mut master = doc_with(&["body"]);
        master.append_document(doc_with(&["closing"]));
        let reopened = Document::from_bytes(&master.to_bytes().unwrap()).unwrap();
        let texts: Vec<String> = reopened.paragraphs().iter().map(|(_, p)| p.text()).collect();
        assert_eq!(texts, vec!["body", "", "closing"]);
    }

    #[test]
    fn missing_file_is_skipped() {
        let mut master = doc_with(&["body"]);
        let dir = tempfile::tempdir().unwrap();
        let result = append_document_file(&mut master, &dir.path().join("nope.docx")).unwrap();
        assert!(result.is_none());
        assert_eq!(master.body.len(), 1);
    }
}
