//! Word document model.
//!
//! The pipeline never touches WordprocessingML directly. It works on an
//! abstract tree of [`Block`]s and [`Inline`]s through a handful of typed
//! operations (push a paragraph, embed an image, insert a bookmark range,
//! replace a paragraph's content with an internal hyperlink, append another
//! document). [`package`] translates the tree to and from the DOCX zip
//! container.
//!
//! Content read from an existing file (the template skeleton, closing
//! boilerplate) is kept as [`Inline::Raw`] / [`Block::Raw`] XML so it
//! round-trips untouched; only its text is exposed for searching.

pub mod compose;
pub mod package;
pub mod xml;

use crate::error::Csv2DocxError;
use crate::template::Alignment;
use package::Package;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use xml::XmlElement;

/// English Metric Units per inch.
pub const EMU_PER_INCH: f64 = 914_400.0;

// ── Inline content ───────────────────────────────────────────────────────

/// Run color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunColor {
    /// Hex `RRGGBB`.
    Rgb(String),
    /// The theme's hyperlink color.
    ThemeHyperlink,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFormat {
    /// Character style id, e.g. `Hyperlink`.
    pub style_id: Option<String>,
    pub font_name: Option<String>,
    pub font_size_pt: Option<f32>,
    pub bold: Option<bool>,
    pub underline: bool,
    pub color: Option<RunColor>,
}

/// A text run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Run {
    pub text: String,
    pub format: RunFormat,
}

impl Run {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: RunFormat::default(),
        }
    }

    pub fn with_format(mut self, format: RunFormat) -> Self {
        self.format = format;
        self
    }

    pub fn bold(mut self, bold: bool) -> Self {
        self.format.bold = Some(bold);
        self
    }
}

/// An inline picture referencing an image part by relationship id.
#[derive(Debug, Clone, PartialEq)]
pub struct Picture {
    pub rel_id: String,
    pub name: String,
    pub width_emu: u64,
    pub height_emu: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inline {
    Run(Run),
    Picture(Picture),
    BookmarkStart { id: u32, name: String },
    BookmarkEnd { id: u32 },
    /// Internal hyperlink to a bookmark.
    Hyperlink { anchor: String, run: Run },
    /// Content read from an existing file, with its visible text.
    Raw { xml: XmlElement, text: String },
}

impl Inline {
    fn text(&self) -> &str {
        match self {
            Inline::Run(r) | Inline::Hyperlink { run: r, .. } => &r.text,
            Inline::Raw { text, .. } => text,
            _ => "",
        }
    }
}

// ── Paragraphs and tables ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParagraphFormat {
    /// Paragraph style id, e.g. `Heading1`.
    pub style_id: Option<String>,
    pub alignment: Option<Alignment>,
    pub first_line_indent_pt: Option<f32>,
    /// Multiple of single line spacing.
    pub line_spacing: Option<f32>,
    pub space_after_pt: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Paragraph {
    pub format: ParagraphFormat,
    /// Original `w:pPr` of a paragraph read from file; wins over `format`.
    pub raw_props: Option<XmlElement>,
    pub content: Vec<Inline>,
}

impl Paragraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: ParagraphFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_run(mut self, run: Run) -> Self {
        self.content.push(Inline::Run(run));
        self
    }

    pub fn push(&mut self, inline: Inline) {
        self.content.push(inline);
    }

    /// Visible text of the paragraph.
    pub fn text(&self) -> String {
        self.content.iter().map(Inline::text).collect()
    }

    /// Paragraph style id, from the typed format or the raw properties.
    pub fn style_id(&self) -> Option<String> {
        if let Some(props) = &self.raw_props {
            return props
                .child("w:pStyle")
                .and_then(|s| s.attr("w:val"))
                .map(str::to_string);
        }
        self.format.style_id.clone()
    }

    pub fn pictures(&self) -> impl Iterator<Item = &Picture> {
        self.content.iter().filter_map(|i| match i {
            Inline::Picture(p) => Some(p),
            _ => None,
        })
    }

    pub fn hyperlinks(&self) -> impl Iterator<Item = (&str, &Run)> {
        self.content.iter().filter_map(|i| match i {
            Inline::Hyperlink { anchor, run } => Some((anchor.as_str(), run)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableCell {
    pub props: Option<XmlElement>,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRow {
    /// Non-cell children (`w:trPr`, `w:tblPrEx`), in order.
    pub props: Vec<XmlElement>,
    pub cells: Vec<TableCell>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    /// Non-row children (`w:tblPr`, `w:tblGrid`), in order.
    pub props: Vec<XmlElement>,
    pub rows: Vec<TableRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Paragraph(Paragraph),
    Table(Table),
    Raw(XmlElement),
}

/// Address of a paragraph in the body or in a table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParagraphLocation {
    Body(usize),
    Cell {
        table: usize,
        row: usize,
        cell: usize,
        block: usize,
    },
}

// ── Document ─────────────────────────────────────────────────────────────

/// An in-memory Word document.
#[derive(Debug, Clone)]
pub struct Document {
    pub(crate) body: Vec<Block>,
    /// Final section properties (`w:sectPr` of the body).
    pub(crate) section: Option<XmlElement>,
    pub(crate) package: Package,
}

impl Document {
    /// A minimal, valid, empty document.
    pub fn blank() -> Self {
        let (package, body, section) = Package::blank();
        Self {
            body,
            section,
            package,
        }
    }

    /// Open a `.docx` file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Csv2DocxError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| Csv2DocxError::DocumentOpen {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Self::from_bytes(&bytes).map_err(|e| match e {
            Csv2DocxError::MalformedDocument { part, detail } => Csv2DocxError::DocumentOpen {
                path: path.to_path_buf(),
                detail: format!("{part}: {detail}"),
            },
            other => other,
        })
    }

    /// Read a `.docx` package from memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Csv2DocxError> {
        let (package, body, section) = Package::read(bytes)?;
        Ok(Self {
            body,
            section,
            package,
        })
    }

    /// Serialize to `.docx` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Csv2DocxError> {
        self.package.write(&self.body, self.section.as_ref())
    }

    /// Write to `path` atomically (temp file in the same directory, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Csv2DocxError> {
        self.stage(path)?.commit()
    }

    /// Write the package next to `path` without moving it into place.
    pub fn stage(&self, path: impl AsRef<Path>) -> Result<StagedDocument, Csv2DocxError> {
        use std::io::Write;

        let path = path.as_ref();
        let write_err = |e: std::io::Error| Csv2DocxError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        };
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(write_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(&bytes).map_err(write_err)?;
        Ok(StagedDocument {
            tmp,
            path: path.to_path_buf(),
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.body
    }

    pub fn push_paragraph(&mut self, paragraph: Paragraph) -> ParagraphLocation {
        self.body.push(Block::Paragraph(paragraph));
        ParagraphLocation::Body(self.body.len() - 1)
    }

    /// Store image bytes as a media part and return its relationship id.
    pub fn embed_image(&mut self, bytes: Vec<u8>, extension: &str) -> String {
        self.package.add_media(bytes, extension)
    }

    /// Every paragraph: body paragraphs first, then table-cell paragraphs.
    pub fn paragraphs(&self) -> Vec<(ParagraphLocation, &Paragraph)> {
        let mut out = Vec::new();
        for (i, block) in self.body.iter().enumerate() {
            if let Block::Paragraph(p) = block {
                out.push((ParagraphLocation::Body(i), p));
            }
        }
        for (t, block) in self.body.iter().enumerate() {
            let Block::Table(table) = block else { continue };
            for (r, row) in table.rows.iter().enumerate() {
                for (c, cell) in row.cells.iter().enumerate() {
                    for (b, inner) in cell.blocks.iter().enumerate() {
                        if let Block::Paragraph(p) = inner {
                            let loc = ParagraphLocation::Cell {
                                table: t,
                                row: r,
                                cell: c,
                                block: b,
                            };
                            out.push((loc, p));
                        }
                    }
                }
            }
        }
        out
    }

    pub fn paragraph(&self, loc: ParagraphLocation) -> Option<&Paragraph> {
        let block = match loc {
            ParagraphLocation::Body(i) => self.body.get(i)?,
            ParagraphLocation::Cell {
                table,
                row,
                cell,
                block,
            } => match self.body.get(table)? {
                Block::Table(t) => t.rows.get(row)?.cells.get(cell)?.blocks.get(block)?,
                _ => return None,
            },
        };
        match block {
            Block::Paragraph(p) => Some(p),
            _ => None,
        }
    }

    pub fn paragraph_mut(&mut self, loc: ParagraphLocation) -> Option<&mut Paragraph> {
        let block = match loc {
            ParagraphLocation::Body(i) => self.body.get_mut(i)?,
            ParagraphLocation::Cell {
                table,
                row,
                cell,
                block,
            } => match self.body.get_mut(table)? {
                Block::Table(t) => t
                    .rows
                    .get_mut(row)?
                    .cells
                    .get_mut(cell)?
                    .blocks
                    .get_mut(block)?,
                _ => return None,
            },
        };
        match block {
            Block::Paragraph(p) => Some(p),
            _ => None,
        }
    }

    /// Names of every bookmark in the document, typed or raw.
    pub fn bookmark_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.visit_bookmarks(&mut |id, name| {
            let _ = id;
            if let Some(name) = name {
                names.insert(name.to_string());
            }
        });
        names
    }

    /// Number of bookmark starts named `name`.
    pub fn bookmark_count(&self, name: &str) -> usize {
        let mut count = 0;
        self.visit_bookmarks(&mut |_, n| {
            if n == Some(name) {
                count += 1;
            }
        });
        count
    }

    fn next_bookmark_id(&self) -> u32 {
        let mut max: Option<u32> = None;
        self.visit_bookmarks(&mut |id, _| {
            if let Some(id) = id {
                max = Some(max.map_or(id, |m| m.max(id)));
            }
        });
        max.map_or(0, |m| m + 1)
    }

    /// Calls `visit(id, name)` for each bookmark start and `visit(id, None)`
    /// for each bookmark end.
    fn visit_bookmarks(&self, visit: &mut dyn FnMut(Option<u32>, Option<&str>)) {
        fn raw(el: &XmlElement, visit: &mut dyn FnMut(Option<u32>, Option<&str>)) {
            el.walk(&mut |e| match e.name.as_str() {
                "w:bookmarkStart" => {
                    visit(e.attr("w:id").and_then(|v| v.parse().ok()), e.attr("w:name"))
                }
                "w:bookmarkEnd" => visit(e.attr("w:id").and_then(|v| v.parse().ok()), None),
                _ => {}
            });
        }
        fn paragraph(p: &Paragraph, visit: &mut dyn FnMut(Option<u32>, Option<&str>)) {
            for inline in &p.content {
                match inline {
                    Inline::BookmarkStart { id, name } => visit(Some(*id), Some(name)),
                    Inline::BookmarkEnd { id } => visit(Some(*id), None),
                    Inline::Raw { xml, .. } => raw(xml, visit),
                    _ => {}
                }
            }
        }
        fn block(b: &Block, visit: &mut dyn FnMut(Option<u32>, Option<&str>)) {
            match b {
                Block::Paragraph(p) => paragraph(p, visit),
                Block::Raw(el) => raw(el, visit),
                Block::Table(t) => {
                    for cell in t.rows.iter().flat_map(|r| r.cells.iter()) {
                        for inner in &cell.blocks {
                            block(inner, visit);
                        }
                    }
                }
            }
        }
        for b in &self.body {
            block(b, visit);
        }
    }

    /// Wrap the paragraph at `loc` in a bookmark named `name`.
    ///
    /// `marker` adds a visible text run right after the bookmark start.
    /// Returns the bookmark id, or `None` when `loc` is not a paragraph.
    pub fn insert_bookmark_range(
        &mut self,
        loc: ParagraphLocation,
        name: &str,
        marker: Option<&str>,
    ) -> Option<u32> {
        let id = self.next_bookmark_id();
        let paragraph = self.paragraph_mut(loc)?;
        let mut content = Vec::with_capacity(paragraph.content.len() + 3);
        content.push(Inline::BookmarkStart {
            id,
            name: name.to_string(),
        });
        if let Some(text) = marker {
            content.push(Inline::Run(Run::new(text)));
        }
        content.append(&mut paragraph.content);
        content.push(Inline::BookmarkEnd { id });
        paragraph.content = content;
        Some(id)
    }

    /// Replace everything inside the paragraph at `loc` with one internal
    /// hyperlink to `anchor`, keeping the paragraph's own properties.
    pub fn replace_paragraph_content_with_hyperlink(
        &mut self,
        loc: ParagraphLocation,
        anchor: &str,
        run: Run,
    ) -> bool {
        match self.paragraph_mut(loc) {
            Some(p) => {
                p.content = vec![Inline::Hyperlink {
                    anchor: anchor.to_string(),
                    run,
                }];
                true
            }
            None => false,
        }
    }

    /// Bytes of the media part behind an image relationship.
    pub fn media(&self, rel_id: &str) -> Option<&[u8]> {
        self.package.media_for(rel_id)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::blank()
    }
}

// ── Staged output ────────────────────────────────────────────────────────

/// A fully written document waiting to be renamed over its destination.
///
/// Dropping it without [`commit`](Self::commit) deletes the temp file and
/// leaves the destination untouched.
#[derive(Debug)]
pub struct StagedDocument {
    tmp: tempfile::NamedTempFile,
    path: PathBuf,
}

impl StagedDocument {
    pub fn destination(&self) -> &Path {
        &self.path
    }

    /// Move the staged file into place.
    pub fn commit(self) -> Result<(), Csv2DocxError> {
        let path = self.path;
        self.tmp
            .persist(&path)
            .map_err(|e| Csv2DocxError::OutputWriteFailed {
                path: path.clone(),
                source: e.error,
            })?;
        Ok(())
    }
}
