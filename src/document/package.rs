//! DOCX container: zip parts, relationships, content types, styles.
//!
//! Reading keeps every part byte-for-byte except the main document and its
//! relationships, which are parsed into the [`super::Document`] tree. Writing
//! regenerates those two, refreshes `[Content_Types].xml` for any new media
//! extension, and makes sure the heading and hyperlink styles the generator
//! refers to exist in `word/styles.xml`.

use super::xml::{self, XmlElement, XmlNode};
use super::{Block, Inline, Paragraph, ParagraphFormat, Picture, Run, RunColor, Table, TableCell, TableRow};
use crate::error::Csv2DocxError;
use quick_xml::escape::escape;
use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};

pub const MAIN_PART: &str = "word/document.xml";
pub const MAIN_RELS_PART: &str = "word/_rels/document.xml.rels";
pub const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
pub const STYLES_PART: &str = "word/styles.xml";
const PACKAGE_RELS_PART: &str = "_rels/.rels";
/// Upper bound on the buffer reserved up front for one zip entry.
const MAX_PREALLOC: usize = 1 << 20;

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n";

pub mod rel_types {
    pub const OFFICE_DOCUMENT: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
    pub const STYLES: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles";
    pub const IMAGE: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";
    pub const HYPERLINK: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink";
}

const NS_W: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
const NS_R: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const NS_WP: &str = "http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing";
const NS_A: &str = "http://schemas.openxmlformats.org/drawingml/2006/main";
const NS_PIC: &str = "http://schemas.openxmlformats.org/drawingml/2006/picture";
const NS_RELS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const NS_CT: &str = "http://schemas.openxmlformats.org/package/2006/content-types";

/// One entry of `word/_rels/document.xml.rels`.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
    pub external: bool,
}

/// Everything in the package except the body content.
#[derive(Debug, Clone)]
pub struct Package {
    /// Untouched parts in archive order.
    parts: Vec<(String, Vec<u8>)>,
    /// `w:document` element whose `w:body` has been emptied.
    root: XmlElement,
    relationships: Vec<Relationship>,
}

type ReadParts = (Package, Vec<Block>, Option<XmlElement>);

/// Capacity to reserve for an entry whose header claims `declared` bytes.
/// The header is untrusted, so the claim is only a bounded hint.
fn prealloc_hint(declared: u64) -> usize {
    usize::try_from(declared).unwrap_or(MAX_PREALLOC).min(MAX_PREALLOC)
}

fn malformed(part: &str, detail: impl ToString) -> Csv2DocxError {
    Csv2DocxError::MalformedDocument {
        part: part.to_string(),
        detail: detail.to_string(),
    }
}

impl Package {
    // ── Construction ─────────────────────────────────────────────────────

    pub fn blank() -> ReadParts {
        let content_types = format!(
            "{XML_DECL}<Types xmlns=\"{NS_CT}\">\
<Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/>\
<Default Extension=\"xml\" ContentType=\"application/xml\"/>\
<Override PartName=\"/{MAIN_PART}\" ContentType=\"application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml\"/>\
<Override PartName=\"/{STYLES_PART}\" ContentType=\"application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml\"/>\
</Types>"
        );
        let package_rels = format!(
            "{XML_DECL}<Relationships xmlns=\"{NS_RELS}\">\
<Relationship Id=\"rId1\" Type=\"{}\" Target=\"{MAIN_PART}\"/></Relationships>",
            rel_types::OFFICE_DOCUMENT
        );

        let root = XmlElement::new("w:document")
            .with_attr("xmlns:w", NS_W)
            .with_attr("xmlns:r", NS_R)
            .with_attr("xmlns:wp", NS_WP)
            .with_child(XmlElement::new("w:body"));

        let section = XmlElement::new("w:sectPr")
            .with_child(
                XmlElement::new("w:pgSz")
                    .with_attr("w:w", "11906")
                    .with_attr("w:h", "16838"),
            )
            .with_child(
                XmlElement::new("w:pgMar")
                    .with_attr("w:top", "1440")
                    .with_attr("w:right", "1800")
                    .with_attr("w:bottom", "1440")
                    .with_attr("w:left", "1800")
                    .with_attr("w:header", "851")
                    .with_attr("w:footer", "992")
                    .with_attr("w:gutter", "0"),
            );

        let package = Package {
            parts: vec![
                (CONTENT_TYPES_PART.to_string(), content_types.into_bytes()),
                (PACKAGE_RELS_PART.to_string(), package_rels.into_bytes()),
                (STYLES_PART.to_string(), blank_styles().into_bytes()),
            ],
            root,
            relationships: vec![Relationship {
                id: "rId1".to_string(),
                rel_type: rel_types::STYLES.to_string(),
                target: "styles.xml".to_string(),
                external: false,
            }],
        };
        (package, Vec::new(), Some(section))
    }

    pub fn read(bytes: &[u8]) -> Result<ReadParts, Csv2DocxError> {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| malformed("<zip>", e))?;

        let mut parts = Vec::with_capacity(archive.len());
        let mut main: Option<Vec<u8>> = None;
        let mut rels: Option<Vec<u8>> = None;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| malformed("<zip>", e))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let mut data = Vec::with_capacity(prealloc_hint(entry.size()));
            entry
                .read_to_end(&mut data)
                .map_err(|e| malformed(&name, e))?;
            match name.as_str() {
                MAIN_PART => main = Some(data),
                MAIN_RELS_PART => rels = Some(data),
                _ => parts.push((name, data)),
            }
        }

        let main = main.ok_or_else(|| malformed(MAIN_PART, "part is missing"))?;
        let main_text = std::str::from_utf8(&main).map_err(|e| malformed(MAIN_PART, e))?;
        let mut root = xml::parse(main_text).map_err(|e| malformed(MAIN_PART, e))?;

        let body = root
            .children
            .iter_mut()
            .find_map(|n| match n {
                XmlNode::Element(e) if e.name == "w:body" => Some(e),
                _ => None,
            })
            .ok_or_else(|| malformed(MAIN_PART, "no w:body element"))?;
        let (blocks, section) = parse_body(std::mem::take(&mut body.children));

        let mut relationships = match rels {
            Some(data) => parse_relationships(&data)?,
            None => Vec::new(),
        };

        if !parts.iter().any(|(n, _)| n == STYLES_PART) {
            parts.push((STYLES_PART.to_string(), blank_styles().into_bytes()));
        }
        if !relationships.iter().any(|r| r.rel_type == rel_types::STYLES) {
            let id = next_rel_id(&relationships);
            relationships.push(Relationship {
                id,
                rel_type: rel_types::STYLES.to_string(),
                target: "styles.xml".to_string(),
                external: false,
            });
        }

        Ok((
            Package {
                parts,
                root,
                relationships,
            },
            blocks,
            section,
        ))
    }

    // ── Parts and relationships ──────────────────────────────────────────

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn relationship(&self, id: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.id == id)
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_slice())
    }

    /// Archive name of the part a relationship of the main document targets.
    pub fn part_name_for_target(target: &str) -> String {
        match target.strip_prefix('/') {
            Some(absolute) => absolute.to_string(),
            None => format!("word/{}", target.trim_start_matches("./")),
        }
    }

    pub fn media_for(&self, rel_id: &str) -> Option<&[u8]> {
        let rel = self.relationship(rel_id)?;
        if rel.external {
            return None;
        }
        self.part(&Self::part_name_for_target(&rel.target))
    }

    /// Store an image part and return the new relationship id.
    pub fn add_media(&mut self, bytes: Vec<u8>, extension: &str) -> String {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        let taken: BTreeSet<&str> = self
            .parts
            .iter()
            .filter_map(|(n, _)| n.strip_prefix("word/media/image"))
            .filter_map(|rest| rest.split('.').next())
            .collect();
        let mut n = 1u32;
        while taken.contains(n.to_string().as_str()) {
            n += 1;
        }
        let file = format!("image{n}.{ext}");
        self.parts.push((format!("word/media/{file}"), bytes));
        self.add_relationship(rel_types::IMAGE, &format!("media/{file}"), false)
    }

    /// Add a relationship and return its id.
    pub fn add_relationship(&mut self, rel_type: &str, target: &str, external: bool) -> String {
        let id = next_rel_id(&self.relationships);
        self.relationships.push(Relationship {
            id: id.clone(),
            rel_type: rel_type.to_string(),
            target: target.to_string(),
            external,
        });
        id
    }

    // ── Writing ──────────────────────────────────────────────────────────

    pub fn write(&self, body: &[Block], section: Option<&XmlElement>) -> Result<Vec<u8>, Csv2DocxError> {
        let mut ctx = WriteContext {
            next_drawing_id: max_drawing_id(body) + 1,
        };

        let mut body_xml = String::new();
        for block in body {
            write_block(block, &mut ctx, &mut body_xml);
        }
        if let Some(sect) = section {
            sect.write_to(&mut body_xml);
        }
        let document_xml = self.document_xml(&body_xml);

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let deflated = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        let stored = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);

        let mut emit = |name: &str, data: &[u8]| -> Result<(), Csv2DocxError> {
            let opts = if name.starts_with("word/media/") {
                stored
            } else {
                deflated
            };
            writer
                .start_file(name, opts)
                .map_err(|e| malformed(name, e))?;
            writer.write_all(data).map_err(|e| malformed(name, e))
        };

        let content_types = match self.part(CONTENT_TYPES_PART) {
            Some(existing) => refresh_content_types(existing, &self.parts)?,
            None => refresh_content_types(
                format!("{XML_DECL}<Types xmlns=\"{NS_CT}\"/>").as_bytes(),
                &self.parts,
            )?,
        };
        emit(CONTENT_TYPES_PART, &content_types)?;

        for (name, data) in &self.parts {
            match name.as_str() {
                CONTENT_TYPES_PART => {}
                STYLES_PART => emit(name, &ensure_styles(data)?)?,
                _ => emit(name, data)?,
            }
        }
        emit(MAIN_PART, document_xml.as_bytes())?;
        emit(MAIN_RELS_PART, relationships_xml(&self.relationships).as_bytes())?;

        let cursor = writer.finish().map_err(|e| malformed("<zip>", e))?;
        Ok(cursor.into_inner())
    }

    fn document_xml(&self, body_xml: &str) -> String {
        let mut root = self.root.clone();
        for (prefix, ns) in [("xmlns:w", NS_W), ("xmlns:r", NS_R), ("xmlns:wp", NS_WP)] {
            if root.attr(prefix).is_none() {
                root.set_attr(prefix, ns);
            }
        }

        let mut out = String::with_capacity(body_xml.len() + 1024);
        out.push_str(XML_DECL);
        out.push('<');
        out.push_str(&root.name);
        for (k, v) in &root.attributes {
            out.push_str(&format!(" {k}=\"{}\"", escape(v.as_str())));
        }
        out.push('>');
        for node in &root.children {
            match node {
                XmlNode::Element(e) if e.name == "w:body" => {
                    out.push_str("<w:body>");
                    out.push_str(body_xml);
                    out.push_str("</w:body>");
                }
                XmlNode::Element(e) => e.write_to(&mut out),
                XmlNode::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&root.name);
        out.push('>');
        out
    }
}

fn next_rel_id(rels: &[Relationship]) -> String {
    let max = rels
        .iter()
        .filter_map(|r| r.id.strip_prefix("rId"))
        .filter_map(|n| n.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("rId{}", max + 1)
}

fn parse_relationships(data: &[u8]) -> Result<Vec<Relationship>, Csv2DocxError> {
    let text = std::str::from_utf8(data).map_err(|e| malformed(MAIN_RELS_PART, e))?;
    let root = xml::parse(text).map_err(|e| malformed(MAIN_RELS_PART, e))?;
    Ok(root
        .elements()
        .filter(|e| e.name == "Relationship")
        .filter_map(|e| {
            Some(Relationship {
                id: e.attr("Id")?.to_string(),
                rel_type: e.attr("Type")?.to_string(),
                target: e.attr("Target")?.to_string(),
                external: e.attr("TargetMode") == Some("External"),
            })
        })
        .collect())
}

fn relationships_xml(rels: &[Relationship]) -> String {
    let mut out = format!("{XML_DECL}<Relationships xmlns=\"{NS_RELS}\">");
    for r in rels {
        out.push_str(&format!(
            "<Relationship Id=\"{}\" Type=\"{}\" Target=\"{}\"{}/>",
            escape(r.id.as_str()),
            escape(r.rel_type.as_str()),
            escape(r.target.as_str()),
            if r.external { " TargetMode=\"External\"" } else { "" }
        ));
    }
    out.push_str("</Relationships>");
    out
}

// ── Body parsing ─────────────────────────────────────────────────────────

fn parse_body(children: Vec<XmlNode>) -> (Vec<Block>, Option<XmlElement>) {
    let mut blocks = Vec::new();
    let mut section = None;
    for node in children {
        let XmlNode::Element(el) = node else { continue };
        match el.name.as_str() {
            "w:sectPr" => section = Some(el),
            _ => blocks.push(parse_block(el)),
        }
    }
    (blocks, section)
}

fn parse_block(el: XmlElement) -> Block {
    match el.name.as_str() {
        "w:p" => Block::Paragraph(parse_paragraph(el)),
        "w:tbl" => Block::Table(parse_table(el)),
        _ => Block::Raw(el),
    }
}

pub(crate) fn parse_paragraph(el: XmlElement) -> Paragraph {
    let mut paragraph = Paragraph::default();
    for node in el.children {
        let XmlNode::Element(child) = node else { continue };
        let only_id_and_name = child
            .attributes
            .iter()
            .all(|(k, _)| k == "w:id" || k == "w:name");
        let id = child.attr("w:id").and_then(|v| v.parse::<u32>().ok());
        match (child.name.as_str(), id) {
            ("w:pPr", _) => paragraph.raw_props = Some(child),
            ("w:bookmarkStart", Some(id)) if only_id_and_name => {
                let name = child.attr("w:name").unwrap_or_default().to_string();
                paragraph.content.push(Inline::BookmarkStart { id, name });
            }
            ("w:bookmarkEnd", Some(id)) if only_id_and_name => {
                paragraph.content.push(Inline::BookmarkEnd { id });
            }
            _ => {
                let text = child.run_text();
                paragraph.content.push(Inline::Raw { xml: child, text });
            }
        }
    }
    paragraph
}

fn parse_table(el: XmlElement) -> Table {
    let mut table = Table::default();
    for node in el.children {
        let XmlNode::Element(child) = node else { continue };
        if child.name != "w:tr" {
            table.props.push(child);
            continue;
        }
        let mut row = TableRow::default();
        for node in child.children {
            let XmlNode::Element(cell_el) = node else { continue };
            if cell_el.name != "w:tc" {
                row.props.push(cell_el);
                continue;
            }
            let mut cell = TableCell::default();
            for node in cell_el.children {
                let XmlNode::Element(inner) = node else { continue };
                match inner.name.as_str() {
                    "w:tcPr" => cell.props = Some(inner),
                    "w:p" => cell.blocks.push(Block::Paragraph(parse_paragraph(inner))),
                    _ => cell.blocks.push(Block::Raw(inner)),
                }
            }
            row.cells.push(cell);
        }
        table.rows.push(row);
    }
    table
}

// ── Body serialization ───────────────────────────────────────────────────

struct WriteContext {
    next_drawing_id: u32,
}

fn max_drawing_id(body: &[Block]) -> u32 {
    let mut max = 0u32;
    let mut scan = |el: &XmlElement| {
        el.walk(&mut |e| {
            if e.name == "wp:docPr" {
                if let Some(id) = e.attr("id").and_then(|v| v.parse::<u32>().ok()) {
                    max = max.max(id);
                }
            }
        })
    };
    fn blocks<'a>(body: &'a [Block], out: &mut Vec<&'a XmlElement>) {
        for b in body {
            match b {
                Block::Raw(el) => out.push(el),
                Block::Paragraph(p) => {
                    for i in &p.content {
                        if let Inline::Raw { xml, .. } = i {
                            out.push(xml);
                        }
                    }
                }
                Block::Table(t) => {
                    for cell in t.rows.iter().flat_map(|r| r.cells.iter()) {
                        blocks(&cell.blocks, out);
                    }
                }
            }
        }
    }
    let mut raw = Vec::new();
    blocks(body, &mut raw);
    for el in raw {
        scan(el);
    }
    max
}

fn write_block(block: &Block, ctx: &mut WriteContext, out: &mut String) {
    match block {
        Block::Paragraph(p) => write_paragraph(p, ctx, out),
        Block::Raw(el) => el.write_to(out),
        Block::Table(t) => {
            out.push_str("<w:tbl>");
            for p in &t.props {
                p.write_to(out);
            }
            for row in &t.rows {
                out.push_str("<w:tr>");
                for p in &row.props {
                    p.write_to(out);
                }
                for cell in &row.cells {
                    out.push_str("<w:tc>");
                    if let Some(p) = &cell.props {
                        p.write_to(out);
                    }
                    for inner in &cell.blocks {
                        write_block(inner, ctx, out);
                    }
                    // A cell must end with a paragraph.
                    if !matches!(cell.blocks.last(), Some(Block::Paragraph(_))) {
                        out.push_str("<w:p/>");
                    }
                    out.push_str("</w:tc>");
                }
                out.push_str("</w:tr>");
            }
            out.push_str("</w:tbl>");
        }
    }
}

fn write_paragraph(p: &Paragraph, ctx: &mut WriteContext, out: &mut String) {
    out.push_str("<w:p>");
    match &p.raw_props {
        Some(props) => props.write_to(out),
        None => write_paragraph_props(&p.format, out),
    }
    for inline in &p.content {
        match inline {
            Inline::Run(run) => write_run(run, out),
            Inline::Picture(pic) => {
                let id = ctx.next_drawing_id;
                ctx.next_drawing_id += 1;
                write_picture(pic, id, out);
            }
            Inline::BookmarkStart { id, name } => out.push_str(&format!(
                "<w:bookmarkStart w:id=\"{id}\" w:name=\"{}\"/>",
                escape(name.as_str())
            )),
            Inline::BookmarkEnd { id } => out.push_str(&format!("<w:bookmarkEnd w:id=\"{id}\"/>")),
            Inline::Hyperlink { anchor, run } => {
                out.push_str(&format!(
                    "<w:hyperlink w:anchor=\"{}\" w:history=\"1\">",
                    escape(anchor.as_str())
                ));
                write_run(run, out);
                out.push_str("</w:hyperlink>");
            }
            Inline::Raw { xml, .. } => xml.write_to(out),
        }
    }
    out.push_str("</w:p>");
}

fn twips(pt: f32) -> i64 {
    (pt * 20.0).round() as i64
}

fn write_paragraph_props(f: &ParagraphFormat, out: &mut String) {
    let mut props = String::new();
    if let Some(style) = &f.style_id {
        props.push_str(&format!("<w:pStyle w:val=\"{}\"/>", escape(style.as_str())));
    }
    if f.space_after_pt.is_some() || f.line_spacing.is_some() {
        props.push_str("<w:spacing");
        if let Some(after) = f.space_after_pt {
            props.push_str(&format!(" w:after=\"{}\"", twips(after)));
        }
        if let Some(line) = f.line_spacing {
            props.push_str(&format!(
                " w:line=\"{}\" w:lineRule=\"auto\"",
                (line * 240.0).round() as i64
            ));
        }
        props.push_str("/>");
    }
    if let Some(indent) = f.first_line_indent_pt {
        props.push_str(&format!("<w:ind w:firstLine=\"{}\"/>", twips(indent)));
    }
    if let Some(align) = f.alignment {
        props.push_str(&format!("<w:jc w:val=\"{}\"/>", align.as_ooxml()));
    }
    if !props.is_empty() {
        out.push_str("<w:pPr>");
        out.push_str(&props);
        out.push_str("</w:pPr>");
    }
}

fn write_run(run: &Run, out: &mut String) {
    let f = &run.format;
    out.push_str("<w:r>");
    let mut props = String::new();
    if let Some(style) = &f.style_id {
        props.push_str(&format!("<w:rStyle w:val=\"{}\"/>", escape(style.as_str())));
    }
    if let Some(font) = &f.font_name {
        let font = escape(font.as_str());
        props.push_str(&format!(
            "<w:rFonts w:ascii=\"{font}\" w:hAnsi=\"{font}\" w:eastAsia=\"{font}\" w:cs=\"{font}\"/>"
        ));
    }
    match f.bold {
        Some(true) => props.push_str("<w:b/><w:bCs/>"),
        Some(false) => props.push_str("<w:b w:val=\"0\"/><w:bCs w:val=\"0\"/>"),
        None => {}
    }
    match &f.color {
        Some(RunColor::Rgb(hex)) => {
            props.push_str(&format!("<w:color w:val=\"{}\"/>", escape(hex.as_str())))
        }
        Some(RunColor::ThemeHyperlink) => {
            props.push_str("<w:color w:val=\"0563C1\" w:themeColor=\"hyperlink\"/>")
        }
        None => {}
    }
    if let Some(size) = f.font_size_pt {
        let half_points = (size * 2.0).round() as i64;
        props.push_str(&format!(
            "<w:sz w:val=\"{half_points}\"/><w:szCs w:val=\"{half_points}\"/>"
        ));
    }
    if f.underline {
        props.push_str("<w:u w:val=\"single\"/>");
    }
    if !props.is_empty() {
        out.push_str("<w:rPr>");
        out.push_str(&props);
        out.push_str("</w:rPr>");
    }
    for (i, line) in run.text.split('\n').enumerate() {
        if i > 0 {
            out.push_str("<w:br/>");
        }
        out.push_str("<w:t xml:space=\"preserve\">");
        out.push_str(&escape(line));
        out.push_str("</w:t>");
    }
    out.push_str("</w:r>");
}

fn write_picture(pic: &Picture, id: u32, out: &mut String) {
    let name = escape(pic.name.as_str());
    let rel = escape(pic.rel_id.as_str());
    let (cx, cy) = (pic.width_emu, pic.height_emu);
    out.push_str(&format!(
        "<w:r><w:drawing><wp:inline distT=\"0\" distB=\"0\" distL=\"0\" distR=\"0\">\
<wp:extent cx=\"{cx}\" cy=\"{cy}\"/>\
<wp:effectExtent l=\"0\" t=\"0\" r=\"0\" b=\"0\"/>\
<wp:docPr id=\"{id}\" name=\"Picture {id}\" descr=\"{name}\"/>\
<wp:cNvGraphicFramePr><a:graphicFrameLocks xmlns:a=\"{NS_A}\" noChangeAspect=\"1\"/></wp:cNvGraphicFramePr>\
<a:graphic xmlns:a=\"{NS_A}\"><a:graphicData uri=\"{NS_PIC}\">\
<pic:pic xmlns:pic=\"{NS_PIC}\">\
<pic:nvPicPr><pic:cNvPr id=\"0\" name=\"{name}\"/><pic:cNvPicPr/></pic:nvPicPr>\
<pic:blipFill><a:blip r:embed=\"{rel}\"/><a:stretch><a:fillRect/></a:stretch></pic:blipFill>\
<pic:spPr><a:xfrm><a:off x=\"0\" y=\"0\"/><a:ext cx=\"{cx}\" cy=\"{cy}\"/></a:xfrm>\
<a:prstGeom prst=\"rect\"><a:avLst/></a:prstGeom></pic:spPr>\
</pic:pic></a:graphicData></a:graphic></wp:inline></w:drawing></w:r>"
    ));
}

// ── Content types ────────────────────────────────────────────────────────

fn media_content_type(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        "emf" => "image/x-emf",
        "wmf" => "image/x-wmf",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn refresh_content_types(
    existing: &[u8],
    parts: &[(String, Vec<u8>)],
) -> Result<Vec<u8>, Csv2DocxError> {
    let text = std::str::from_utf8(existing).map_err(|e| malformed(CONTENT_TYPES_PART, e))?;
    let mut root = xml::parse(text).map_err(|e| malformed(CONTENT_TYPES_PART, e))?;

    let defaults: BTreeSet<String> = root
        .elements()
        .filter(|e| e.name == "Default")
        .filter_map(|e| e.attr("Extension"))
        .map(str::to_ascii_lowercase)
        .collect();
    let overrides: BTreeSet<String> = root
        .elements()
        .filter(|e| e.name == "Override")
        .filter_map(|e| e.attr("PartName"))
        .map(str::to_string)
        .collect();

    let media_exts: BTreeSet<String> = parts
        .iter()
        .filter(|(n, _)| n.starts_with("word/media/"))
        .filter_map(|(n, _)| n.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()))
        .collect();
    for ext in media_exts.difference(&defaults) {
        root.children.push(XmlNode::Element(
            XmlElement::new("Default")
                .with_attr("Extension", ext.clone())
                .with_attr("ContentType", media_content_type(ext)),
        ));
    }

    let required = [
        (
            format!("/{MAIN_PART}"),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml",
        ),
        (
            format!("/{STYLES_PART}"),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml",
        ),
    ];
    for (part, content_type) in required {
        if !overrides.contains(&part) {
            root.children.push(XmlNode::Element(
                XmlElement::new("Override")
                    .with_attr("PartName", part)
                    .with_attr("ContentType", content_type),
            ));
        }
    }

    Ok(format!("{XML_DECL}{}", root.to_xml()).into_bytes())
}

// ── Styles ───────────────────────────────────────────────────────────────

fn blank_styles() -> String {
    format!(
        "{XML_DECL}<w:styles xmlns:w=\"{NS_W}\">\
<w:docDefaults><w:rPrDefault><w:rPr>\
<w:rFonts w:ascii=\"Times New Roman\" w:hAnsi=\"Times New Roman\" w:eastAsia=\"宋体\" w:cs=\"Times New Roman\"/>\
<w:sz w:val=\"24\"/><w:szCs w:val=\"24\"/><w:lang w:val=\"en-US\" w:eastAsia=\"zh-CN\"/>\
</w:rPr></w:rPrDefault><w:pPrDefault/></w:docDefaults>\
<w:style w:type=\"paragraph\" w:default=\"1\" w:styleId=\"Normal\"><w:name w:val=\"Normal\"/><w:qFormat/></w:style>\
<w:style w:type=\"character\" w:default=\"1\" w:styleId=\"DefaultParagraphFont\"><w:name w:val=\"Default Paragraph Font\"/><w:uiPriority w:val=\"1\"/><w:semiHidden/><w:unhideWhenUsed/></w:style>\
</w:styles>"
    )
}

fn heading_style(level: u8) -> XmlElement {
    let size = match level {
        1 => "32",
        2 => "28",
        3 => "26",
        _ => "24",
    };
    XmlElement::new("w:style")
        .with_attr("w:type", "paragraph")
        .with_attr("w:styleId", format!("Heading{level}"))
        .with_child(XmlElement::new("w:name").with_attr("w:val", format!("heading {level}")))
        .with_child(XmlElement::new("w:basedOn").with_attr("w:val", "Normal"))
        .with_child(XmlElement::new("w:next").with_attr("w:val", "Normal"))
        .with_child(XmlElement::new("w:qFormat"))
        .with_child(
            XmlElement::new("w:pPr")
                .with_child(XmlElement::new("w:keepNext"))
                .with_child(
                    XmlElement::new("w:spacing")
                        .with_attr("w:before", "240")
                        .with_attr("w:after", "120"),
                )
                .with_child(
                    XmlElement::new("w:outlineLvl").with_attr("w:val", (level - 1).to_string()),
                ),
        )
        .with_child(
            XmlElement::new("w:rPr")
                .with_child(XmlElement::new("w:b"))
                .with_child(XmlElement::new("w:bCs"))
                .with_child(XmlElement::new("w:sz").with_attr("w:val", size))
                .with_child(XmlElement::new("w:szCs").with_attr("w:val", size)),
        )
}

fn hyperlink_style() -> XmlElement {
    XmlElement::new("w:style")
        .with_attr("w:type", "character")
        .with_attr("w:styleId", "Hyperlink")
        .with_child(XmlElement::new("w:name").with_attr("w:val", "Hyperlink"))
        .with_child(XmlElement::new("w:basedOn").with_attr("w:val", "DefaultParagraphFont"))
        .with_child(XmlElement::new("w:uiPriority").with_attr("w:val", "99"))
        .with_child(XmlElement::new("w:unhideWhenUsed"))
        .with_child(
            XmlElement::new("w:rPr")
                .with_child(
                    XmlElement::new("w:color")
                        .with_attr("w:val", "0563C1")
                        .with_attr("w:themeColor", "hyperlink"),
                )
                .with_child(XmlElement::new("w:u").with_attr("w:val", "single")),
        )
}

/// Add `Heading1`..`Heading9` and `Hyperlink` when the part lacks them.
fn ensure_styles(existing: &[u8]) -> Result<Vec<u8>, Csv2DocxError> {
    let text = std::str::from_utf8(existing).map_err(|e| malformed(STYLES_PART, e))?;
    let mut root = xml::parse(text).map_err(|e| malformed(STYLES_PART, e))?;
    let ids: BTreeSet<String> = root
        .elements()
        .filter(|e| e.name == "w:style")
        .filter_map(|e| e.attr("w:styleId"))
        .map(str::to_string)
        .collect();

    let mut added = false;
    for level in 1..=9u8 {
        if !ids.contains(&format!("Heading{level}")) {
            root.children.push(XmlNode::Element(heading_style(level)));
            added = true;
        }
    }
    if !ids.contains("Hyperlink") {
        root.children.push(XmlNode::Element(hyperlink_style()));
        added = true;
    }
    if !added {
        return Ok(existing.to_vec());
    }
    Ok(format!("{XML_DECL}{}", root.to_xml()).into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, ParagraphLocation};

    fn unzip(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut f = archive.by_index(i).unwrap();
                let mut data = Vec::new();
                f.read_to_end(&mut data).unwrap();
                (f.name().to_string(), data)
            })
            .collect()
    }

    fn part_text(parts: &[(String, Vec<u8>)], name: &str) -> String {
        let (_, data) = parts.iter().find(|(n, _)| n == name).unwrap();
        String::from_utf8(data.clone()).unwrap()
    }

    #[test]
    fn blank_document_round_trips() {
        let mut doc = Document::blank();
        doc.push_paragraph(Paragraph::new().with_run(Run::new("目录")));
        let bytes = doc.to_bytes().unwrap();
        let reopened = Document::from_bytes(&bytes).unwrap();
        let texts: Vec<String> = reopened.paragraphs().iter().map(|(_, p)| p.text()).collect();
        assert_eq!(texts, vec!["目录"]);
        assert!(reopened.section.is_some());
    }

    #[test]
    fn written_package_has_required_parts_and_styles() {
        let bytes = Document::blank().to_bytes().unwrap();
        let parts = unzip(&bytes);
        assert_eq!(parts[0].0, CONTENT_TYPES_PART);
        for name in [MAIN_PART, MAIN_RELS_PART, STYLES_PART, PACKAGE_RELS_PART] {
            assert!(parts.iter().any(|(n, _)| n == name), "missing {name}");
        }
        let styles = part_text(&parts, STYLES_PART);
        assert!(styles.contains("w:styleId=\"Heading1\""));
        assert!(styles.contains("w:styleId=\"Hyperlink\""));
    }

    #[test]
    fn media_parts_get_relationship_and_content_type() {
        let mut doc = Document::blank();
        let rel = doc.embed_image(vec![1, 2, 3], "png");
        assert_eq!(rel, "rId2");
        let rel2 = doc.embed_image(vec![4], "jpeg");
        assert_eq!(rel2, "rId3");
        assert_eq!(doc.media(&rel2), Some(&[4u8][..]));

        let parts = unzip(&doc.to_bytes().unwrap());
        assert!(parts.iter().any(|(n, _)| n == "word/media/image1.png"));
        assert!(parts.iter().any(|(n, _)| n == "word/media/image2.jpeg"));
        let ct = part_text(&parts, CONTENT_TYPES_PART);
        assert!(ct.contains("Extension=\"png\""));
        assert!(ct.contains("Extension=\"jpeg\""));
        let rels = part_text(&parts, MAIN_RELS_PART);
        assert!(rels.contains("Target=\"media/image1.png\""));
    }

    #[test]
    fn bookmarks_and_hyperlinks_survive_reopen() {
        let mut doc = Document::blank();
        let loc = doc.push_paragraph(Paragraph::new().with_run(Run::new("Contents")));
        doc.insert_bookmark_range(loc, "TOC_ANCHOR", None);
        let back = doc.push_paragraph(Paragraph::new().with_run(Run::new("Back")));
        doc.replace_paragraph_content_with_hyperlink(back, "TOC_ANCHOR", Run::new("Back"));

        let xml = part_text(&unzip(&doc.to_bytes().unwrap()), MAIN_PART);
        assert!(xml.contains("w:bookmarkStart w:id=\"0\" w:name=\"TOC_ANCHOR\""));
        assert!(xml.contains("w:hyperlink w:anchor=\"TOC_ANCHOR\""));

        let reopened = Document::from_bytes(&doc.to_bytes().unwrap()).unwrap();
        assert_eq!(reopened.bookmark_count("TOC_ANCHOR"), 1);
        let p = reopened.paragraph(ParagraphLocation::Body(1)).unwrap();
        assert_eq!(p.text(), "Back");
    }

    #[test]
    fn paragraph_format_is_serialized() {
        let mut doc = Document::blank();
        doc.push_paragraph(
            Paragraph::new()
                .with_format(ParagraphFormat {
                    style_id: Some("Heading2".into()),
                    alignment: Some(crate::template::Alignment::Justify),
                    first_line_indent_pt: Some(24.0),
                    line_spacing: Some(1.5),
                    space_after_pt: Some(12.0),
                })
                .with_run(Run::new("x").bold(true)),
        );
        let xml = part_text(&unzip(&doc.to_bytes().unwrap()), MAIN_PART);
        assert!(xml.contains("<w:pStyle w:val=\"Heading2\"/>"));
        assert!(xml.contains("w:after=\"240\" w:line=\"360\""));
        assert!(xml.contains("<w:ind w:firstLine=\"480\"/>"));
        assert!(xml.contains("<w:jc w:val=\"both\"/>"));
        assert!(xml.contains("<w:b/>"));

        let reopened = Document::from_bytes(&doc.to_bytes().unwrap()).unwrap();
        let (_, p) = reopened.paragraphs()[0];
        assert_eq!(p.style_id().as_deref(), Some("Heading2"));
    }

    #[test]
    fn missing_main_part_is_malformed() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("hello.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"hi").unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        let err = Document::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Csv2DocxError::MalformedDocument { ref part, .. } if part == MAIN_PART));
    }

    #[test]
    fn not_a_zip_is_malformed() {
        assert!(Document::from_bytes(b"plain text").is_err());
    }

    #[test]
    fn declared_entry_size_is_only_a_bounded_hint() {
        assert_eq!(prealloc_hint(0), 0);
        assert_eq!(prealloc_hint(4096), 4096);
        assert_eq!(prealloc_hint(u64::MAX), MAX_PREALLOC);
        assert_eq!(prealloc_hint(0xFFFF_FFF0), MAX_PREALLOC);
    }

    #[test]
    fn inflated_size_headers_do_not_reserve_their_claim() {
        let mut doc = Document::blank();
        doc.push_paragraph(Paragraph::new().with_run(Run::new("目录")));
        let mut bytes = doc.to_bytes().unwrap();
        // Central directory records: uncompressed size at offset 24.
        let mut patched = 0;
        let mut i = 0;
        while i + 28 <= bytes.len() {
            if bytes[i..i + 4] == [0x50, 0x4b, 0x01, 0x02] {
                bytes[i + 24..i + 28].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
                patched += 1;
            }
            i += 1;
        }
        assert!(patched > 0);
        match Document::from_bytes(&bytes) {
            Ok(reopened) => assert_eq!(reopened.paragraphs()[0].1.text(), "目录"),
            Err(e) => assert!(matches!(e, Csv2DocxError::MalformedDocument { .. }), "{e}"),
        }
    }
}
