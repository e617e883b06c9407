//! Document assembler: append content blocks to the document as styled
//! paragraphs and pictures.
//!
//! Runs on a blocking thread. Each record is validated before anything is
//! appended, so a failed record leaves no partial output behind; the failure
//! is recorded as a [`RecordError`] and assembly moves on.

use crate::config::{GenerationConfig, InlineHeadingPolicy};
use crate::document::{
    Document, Inline, Paragraph, ParagraphFormat, Picture, Run, RunColor, RunFormat,
    EMU_PER_INCH,
};
use crate::error::{Csv2DocxError, RecordError};
use crate::pipeline::media::{split_media_markers, MarkerPiece, MediaOutcome, MediaReference};
use crate::pipeline::text::{
    looks_like_inline_heading, normalize_whitespace, parse_emphasis, split_paragraph_lines,
};
use crate::pipeline::transform::{ContentBlock, HeadingKind};
use crate::template::{
    heading_level, parse_color, Alignment, ImageStyle, StyleRule, TemplateDefinition, DEFAULT_FONT,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Points per character of first-line indent.
const PT_PER_INDENT_CHAR: f32 = 12.0;

/// The document being built plus the level-1 headings already written.
#[derive(Debug)]
pub struct DocumentState {
    pub document: Document,
    pub written_heading_1: HashSet<String>,
}

impl DocumentState {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            written_heading_1: HashSet::new(),
        }
    }

    /// Start from the template's skeleton document.
    pub fn from_template(template: &TemplateDefinition) -> Result<Self, Csv2DocxError> {
        Ok(Self::new(Document::open(&template.start_document)?))
    }
}

/// One record after transformation and media resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    /// Position in the source, 1-based.
    pub index: usize,
    pub blocks: Vec<ContentBlock>,
    /// Media of the body block; marker `i` in the body text is `media[i]`.
    pub media: Vec<MediaReference>,
}

/// What one record contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordAssembly {
    pub paragraphs: usize,
    pub images_embedded: usize,
    pub images_failed: usize,
}

/// Totals over a whole record set.
#[derive(Debug, Clone, Default)]
pub struct AssemblyReport {
    pub emitted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub images_embedded: usize,
    pub images_failed: usize,
    pub errors: Vec<RecordError>,
}

/// Appends [`ContentBlock`]s using one template's styles.
#[derive(Debug, Clone)]
pub struct DocumentAssembler {
    template: Arc<TemplateDefinition>,
    image_dpi: f32,
    inline_heading: InlineHeadingPolicy,
}

impl DocumentAssembler {
    pub fn new(template: Arc<TemplateDefinition>, config: &GenerationConfig) -> Self {
        Self {
            template,
            image_dpi: config.image_dpi,
            inline_heading: config.inline_heading.clone(),
        }
    }

    /// Assemble every record in order. Failed records are logged and
    /// collected; they never stop the loop.
    pub fn assemble_all(&self, state: &mut DocumentState, records: &[PreparedRecord]) -> AssemblyReport {
        let mut report = AssemblyReport::default();
        for record in records {
            if record.blocks.is_empty() {
                report.skipped += 1;
                continue;
            }
            match self.assemble_record(state, record) {
                Ok(done) => {
                    report.emitted += 1;
                    report.images_embedded += done.images_embedded;
                    report.images_failed += done.images_failed;
                }
                Err(e) => {
                    error!(record = record.index, error = %e, "record skipped");
                    report.failed += 1;
                    report.errors.push(e);
                }
            }
        }
        report
    }

    /// Append one record's blocks.
    pub fn assemble_record(
        &self,
        state: &mut DocumentState,
        record: &PreparedRecord,
    ) -> Result<RecordAssembly, RecordError> {
        validate_blocks(&record.blocks).map_err(|detail| RecordError::AssemblyFailed {
            record: record.index,
            detail,
        })?;

        let mut done = RecordAssembly::default();
        let doc = &mut state.document;
        for block in &record.blocks {
            match block {
                ContentBlock::Heading { kind, text } => {
                    doc.push_paragraph(self.heading(*kind, text));
                    done.paragraphs += 1;
                }
                ContentBlock::Body { text } => self.body(doc, text, &record.media, &mut done),
                ContentBlock::SourceDate { source, date } => {
                    if let Some(p) = self.source_date(source.as_deref(), date.as_deref()) {
                        doc.push_paragraph(p);
                        done.paragraphs += 1;
                    }
                }
                ContentBlock::ReturnPlaceholder => {
                    doc.push_paragraph(self.return_placeholder());
                    done.paragraphs += 1;
                }
            }
        }
        debug!(record = record.index, paragraphs = done.paragraphs, "record assembled");
        Ok(done)
    }

    // ── Headings ──────────────────────────────────────────────────────────

    fn heading(&self, kind: HeadingKind, text: &str) -> Paragraph {
        let styles = &self.template.styles;
        let rule = match kind {
            HeadingKind::Heading1 => styles.heading_1.as_ref(),
            HeadingKind::Heading2 => styles.heading_2.as_ref(),
            HeadingKind::Heading3 => styles.heading_3.as_ref(),
            HeadingKind::Title => styles.title.as_ref(),
        };
        let mut format = rule.map(paragraph_format).unwrap_or_default();
        format.style_id = heading_level(kind.as_str(), &self.template.heading_levels)
            .map(|level| format!("Heading{level}"));
        let run = Run::new(text).with_format(rule.map(run_format).unwrap_or_default());
        Paragraph::new().with_format(format).with_run(run)
    }

    // ── Body ──────────────────────────────────────────────────────────────

    fn body(
        &self,
        doc: &mut Document,
        text: &str,
        media: &[MediaReference],
        done: &mut RecordAssembly,
    ) {
        let rule = self.template.styles.content.as_ref();
        let format = rule.map(paragraph_format).unwrap_or_default();
        let run_fmt = rule.map(run_format).unwrap_or_default();

        for line in split_paragraph_lines(&normalize_whitespace(text)) {
            for piece in split_media_markers(&line) {
                match piece {
                    MarkerPiece::Text(t) => {
                        let t = t.trim();
                        if t.is_empty() {
                            continue;
                        }
                        doc.push_paragraph(self.text_paragraph(t, &format, &run_fmt));
                        done.paragraphs += 1;
                    }
                    MarkerPiece::Media(index) => {
                        let path = match media.get(index) {
                            Some(MediaReference {
                                local_path: Some(path),
                                outcome: MediaOutcome::Resolved,
                                ..
                            }) => path,
                            _ => {
                                warn!(index, "marker without a resolved image, dropped");
                                continue;
                            }
                        };
                        let p = match self.picture_paragraph(doc, path) {
                            Ok(p) => {
                                done.images_embedded += 1;
                                p
                            }
                            Err(e) => {
                                error!(path = %path.display(), error = %e, "image could not be embedded");
                                done.images_failed += 1;
                                let name = path
                                    .file_name()
                                    .map(|n| n.to_string_lossy().into_owned())
                                    .unwrap_or_else(|| "unknown image".to_string());
                                Paragraph::new()
                                    .with_run(Run::new(format!("[image failed to load: {name}]")))
                            }
                        };
                        doc.push_paragraph(p);
                        done.paragraphs += 1;
                    }
                }
            }
        }
    }

    fn text_paragraph(&self, line: &str, format: &ParagraphFormat, run_fmt: &RunFormat) -> Paragraph {
        let mut p = Paragraph::new().with_format(format.clone());
        if line.contains('*') {
            for seg in parse_emphasis(line) {
                let mut f = run_fmt.clone();
                if seg.bold {
                    f.bold = Some(true);
                }
                p.push(Inline::Run(Run::new(seg.text).with_format(f)));
            }
        } else {
            let mut f = run_fmt.clone();
            if looks_like_inline_heading(line, &self.inline_heading) {
                f.bold = Some(true);
            }
            p.push(Inline::Run(Run::new(line).with_format(f)));
        }
        p
    }

    fn picture_paragraph(&self, doc: &mut Document, path: &Path) -> Result<Paragraph, String> {
        let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
        let (width_px, height_px) = image::load_from_memory(&bytes)
            .map(|img| (img.width(), img.height()))
            .map_err(|e| e.to_string())?;
        let (w_in, h_in) = fit_image(width_px, height_px, self.image_dpi, &self.template.styles.image);

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "png".to_string());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rel_id = doc.embed_image(bytes, &ext);
        debug!(path = %path.display(), w_in, h_in, "embedded picture");

        let mut p = Paragraph::new().with_format(ParagraphFormat {
            alignment: Some(self.template.styles.image.alignment),
            ..Default::default()
        });
        p.push(Inline::Picture(Picture {
            rel_id,
            name,
            width_emu: (w_in * EMU_PER_INCH).round() as u64,
            height_emu: (h_in * EMU_PER_INCH).round() as u64,
        }));
        Ok(p)
    }

    // ── Source / date ─────────────────────────────────────────────────────

    fn source_date(&self, source: Option<&str>, date: Option<&str>) -> Option<Paragraph> {
        let text = match (source, date) {
            (Some(s), Some(d)) => format!("{s} {d}"),
            (Some(s), None) => s.to_string(),
            (None, Some(d)) => return Some(date_only_paragraph(d)),
            (None, None) => return None,
        };
        let styles = &self.template.styles;
        let rule = styles.source_date.as_ref().or(styles.content.as_ref());
        let format = match rule {
            Some(r) => paragraph_format(r),
            None => ParagraphFormat {
                space_after_pt: Some(12.0),
                ..Default::default()
            },
        };
        let mut run_fmt = rule.map(run_format).unwrap_or_default();
        run_fmt.font_name.get_or_insert_with(|| DEFAULT_FONT.to_string());
        run_fmt.font_size_pt.get_or_insert(12.0);
        Some(Paragraph::new().with_format(format).with_run(Run::new(text).with_format(run_fmt)))
    }

    // ── Return placeholder ────────────────────────────────────────────────

    fn return_placeholder(&self) -> Paragraph {
        let link = &self.template.return_link;
        let format = ParagraphFormat {
            alignment: Some(link.alignment),
            line_spacing: Some(1.0),
            space_after_pt: Some(12.0),
            ..Default::default()
        };
        let run_fmt = RunFormat {
            font_name: Some(link.font_name.clone()),
            font_size_pt: Some(link.font_size),
            underline: link.underline,
            color: link.color.as_deref().and_then(parse_color).map(RunColor::Rgb),
            ..Default::default()
        };
        Paragraph::new()
            .with_format(format)
            .with_run(Run::new(link.text.clone()).with_format(run_fmt))
    }
}

fn date_only_paragraph(date: &str) -> Paragraph {
    let format = ParagraphFormat {
        alignment: Some(Alignment::Justify),
        first_line_indent_pt: Some(24.0),
        space_after_pt: Some(12.0),
        ..Default::default()
    };
    let run_fmt = RunFormat {
        font_name: Some("Times New Roman".to_string()),
        font_size_pt: Some(12.0),
        ..Default::default()
    };
    Paragraph::new()
        .with_format(format)
        .with_run(Run::new(date.trim()).with_format(run_fmt))
}

/// Display size in inches: native size at `dpi`, shrunk to the maximum width
/// first and then, if still too tall, to the maximum height.
pub fn fit_image(width_px: u32, height_px: u32, dpi: f32, style: &ImageStyle) -> (f64, f64) {
    let dpi = f64::from(dpi);
    let w = f64::from(width_px) / dpi;
    let h = f64::from(height_px) / dpi;
    let aspect = if h > 0.0 { w / h } else { 1.0 };
    let mut disp_w = w.min(f64::from(style.max_width));
    let mut disp_h = if aspect > 0.0 { disp_w / aspect } else { h };
    if disp_h > f64::from(style.max_height) {
        disp_h = f64::from(style.max_height);
        disp_w = disp_h * aspect;
    }
    (disp_w, disp_h)
}

pub(crate) fn paragraph_format(rule: &StyleRule) -> ParagraphFormat {
    ParagraphFormat {
        style_id: None,
        alignment: rule.alignment,
        first_line_indent_pt: rule.first_line_indent.map(|c| c * PT_PER_INDENT_CHAR),
        line_spacing: rule.line_spacing,
        space_after_pt: rule.space_after,
    }
}

pub(crate) fn run_format(rule: &StyleRule) -> RunFormat {
    let color = rule.color.as_deref().and_then(|c| {
        let parsed = parse_color(c);
        if parsed.is_none() {
            warn!(color = c, "unrecognised color ignored");
        }
        parsed
    });
    RunFormat {
        font_name: rule.font_name.clone(),
        font_size_pt: rule.font_size,
        bold: rule.bold,
        color: color.map(RunColor::Rgb),
        ..Default::default()
    }
}

/// XML 1.0 forbids most C0 controls and U+FFFE/U+FFFF.
fn forbidden_char(text: &str) -> Option<char> {
    text.chars().find(|&c| {
        (c < '\u{20}' && !matches!(c, '\t' | '\n' | '\r')) || c == '\u{FFFE}' || c == '\u{FFFF}'
    })
}

/// Check that every block can be written; reports the first offending field.
pub fn validate_blocks(blocks: &[ContentBlock]) -> Result<(), String> {
    blocks.iter().try_for_each(check_block)
}

fn check_block(block: &ContentBlock) -> Result<(), String> {
    let texts: Vec<(&str, &str)> = match block {
        ContentBlock::Heading { kind, text } => vec![(kind.as_str(), text.as_str())],
        ContentBlock::Body { text } => vec![("content", text.as_str())],
        ContentBlock::SourceDate { source, date } => source
            .iter()
            .map(|s| ("source", s.as_str()))
            .chain(date.iter().map(|d| ("date", d.as_str())))
            .collect(),
        ContentBlock::ReturnPlaceholder => Vec::new(),
    };
    for (field, text) in texts {
        if let Some(c) = forbidden_char(text) {
            return Err(format!(
                "field `{field}` contains U+{:04X}, which a document cannot hold",
                c as u32
            ));
        }
    }
    Ok(())
}
