//! One record set → one document.
//!
//! Generation runs in two phases:
//!
//! 1. **Async**: load the skeleton, classify every record, and resolve the
//!    image URLs in body text. Fetching is the only network I/O, so it
//!    overlaps freely with other tasks' work.
//! 2. **Blocking**: assemble paragraphs, link cross references, and append
//!    the closing document. The document tree is owned by this one closure,
//!    so no document is ever touched by two threads.
//!
//! [`convert_file`] wraps both phases with source reading and an atomic save.

use crate::config::GenerationConfig;
use crate::document::compose::{append_document_file, ComposeReport};
use crate::document::Document;
use crate::error::{Csv2DocxError, RecordError};
use crate::pipeline::assemble::{validate_blocks, DocumentAssembler, DocumentState, PreparedRecord};
use crate::pipeline::link::{BookmarkPlacement, CrossReferenceLinker};
use crate::pipeline::media::{MediaOutcome, MediaReference, MediaResolver};
use crate::pipeline::transform::{ContentBlock, ContentTransformer, HeadingKind};
use crate::record::ContentRecord;
use crate::source::read_records;
use crate::template::{TemplateDefinition, TemplateRegistry};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Counters for one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub records_total: usize,
    /// Records that produced at least one element.
    pub records_emitted: usize,
    /// Records without any content-bearing field.
    pub records_skipped: usize,
    pub records_failed: usize,
    pub images_embedded: usize,
    /// Resolved images whose local file could not be embedded.
    pub images_failed: usize,
    /// Image URLs left as literal text.
    pub images_kept_as_url: usize,
    pub hyperlinks_created: usize,
    pub end_document_appended: bool,
    pub media_duration_ms: u64,
    pub assembly_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// The finished, not yet saved, document and what went into it.
#[derive(Debug)]
pub struct GenerationOutput {
    pub document: Document,
    pub stats: GenerationStats,
    /// Records that were skipped because they could not be written.
    pub record_errors: Vec<RecordError>,
    /// Every image URL that passed the pre-filter, in record order.
    pub media: Vec<MediaReference>,
    pub bookmark: BookmarkPlacement,
    /// Present when a closing document was appended.
    pub compose: Option<ComposeReport>,
}

/// Build a document from already parsed records.
///
/// # Errors
/// Only fatal problems are returned: an unreadable skeleton or a failure to
/// set up the image fetcher. Per-record failures are collected into
/// [`GenerationOutput::record_errors`].
pub async fn generate_document(
    records: &[ContentRecord],
    template: Arc<TemplateDefinition>,
    config: &GenerationConfig,
) -> Result<GenerationOutput, Csv2DocxError> {
    let total_start = Instant::now();
    info!(
        template = %template.key,
        records = records.len(),
        "Starting generation"
    );

    // ── Step 1: Load skeleton ────────────────────────────────────────────
    let start_path = template.start_document.clone();
    let skeleton = tokio::task::spawn_blocking(move || Document::open(&start_path))
        .await
        .map_err(|e| Csv2DocxError::Internal(format!("skeleton loader panicked: {e}")))??;
    let mut state = DocumentState::new(skeleton);

    // ── Step 2: Classify records and resolve media ───────────────────────
    let transformer = ContentTransformer::new(&template);
    let resolver = MediaResolver::new(config)?;
    let media_start = Instant::now();

    let mut prepared = Vec::with_capacity(records.len());
    let mut record_errors = Vec::new();
    for (i, record) in records.iter().enumerate() {
        let index = i + 1;
        let mut blocks = transformer.transform(record, &mut state.written_heading_1);

        if let Err(detail) = validate_blocks(&blocks) {
            // A skipped record must not claim its level-1 heading.
            for block in &blocks {
                if let ContentBlock::Heading {
                    kind: HeadingKind::Heading1,
                    text,
                } = block
                {
                    state.written_heading_1.remove(text);
                }
            }
            let err = RecordError::AssemblyFailed {
                record: index,
                detail,
            };
            error!(record = index, error = %err, "record skipped");
            record_errors.push(err);
            continue;
        }

        // At most one body block per record; its markers index `media`.
        let mut media = Vec::new();
        let body = blocks.iter_mut().find_map(|block| match block {
            ContentBlock::Body { text } => Some(text),
            _ => None,
        });
        if let Some(text) = body {
            let resolved = resolver.resolve(text.as_str()).await;
            *text = resolved.text;
            media = resolved.media;
        }
        prepared.push(PreparedRecord {
            index,
            blocks,
            media,
        });
    }
    let media_duration_ms = media_start.elapsed().as_millis() as u64;
    let media: Vec<MediaReference> = prepared
        .iter()
        .flat_map(|p| p.media.iter().cloned())
        .collect();

    // ── Step 3: Assemble, link, compose ──────────────────────────────────
    let assembler = DocumentAssembler::new(Arc::clone(&template), config);
    let visible_bookmark = config.visible_bookmark;
    let tpl = Arc::clone(&template);
    let assembly_start = Instant::now();
    let (document, report, link, compose) = tokio::task::spawn_blocking(move || {
        let mut state = state;
        let report = assembler.assemble_all(&mut state, &prepared);
        let link = CrossReferenceLinker::new(&tpl, visible_bookmark).link(&mut state.document);
        let compose = match &tpl.end_document {
            Some(path) => match append_document_file(&mut state.document, path) {
                Ok(compose) => compose,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "closing document skipped");
                    None
                }
            },
            None => None,
        };
        (state.document, report, link, compose)
    })
    .await
    .map_err(|e| Csv2DocxError::Internal(format!("assembly panicked: {e}")))?;
    let assembly_duration_ms = assembly_start.elapsed().as_millis() as u64;

    // ── Step 4: Stats ────────────────────────────────────────────────────
    record_errors.extend(report.errors.iter().cloned());
    record_errors.sort_by_key(|e| match e {
        RecordError::AssemblyFailed { record, .. } => *record,
    });

    let stats = GenerationStats {
        records_total: records.len(),
        records_emitted: report.emitted,
        records_skipped: report.skipped,
        records_failed: record_errors.len(),
        images_embedded: report.images_embedded,
        images_failed: report.images_failed,
        images_kept_as_url: media
            .iter()
            .filter(|m| matches!(m.outcome, MediaOutcome::KeptOriginal { .. }))
            .count(),
        hyperlinks_created: link.links_created,
        end_document_appended: compose.is_some(),
        media_duration_ms,
        assembly_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    info!(
        template = %template.key,
        emitted = stats.records_emitted,
        skipped = stats.records_skipped,
        failed = stats.records_failed,
        images = stats.images_embedded,
        "Generation complete in {}ms",
        stats.total_duration_ms
    );

    Ok(GenerationOutput {
        document,
        stats,
        record_errors,
        media,
        bookmark: link.bookmark,
        compose,
    })
}

/// Read `source`, generate with the named template and save to `output`.
///
/// The template is resolved before the source is opened, so configuration
/// errors surface before any record is processed. The output is written
/// atomically.
pub async fn convert_file(
    source: impl AsRef<Path>,
    output: impl AsRef<Path>,
    template_name: &str,
    registry: &TemplateRegistry,
    config: &GenerationConfig,
) -> Result<GenerationStats, Csv2DocxError> {
    let template = registry.resolve(template_name)?;
    let records = read_records(source.as_ref()).await?;
    let generated = generate_document(&records, template, config).await?;

    let path = output.as_ref().to_path_buf();
    let document = generated.document;
    let save_path = path.clone();
    let staged = tokio::task::spawn_blocking(move || document.stage(&save_path))
        .await
        .map_err(|e| Csv2DocxError::Internal(format!("save panicked: {e}")))??;
    // Renamed on this task: a conversion dropped before this point (task
    // timeout) discards the staged file instead of persisting it.
    staged.commit()?;

    info!("Wrote {}", path.display());
    Ok(generated.stats)
}

/// Synchronous wrapper around [`convert_file`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_file_sync(
    source: impl AsRef<Path>,
    output: impl AsRef<Path>,
    template_name: &str,
    registry: &TemplateRegistry,
    config: &GenerationConfig,
) -> Result<GenerationStats, Csv2DocxError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Csv2DocxError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(convert_file(source, output, template_name, registry, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, Paragraph, Run};
    use std::path::PathBuf;

    fn skeleton(dir: &Path) -> PathBuf {
        let mut doc = Document::blank();
        doc.push_paragraph(Paragraph::new().with_run(Run::new("目录")));
        let path = dir.join("start.docx");
        doc.save(&path).unwrap();
        path
    }

    fn offline() -> GenerationConfig {
        GenerationConfig::builder().download_images(false).build().unwrap()
    }

    fn record(pairs: &[(&str, &str)]) -> ContentRecord {
        ContentRecord::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
    }

    fn heading_1_count(doc: &Document, text: &str) -> usize {
        doc.blocks()
            .iter()
            .filter(|b| match b {
                Block::Paragraph(p) => {
                    p.style_id().as_deref() == Some("Heading1") && p.text() == text
                }
                _ => false,
            })
            .count()
    }

    #[tokio::test]
    async fn generates_linked_document() {
        let dir = tempfile::tempdir().unwrap();
        let template = Arc::new(TemplateDefinition::new("t", skeleton(dir.path())));
        let records = vec![
            record(&[("heading_1", "A"), ("title", "one"), ("content", "正文一")]),
            record(&[("source", "only metadata")]),
            record(&[("heading_1", "A"), ("title", "two"), ("content", "正文二")]),
        ];

        let out = generate_document(&records, template, &offline()).await.unwrap();
        assert_eq!(out.stats.records_total, 3);
        assert_eq!(out.stats.records_emitted, 2);
        assert_eq!(out.stats.records_skipped, 1);
        assert_eq!(out.stats.hyperlinks_created, 2);
        assert!(!out.stats.end_document_appended);
        assert!(matches!(out.bookmark, BookmarkPlacement::Keyword(_)));
        assert_eq!(heading_1_count(&out.document, "A"), 1);
        assert_eq!(out.document.bookmark_count("TOC_ANCHOR"), 1);
    }

    #[tokio::test]
    async fn bad_record_does_not_claim_its_heading() {
        let dir = tempfile::tempdir().unwrap();
        let template = Arc::new(TemplateDefinition::new("t", skeleton(dir.path())));
        let records = vec![
            record(&[("heading_1", "A"), ("content", "bad\u{7}")]),
            record(&[("heading_1", "A"), ("content", "good")]),
        ];
        let out = generate_document(&records, template, &offline()).await.unwrap();
        assert_eq!(out.stats.records_failed, 1);
        assert!(matches!(
            out.record_errors[0],
            RecordError::AssemblyFailed { record: 1, .. }
        ));
        assert_eq!(heading_1_count(&out.document, "A"), 1);
    }

    #[tokio::test]
    async fn missing_skeleton_is_fatal() {
        let template = Arc::new(TemplateDefinition::new("t", "/no/such/start.docx"));
        let err = generate_document(&[], template, &offline()).await.unwrap_err();
        assert!(matches!(err, Csv2DocxError::DocumentOpen { .. }));
    }

    #[tokio::test]
    async fn missing_end_document_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = TemplateDefinition::new("t", skeleton(dir.path()));
        t.end_document = Some(dir.path().join("missing_end.docx"));
        let out = generate_document(&[record(&[("content", "x")])], Arc::new(t), &offline())
            .await
            .unwrap();
        assert!(!out.stats.end_document_appended);
        assert!(out.compose.is_none());
    }

    #[tokio::test]
    async fn cancelled_conversion_never_leaves_output() {
        let dir = tempfile::tempdir().unwrap();
        skeleton(dir.path());
        let registry = TemplateRegistry::from_yaml_str(
            "templates:\n  weekly:\n    name: W\n    start_template: start.docx\n    styles: {}\n",
            dir.path(),
        )
        .unwrap();
        let csv = dir.path().join("week.csv");
        let rows: String = (0..200).map(|i| format!("h{i},t{i},body {i}\n")).collect();
        std::fs::write(&csv, format!("heading_1,title,content\n{rows}")).unwrap();

        for (i, micros) in [0u64, 100, 500, 2_000, 10_000, 50_000].into_iter().enumerate() {
            let output = dir.path().join(format!("out/{i}.docx"));
            let opts = offline();
            let run = convert_file(&csv, &output, "weekly", &registry, &opts);
            match tokio::time::timeout(std::time::Duration::from_micros(micros), run).await {
                Ok(result) => {
                    result.unwrap();
                    assert!(output.exists());
                }
                Err(_) => {
                    // Let any blocking work still in flight finish.
                    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                    assert!(!output.exists(), "cancelled run wrote {}", output.display());
                }
            }
        }
    }
}
