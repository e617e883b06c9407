//! End-to-end tests of the generation pipeline.
//!
//! Everything runs offline: skeleton and closing documents are built in a
//! temp directory and image downloads go through an in-memory fetcher.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use csv2docx::document::{Block, Paragraph, Run};
use csv2docx::{
    convert_file, generate_document, ContentRecord, Csv2DocxError, Document, FetchError,
    FetchedImage, GenerationConfig, ImageFetcher, SequentialNameGenerator, TemplateDefinition,
    TemplateRegistry,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Route library logs to the test harness; `RUST_LOG=debug` to see them.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serves one PNG for every URL and counts requests.
struct PngFetcher {
    png: Vec<u8>,
    calls: AtomicUsize,
}

impl PngFetcher {
    fn new() -> Arc<Self> {
        let img = RgbImage::from_fn(120, 80, |x, y| Rgb([(x * 2) as u8, (y * 3) as u8, 90]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Arc::new(Self {
            png: out.into_inner(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ImageFetcher for PngFetcher {
    async fn fetch(&self, _url: &str, _attempt: u32, _timeout: Duration) -> Result<FetchedImage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FetchedImage {
            content_type: Some("image/png".into()),
            bytes: self.png.clone(),
        })
    }
}

fn save_doc(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let mut doc = Document::blank();
    for line in lines {
        doc.push_paragraph(Paragraph::new().with_run(Run::new(*line)));
    }
    let path = dir.join(name);
    doc.save(&path).unwrap();
    path
}

fn record(pairs: &[(&str, &str)]) -> ContentRecord {
    ContentRecord::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
}

fn offline_config() -> GenerationConfig {
    GenerationConfig::builder()
        .download_images(false)
        .build()
        .unwrap()
}

fn fetching_config(fetcher: Arc<PngFetcher>, scratch: &Path) -> GenerationConfig {
    GenerationConfig::builder()
        .scratch_dir(scratch)
        .retry_backoff_ms(0)
        .fetcher(fetcher)
        .name_generator(Arc::new(SequentialNameGenerator::new("img_")))
        .build()
        .unwrap()
}

fn body_paragraphs(doc: &Document) -> Vec<&Paragraph> {
    doc.blocks()
        .iter()
        .filter_map(|b| match b {
            Block::Paragraph(p) => Some(p),
            _ => None,
        })
        .collect()
}

// ── Scenario A: level-1 headings are written once ────────────────────────────

#[tokio::test]
async fn test_repeated_heading_1_written_once() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let start = save_doc(dir.path(), "start.docx", &["目录"]);
    let template = Arc::new(TemplateDefinition::new("weekly", start));
    let records = vec![
        record(&[("heading_1", "A"), ("title", "first"), ("content", "one")]),
        record(&[("heading_2", "B"), ("content", "two")]),
        record(&[("heading_1", "A"), ("title", "third"), ("content", "three")]),
    ];

    let out = generate_document(&records, template, &offline_config())
        .await
        .unwrap();

    let h1: Vec<String> = body_paragraphs(&out.document)
        .into_iter()
        .filter(|p| p.style_id().as_deref() == Some("Heading1"))
        .map(|p| p.text())
        .collect();
    assert_eq!(h1, vec!["A".to_string()]);
    assert_eq!(out.stats.records_emitted, 3);
    assert_eq!(out.stats.hyperlinks_created, 3);
}

// ── Scenario B: inline image replaces its URL ────────────────────────────────

#[tokio::test]
async fn test_image_url_becomes_inline_picture() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let start = save_doc(dir.path(), "start.docx", &["目录"]);
    let template = Arc::new(TemplateDefinition::new("weekly", start));
    let fetcher = PngFetcher::new();
    let config = fetching_config(Arc::clone(&fetcher), &dir.path().join("images"));

    let records = vec![record(&[("content", "see (http://cdn.example.com/pic.jpg).")])];
    let out = generate_document(&records, template, &config).await.unwrap();

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(out.stats.images_embedded, 1);
    assert_eq!(out.media.len(), 1);
    assert_eq!(out.media[0].url, "http://cdn.example.com/pic.jpg");

    let paragraphs = body_paragraphs(&out.document);
    assert!(paragraphs.iter().all(|p| !p.text().contains("http")));
    let pic_at = paragraphs
        .iter()
        .position(|p| p.pictures().count() == 1)
        .expect("picture paragraph");
    let after = paragraphs[pic_at + 1].text();
    assert_eq!(after, ").");
    let pic = paragraphs[pic_at].pictures().next().unwrap();
    assert!(out.document.media(&pic.rel_id).is_some());
}

#[tokio::test]
async fn test_disabled_downloads_keep_url_text() {
    let dir = tempfile::tempdir().unwrap();
    let start = save_doc(dir.path(), "start.docx", &["目录"]);
    let template = Arc::new(TemplateDefinition::new("weekly", start));

    let records = vec![record(&[("content", "see http://cdn.example.com/pic.jpg")])];
    let out = generate_document(&records, template, &offline_config())
        .await
        .unwrap();

    assert_eq!(out.stats.images_embedded, 0);
    assert!(body_paragraphs(&out.document)
        .iter()
        .any(|p| p.text().contains("http://cdn.example.com/pic.jpg")));
}

#[tokio::test]
async fn test_scratch_dir_with_repeated_spaces_still_embeds() {
    let dir = tempfile::tempdir().unwrap();
    let start = save_doc(dir.path(), "start.docx", &["目录"]);
    let template = Arc::new(TemplateDefinition::new("weekly", start));
    let fetcher = PngFetcher::new();
    let config = fetching_config(Arc::clone(&fetcher), &dir.path().join("media  cache"));

    let records = vec![record(&[("content", "a\t\tb http://cdn.example.com/pic.png  c")])];
    let out = generate_document(&records, template, &config).await.unwrap();

    assert_eq!(out.stats.images_embedded, 1);
    let texts: Vec<String> = body_paragraphs(&out.document).iter().map(|p| p.text()).collect();
    assert!(texts.iter().all(|t| !t.contains("failed to load")), "{texts:?}");
    assert_eq!(
        body_paragraphs(&out.document)
            .iter()
            .map(|p| p.pictures().count())
            .sum::<usize>(),
        1
    );
}

#[tokio::test]
async fn test_literal_image_text_is_not_embedded() {
    let dir = tempfile::tempdir().unwrap();
    let start = save_doc(dir.path(), "start.docx", &["目录"]);
    let template = Arc::new(TemplateDefinition::new("weekly", start));
    let private = dir.path().join("private.png");
    std::fs::write(&private, &PngFetcher::new().png).unwrap();

    let content = format!("literal text [image: {}] end", private.display());
    let records = vec![record(&[("content", content.as_str())])];
    let out = generate_document(&records, template, &offline_config())
        .await
        .unwrap();

    assert_eq!(out.stats.images_embedded, 0);
    let paragraphs = body_paragraphs(&out.document);
    assert!(paragraphs.iter().all(|p| p.pictures().count() == 0));
    assert!(paragraphs.iter().any(|p| p.text() == content));
}

// ── Scenario D: configuration is validated at load time ──────────────────────

#[test]
fn test_missing_styles_rejected_at_load() {
    let yaml = r#"
templates:
  good:
    name: Good
    start_template: start.docx
    styles: {}
  broken:
    name: Broken
    start_template: start.docx
"#;
    let err = TemplateRegistry::from_yaml_str(yaml, Path::new(".")).unwrap_err();
    match err {
        Csv2DocxError::InvalidTemplateConfig { template, key } => {
            assert_eq!(template, "broken");
            assert_eq!(key, "styles");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unknown_template_fails_before_reading_source() {
    let registry = TemplateRegistry::from_yaml_str(
        "templates:\n  weekly:\n    name: W\n    start_template: s.docx\n    styles: {}\n",
        Path::new("."),
    )
    .unwrap();
    let err = convert_file(
        "/no/such/input.csv",
        "/no/such/out.docx",
        "monthly",
        &registry,
        &offline_config(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Csv2DocxError::UnknownTemplate { .. }));
}

// ── Cross references ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_only_exact_placeholders_are_linked() {
    let dir = tempfile::tempdir().unwrap();
    let start = save_doc(dir.path(), "start.docx", &["封面", "目录", "返回目录 (skeleton text)"]);
    let template = Arc::new(TemplateDefinition::new("weekly", start));
    let records = vec![
        record(&[("title", "one"), ("content", "返回目录 is not a link")]),
        record(&[("title", "two"), ("content", "plain")]),
    ];

    let out = generate_document(&records, template, &offline_config())
        .await
        .unwrap();
    assert_eq!(out.stats.hyperlinks_created, 2);

    let paragraphs = body_paragraphs(&out.document);
    let linked: Vec<&&Paragraph> = paragraphs
        .iter()
        .filter(|p| p.hyperlinks().count() > 0)
        .collect();
    assert_eq!(linked.len(), 2);
    for p in &linked {
        let (anchor, run) = p.hyperlinks().next().unwrap();
        assert_eq!(anchor, "TOC_ANCHOR");
        assert_eq!(run.text, "返回目录");
    }
    assert!(paragraphs
        .iter()
        .any(|p| p.text() == "返回目录 is not a link" && p.hyperlinks().count() == 0));
    assert_eq!(out.document.bookmark_count("TOC_ANCHOR"), 1);
}

// ── Full file conversion ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_convert_file_with_closing_document() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    save_doc(dir.path(), "start.docx", &["周报", "目录"]);
    save_doc(dir.path(), "end.docx", &["免责声明"]);
    let config_path = dir.path().join("templates_config.yaml");
    std::fs::write(
        &config_path,
        r#"
templates:
  weekly:
    name: Weekly digest
    start_template: start.docx
    end_template: end.docx
    styles:
      heading_1: { alignment: center, font_size: 16, bold: true }
      content: { first_line_indent: 2, line_spacing: 1.5 }
"#,
    )
    .unwrap();
    let csv = dir.path().join("week.csv");
    std::fs::write(
        &csv,
        "heading_1,title,content,source,date\n\
         市场,新品发布,正文第一段,新华社,2024-05-01\n\
         市场,,,,\n\
         市场,行业观察,正文第二段,,2024-05-02\n",
    )
    .unwrap();

    let registry = TemplateRegistry::from_path(&config_path).unwrap();
    let output = dir.path().join("out/week.docx");
    let stats = convert_file(&csv, &output, "weekly", &registry, &offline_config())
        .await
        .unwrap();

    assert_eq!(stats.records_total, 3);
    // Row 2 only repeats a written heading, so it produces nothing.
    assert_eq!(stats.records_emitted, 2);
    assert_eq!(stats.records_skipped, 1);
    assert_eq!(stats.hyperlinks_created, 2);
    assert!(stats.end_document_appended);

    let saved = Document::open(&output).unwrap();
    let paragraphs = body_paragraphs(&saved);
    assert_eq!(paragraphs.first().unwrap().text(), "周报");
    assert_eq!(paragraphs.last().unwrap().text(), "免责声明");
    assert_eq!(
        paragraphs
            .iter()
            .filter(|p| p.style_id().as_deref() == Some("Heading1"))
            .count(),
        1
    );
    assert_eq!(saved.bookmark_count("TOC_ANCHOR"), 1);
}

#[tokio::test]
async fn test_missing_source_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TemplateRegistry::from_yaml_str(
        "templates:\n  weekly:\n    name: W\n    start_template: s.docx\n    styles: {}\n",
        dir.path(),
    )
    .unwrap();
    let err = convert_file(
        dir.path().join("gone.csv"),
        dir.path().join("out.docx"),
        "weekly",
        &registry,
        &offline_config(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Csv2DocxError::SourceNotFound { .. }));
}
