//! # csv2docx
//!
//! Turn tabular records into styled Word documents, with remote images
//! embedded and every "return to index" line linked back to the index.
//!
//! ## Why this crate?
//!
//! Weekly digests and briefings are often collected in a spreadsheet: one row
//! per item, with a section heading, a title, free body text that pastes in
//! image URLs, a source and a date. Turning that into a house-style Word
//! document by hand means restyling every paragraph, downloading every
//! picture and wiring up internal links. This crate does it from a template
//! configuration: the skeleton document, the per-kind style rules, and the
//! closing boilerplate.
//!
//! ## Pipeline Overview
//!
//! ```text
//! CSV
//!  │
//!  ├─ 1. Read       decode (utf-8 → gbk), parse records
//!  ├─ 2. Template   resolve the named template, open its skeleton
//!  ├─ 3. Transform  fields → heading / body / source-date / placeholder blocks
//!  ├─ 4. Media      image URLs → fetch with retry → PNG/JPEG → local markers
//!  ├─ 5. Assemble   styled paragraphs and pictures (spawn_blocking)
//!  ├─ 6. Link       index bookmark + return-to-index hyperlinks
//!  ├─ 7. Compose    append the closing document
//!  └─ 8. Save       atomic write of the .docx
//! ```
//!
//! Many conversions can run side by side through
//! [`orchestrator::TaskOrchestrator`]: bounded concurrency, per-task timeout,
//! bounded retry and progress events.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use csv2docx::{convert_file, GenerationConfig, TemplateRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = TemplateRegistry::from_path("templates_config.yaml")?;
//!     let config = GenerationConfig::default();
//!     let stats = convert_file("week.csv", "week.docx", "weekly", &registry, &config).await?;
//!     eprintln!(
//!         "{} records, {} images, {} links",
//!         stats.records_emitted, stats.images_embedded, stats.hyperlinks_created
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `csv2docx` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! csv2docx = { version = "0.3", default-features = false }
//! ```
//!
//! ## Record Fields
//!
//! | Column | Becomes |
//! |--------|---------|
//! | `heading_1` | level-1 heading, written once per document |
//! | `heading_2` | level-2 heading |
//! | `heading_3` / `title` | level-3 heading; `title` is decorated as `【…】` |
//! | `content` | body paragraphs, images, bold emphasis |
//! | `source`, `date` | one attribution line |
//!
//! A row with none of `heading_*`, `title` or `content` is skipped.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod generate;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod source;
pub mod template;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    GenerationConfig, GenerationConfigBuilder, InlineHeadingPolicy, OrchestratorConfig,
    OrchestratorConfigBuilder,
};
pub use document::Document;
pub use error::{Csv2DocxError, RecordError};
pub use generate::{convert_file, convert_file_sync, generate_document, GenerationOutput, GenerationStats};
pub use orchestrator::{
    BatchSummary, ConversionTask, FileTaskRunner, TaskId, TaskOrchestrator, TaskRunner, TaskStatus,
};
pub use pipeline::fetch::{FetchError, FetchedImage, HttpImageFetcher, ImageFetcher};
pub use pipeline::media::{MediaNameGenerator, SequentialNameGenerator, TimestampNameGenerator};
pub use progress::{NoopTaskProgress, ProgressCallback, TaskEvent, TaskEventKind, TaskProgressCallback};
pub use record::{ContentRecord, FieldValue};
pub use source::read_records;
pub use template::{TemplateDefinition, TemplateRegistry};
