//! Runtime configuration for document generation and task orchestration.
//!
//! Template-specific styling lives in [`crate::template`]; this module holds
//! the knobs that are independent of any one template: media download
//! behaviour, image sizing constants, the inline-heading heuristic, and the
//! orchestrator's concurrency and retry ceilings.

use crate::error::Csv2DocxError;
use crate::pipeline::fetch::ImageFetcher;
use crate::pipeline::media::MediaNameGenerator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Hard ceiling on fetch attempts per image URL.
pub const MAX_FETCH_ATTEMPTS: u32 = 5;

/// Configuration for one record-set → document generation.
///
/// Built via [`GenerationConfig::builder()`] or [`GenerationConfig::default()`].
///
/// # Example
/// ```rust
/// use csv2docx::GenerationConfig;
///
/// let config = GenerationConfig::builder()
///     .scratch_dir("/tmp/csv2docx-media")
///     .max_fetch_attempts(3)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_fetch_attempts, 3);
/// ```
#[derive(Clone)]
pub struct GenerationConfig {
    /// Directory receiving downloaded images. Default: `temp-images`.
    ///
    /// Shared by concurrent tasks; file names are generated per fetch so no
    /// locking is needed. Files are not removed by this crate.
    pub scratch_dir: PathBuf,

    /// Resolve image URLs found in body text. Default: true.
    ///
    /// When false, URLs stay as literal text and no network call is made.
    pub download_images: bool,

    /// Attempts per image URL, 1–5. Default: 5.
    pub max_fetch_attempts: u32,

    /// Base delay before the second attempt, doubled after each further
    /// attempt, plus 10–30 % jitter. Default: 1000.
    pub retry_backoff_ms: u64,

    /// Upper bound on a single backoff delay. Default: 60 000.
    pub max_backoff_ms: u64,

    /// Timeout of the first fetch attempt in seconds. Default: 20.
    pub fetch_timeout_secs: u64,

    /// Extra seconds added to the timeout on each further attempt. Default: 10.
    pub fetch_timeout_step_secs: u64,

    /// Payloads smaller than this are treated as failed fetches. Default: 100.
    pub min_image_bytes: usize,

    /// Images narrower or shorter than this (px) are treated as failed fetches. Default: 10.
    pub min_image_dimension: u32,

    /// Pixels per inch used to derive an image's native size. Default: 96.
    pub image_dpi: f32,

    /// Quality used when an image is re-encoded as JPEG. Default: 95.
    pub jpeg_quality: u8,

    /// Insert a visible `[BOOKMARK]` marker next to the anchor. Default: false.
    pub visible_bookmark: bool,

    /// Thresholds of the "looks like an inline heading" check.
    pub inline_heading: InlineHeadingPolicy,

    /// Custom image fetcher. If None, an HTTP fetcher is built.
    pub fetcher: Option<Arc<dyn ImageFetcher>>,

    /// Custom media file-name generator. If None, time + random names are used.
    pub name_generator: Option<Arc<dyn MediaNameGenerator>>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("temp-images"),
            download_images: true,
            max_fetch_attempts: MAX_FETCH_ATTEMPTS,
            retry_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            fetch_timeout_secs: 20,
            fetch_timeout_step_secs: 10,
            min_image_bytes: 100,
            min_image_dimension: 10,
            image_dpi: 96.0,
            jpeg_quality: 95,
            visible_bookmark: false,
            inline_heading: InlineHeadingPolicy::default(),
            fetcher: None,
            name_generator: None,
        }
    }
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("scratch_dir", &self.scratch_dir)
            .field("download_images", &self.download_images)
            .field("max_fetch_attempts", &self.max_fetch_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("image_dpi", &self.image_dpi)
            .field("visible_bookmark", &self.visible_bookmark)
            .field("inline_heading", &self.inline_heading)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "<dyn ImageFetcher>"))
            .field(
                "name_generator",
                &self.name_generator.as_ref().map(|_| "<dyn MediaNameGenerator>"),
            )
            .finish()
    }
}

impl GenerationConfig {
    /// Create a new builder for `GenerationConfig`.
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`GenerationConfig`].
#[derive(Debug)]
pub struct GenerationConfigBuilder {
    config: GenerationConfig,
}

impl GenerationConfigBuilder {
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = dir.into();
        self
    }

    pub fn download_images(mut self, v: bool) -> Self {
        self.config.download_images = v;
        self
    }

    pub fn max_fetch_attempts(mut self, n: u32) -> Self {
        self.config.max_fetch_attempts = n.clamp(1, MAX_FETCH_ATTEMPTS);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs.max(1);
        self
    }

    pub fn fetch_timeout_step_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_step_secs = secs;
        self
    }

    pub fn min_image_bytes(mut self, n: usize) -> Self {
        self.config.min_image_bytes = n;
        self
    }

    pub fn min_image_dimension(mut self, px: u32) -> Self {
        self.config.min_image_dimension = px;
        self
    }

    pub fn image_dpi(mut self, dpi: f32) -> Self {
        self.config.image_dpi = dpi;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn visible_bookmark(mut self, v: bool) -> Self {
        self.config.visible_bookmark = v;
        self
    }

    pub fn inline_heading(mut self, policy: InlineHeadingPolicy) -> Self {
        self.config.inline_heading = policy;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.config.fetcher = Some(fetcher);
        self
    }

    pub fn name_generator(mut self, generator: Arc<dyn MediaNameGenerator>) -> Self {
        self.config.name_generator = Some(generator);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GenerationConfig, Csv2DocxError> {
        let c = &self.config;
        if !(c.image_dpi.is_finite() && c.image_dpi > 0.0) {
            return Err(Csv2DocxError::InvalidConfig(format!(
                "image DPI must be positive, got {}",
                c.image_dpi
            )));
        }
        if c.inline_heading.min_chars > c.inline_heading.max_chars {
            return Err(Csv2DocxError::InvalidConfig(format!(
                "inline heading length bounds are inverted: {} > {}",
                c.inline_heading.min_chars, c.inline_heading.max_chars
            )));
        }
        if c.scratch_dir.as_os_str().is_empty() {
            return Err(Csv2DocxError::InvalidConfig(
                "scratch directory must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Inline heading heuristic ─────────────────────────────────────────────

/// Thresholds for bolding lines that read like sub-headings.
///
/// A line qualifies when its length (in characters) is within
/// `min_chars..=max_chars`, it is not a URL, and either:
/// * it has the shape `label：description` with a label of
///   `label_min_chars..=label_max_chars`, a description without terminal
///   punctuation, and at least `label_min_ideographs` CJK ideographs overall; or
/// * it has no sentence punctuation anywhere, does not end in punctuation
///   or a colon, contains at least `min_ideographs` ideographs, and its
///   bracket/quote count is at most `max(punct_floor, len / punct_divisor)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InlineHeadingPolicy {
    pub enabled: bool,
    pub min_chars: usize,
    pub max_chars: usize,
    pub label_min_chars: usize,
    pub label_max_chars: usize,
    pub label_min_ideographs: usize,
    pub min_ideographs: usize,
    pub punct_floor: usize,
    pub punct_divisor: usize,
}

impl Default for InlineHeadingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_chars: 6,
            max_chars: 50,
            label_min_chars: 2,
            label_max_chars: 8,
            label_min_ideographs: 3,
            min_ideographs: 2,
            punct_floor: 2,
            punct_divisor: 6,
        }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Configuration for [`crate::orchestrator::TaskOrchestrator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Tasks executing at the same time. Default: 4.
    pub max_concurrent_tasks: usize,

    /// Re-queues allowed after a failed attempt. Default: 3.
    pub max_retries: u32,

    /// Wall-clock ceiling of one attempt in seconds. Default: 300.
    pub task_timeout_secs: u64,

    /// Pause before a re-queued task is attempted again. Default: 0.
    pub retry_delay_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            max_retries: 3,
            task_timeout_secs: 300,
            retry_delay_ms: 0,
        }
    }
}

impl OrchestratorConfig {
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn max_concurrent_tasks(mut self, n: usize) -> Self {
        self.config.max_concurrent_tasks = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn task_timeout_secs(mut self, secs: u64) -> Self {
        self.config.task_timeout_secs = secs;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn build(self) -> Result<OrchestratorConfig, Csv2DocxError> {
        if self.config.task_timeout_secs == 0 {
            return Err(Csv2DocxError::InvalidConfig(
                "task timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}
