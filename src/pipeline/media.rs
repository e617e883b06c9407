//! Media resolver: turn image URLs inside body text into local files.
//!
//! ## Algorithm
//!
//! ```text
//! body text ──▶ strip ticker codes ──▶ scan URLs left to right
//!                                         │
//!        ┌────────────────────────────────┘
//!        ▼
//!  sanitize trailing punctuation ──▶ pre-filter ──▶ fetch (retry) ──▶ validate
//!                                        │                               │
//!                                  keep URL text                 normalize + save
//!                                                                        │
//!                                      marker #i + punctuation
//! ```
//!
//! Resolution never fails the surrounding record: every error path leaves
//! the original URL text in place and is only logged.
//!
//! A marker only carries the position of its [`MediaReference`] in
//! [`ResolvedBody::media`]; the local path never travels through the text.

use crate::config::GenerationConfig;
use crate::error::Csv2DocxError;
use crate::pipeline::fetch::{FetchError, HttpImageFetcher, ImageFetcher};
use image::{DynamicImage, GenericImageView, ImageFormat};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Name generation ──────────────────────────────────────────────────────────

/// Produces file names for resolved images.
///
/// Names must not collide across concurrent tasks sharing one scratch
/// directory.
pub trait MediaNameGenerator: Send + Sync {
    /// A fresh file name (no directory) ending in `.{extension}`.
    fn next_name(&self, extension: &str) -> String;
}

static NAME_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `{unix millis}_{process sequence}_{random}.{ext}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampNameGenerator;

impl MediaNameGenerator for TimestampNameGenerator {
    fn next_name(&self, extension: &str) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = NAME_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let salt: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
        format!("{millis}_{seq}_{salt}.{extension}")
    }
}

/// `{prefix}0001.{ext}`, `{prefix}0002.{ext}`, ... Deterministic, for tests
/// and reproducible output.
#[derive(Debug, Default)]
pub struct SequentialNameGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialNameGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl MediaNameGenerator for SequentialNameGenerator {
    fn next_name(&self, extension: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{n:04}.{extension}", self.prefix)
    }
}

// ── Text rules ───────────────────────────────────────────────────────────────

static RE_TICKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[（(]\s*\d{4,6}\s*[．.]\s*[A-Za-z]{1,5}\s*[)）]").unwrap()
});

/// Remove bracketed instrument codes such as `(688333.SH)` or `（3931.HK）`.
pub fn strip_ticker_codes(text: &str) -> String {
    RE_TICKER.replace_all(text, "").into_owned()
}

static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s\x{4e00}-\x{9fff}]+").unwrap());

const TRAILING_PUNCT: &[char] = &[
    ')', ',', '.', ';', ':', '!', '?', '\'', '"', ']', '>', '}', '，', '。', '；', '：', '！',
    '？', '“', '”', '‘', '’', '》', '】', '）', '、', '＞', '』', '」',
];

/// Split trailing punctuation off a matched URL.
///
/// Returns `(url, suffix)`. When everything would be stripped the input is
/// returned unchanged with an empty suffix.
pub fn sanitize_url(raw: &str) -> (&str, &str) {
    let url = raw.trim_end_matches(TRAILING_PUNCT);
    if url.is_empty() {
        return (raw, "");
    }
    (url, &raw[url.len()..])
}

static RE_IMAGE_EXTENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(jpg|jpeg|png|gif|bmp|webp|svg)(?:[?#].*)?$").unwrap()
});
static RE_IMAGE_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:img\.|image\.|pic\.|photo\.|cdn\.|oss\.|qpic\.)").unwrap()
});
const WEBPAGE_INDICATORS: &[&str] = &[
    "#/", "?page=", "/article/", "/news/", "/content/", ".html", ".htm", ".php", ".asp",
];

/// Cheap pre-filter deciding whether a URL is worth fetching.
///
/// An image file extension always qualifies. Otherwise anything that looks
/// like a web page is rejected, and what remains qualifies only when the
/// host looks like an image or CDN host.
pub fn is_likely_image_url(url: &str) -> bool {
    if url.is_empty() {
        return false;
    }
    if RE_IMAGE_EXTENSION.is_match(url) {
        return true;
    }
    let lower = url.to_ascii_lowercase();
    if WEBPAGE_INDICATORS.iter().any(|i| lower.contains(i)) {
        return false;
    }
    RE_IMAGE_HOST.is_match(url)
}

// ── Markers ──────────────────────────────────────────────────────────────────

const MARKER_OPEN: char = '\u{E000}';
const MARKER_CLOSE: char = '\u{E001}';

static RE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x{E000}(\d+)\x{E001}").unwrap());

/// Marker standing in for `media[index]` inside body text.
pub fn media_marker(index: usize) -> String {
    format!("{MARKER_OPEN}{index}{MARKER_CLOSE}")
}

/// Remove marker delimiters from untrusted text so only the resolver can
/// produce markers.
pub fn strip_marker_chars(text: &str) -> String {
    text.replace([MARKER_OPEN, MARKER_CLOSE], "")
}

/// Piece of body text after splitting out media markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerPiece {
    Text(String),
    /// Index into the record's media list.
    Media(usize),
}

/// Split `text` into text and media pieces, in order. Empty text pieces are
/// dropped.
pub fn split_media_markers(text: &str) -> Vec<MarkerPiece> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for caps in RE_MARKER.captures_iter(text) {
        let (Some(whole), Some(index)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Ok(index) = index.as_str().parse::<usize>() else {
            continue;
        };
        if whole.start() > last {
            pieces.push(MarkerPiece::Text(text[last..whole.start()].to_string()));
        }
        pieces.push(MarkerPiece::Media(index));
        last = whole.end();
    }
    if last < text.len() {
        pieces.push(MarkerPiece::Text(text[last..].to_string()));
    }
    pieces
}

// ── Resolution results ───────────────────────────────────────────────────────

/// How one candidate URL ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOutcome {
    /// Saved locally and replaced by a marker.
    Resolved,
    /// Left as literal URL text.
    KeptOriginal { reason: String },
}

/// One image URL that passed the pre-filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaReference {
    pub url: String,
    pub local_path: Option<PathBuf>,
    /// Extension of the saved file (`png`, `jpeg`).
    pub format: Option<String>,
    pub outcome: MediaOutcome,
}

/// Body text after resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedBody {
    pub text: String,
    pub media: Vec<MediaReference>,
}

impl ResolvedBody {
    pub fn resolved_count(&self) -> usize {
        self.media
            .iter()
            .filter(|m| m.outcome == MediaOutcome::Resolved)
            .count()
    }

    pub fn kept_count(&self) -> usize {
        self.media.len() - self.resolved_count()
    }
}

/// An image that passed validation, ready to be written.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    /// `png` or `jpeg`.
    pub extension: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Validate a downloaded payload and convert it to PNG or JPEG.
///
/// WebP, AVIF, TIFF, BMP, ICO and anything with alpha become PNG; JPEG and
/// PNG are kept byte-for-byte; other formats are re-encoded as JPEG.
pub fn normalize_image(
    bytes: Vec<u8>,
    min_bytes: usize,
    min_dimension: u32,
    jpeg_quality: u8,
) -> Result<NormalizedImage, String> {
    if bytes.len() < min_bytes {
        return Err(format!("payload too small: {} bytes", bytes.len()));
    }
    let format = image::guess_format(&bytes).ok();
    let img = image::load_from_memory(&bytes).map_err(|e| format!("not decodable: {e}"))?;
    let (width, height) = img.dimensions();
    if width < min_dimension || height < min_dimension {
        return Err(format!("image too small: {width}x{height}"));
    }

    let has_alpha = img.color().has_alpha();
    let target = match format {
        Some(ImageFormat::WebP | ImageFormat::Avif | ImageFormat::Tiff | ImageFormat::Bmp | ImageFormat::Ico) => {
            ImageFormat::Png
        }
        _ if has_alpha => ImageFormat::Png,
        Some(ImageFormat::Png) => ImageFormat::Png,
        _ => ImageFormat::Jpeg,
    };

    let (bytes, extension) = match (format, target) {
        (Some(ImageFormat::Png), ImageFormat::Png) => (bytes, "png"),
        (Some(ImageFormat::Jpeg), ImageFormat::Jpeg) => (bytes, "jpeg"),
        (_, ImageFormat::Png) => (encode_png(&img)?, "png"),
        _ => (encode_jpeg(&img, jpeg_quality)?, "jpeg"),
    };
    Ok(NormalizedImage {
        bytes,
        extension,
        width,
        height,
    })
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, String> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .map_err(|e| format!("PNG encode failed: {e}"))?;
    Ok(out.into_inner())
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode_image(&img.to_rgb8())
        .map_err(|e| format!("JPEG encode failed: {e}"))?;
    Ok(out)
}

// ── Resolver ─────────────────────────────────────────────────────────────────

/// Why a single URL could not be resolved.
enum Failure {
    /// Retrying will not help.
    Final(String),
    /// Attempts exhausted.
    Exhausted(String),
}

/// Rewrites image URLs in body text into media markers.
pub struct MediaResolver {
    fetcher: Option<Arc<dyn ImageFetcher>>,
    names: Arc<dyn MediaNameGenerator>,
    scratch_dir: PathBuf,
    max_attempts: u32,
    retry_backoff_ms: u64,
    max_backoff_ms: u64,
    fetch_timeout_secs: u64,
    fetch_timeout_step_secs: u64,
    min_image_bytes: usize,
    min_image_dimension: u32,
    jpeg_quality: u8,
}

impl std::fmt::Debug for MediaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaResolver")
            .field("enabled", &self.fetcher.is_some())
            .field("scratch_dir", &self.scratch_dir)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl MediaResolver {
    /// Build from configuration. Uses [`HttpImageFetcher`] and
    /// [`TimestampNameGenerator`] unless others are injected. With
    /// `download_images` off no fetcher is created and URLs are left alone.
    pub fn new(config: &GenerationConfig) -> Result<Self, Csv2DocxError> {
        let fetcher: Option<Arc<dyn ImageFetcher>> = match (&config.fetcher, config.download_images) {
            (_, false) => None,
            (Some(f), true) => Some(Arc::clone(f)),
            (None, true) => Some(Arc::new(HttpImageFetcher::new()?)),
        };
        let names = config
            .name_generator
            .clone()
            .unwrap_or_else(|| Arc::new(TimestampNameGenerator));
        Ok(Self {
            fetcher,
            names,
            scratch_dir: config.scratch_dir.clone(),
            max_attempts: config.max_fetch_attempts.max(1),
            retry_backoff_ms: config.retry_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            fetch_timeout_secs: config.fetch_timeout_secs,
            fetch_timeout_step_secs: config.fetch_timeout_step_secs,
            min_image_bytes: config.min_image_bytes,
            min_image_dimension: config.min_image_dimension,
            jpeg_quality: config.jpeg_quality,
        })
    }

    /// Resolve every image URL in `text`.
    ///
    /// Marker delimiters already present in `text` are dropped, so every
    /// marker in the result points at an entry of the returned media list.
    pub async fn resolve(&self, text: &str) -> ResolvedBody {
        let text = strip_ticker_codes(&strip_marker_chars(text));
        let Some(fetcher) = &self.fetcher else {
            return ResolvedBody {
                text,
                media: Vec::new(),
            };
        };

        let mut out = String::with_capacity(text.len());
        let mut media = Vec::new();
        let mut last = 0;
        let spans: Vec<(usize, usize)> = RE_URL
            .find_iter(&text)
            .map(|m| (m.start(), m.end()))
            .collect();
        for (start, end) in spans {
            out.push_str(&text[last..start]);
            last = end;

            let raw = &text[start..end];
            let (url, suffix) = sanitize_url(raw);
            if !is_likely_image_url(url) {
                debug!(url, "not an image URL, kept as text");
                out.push_str(raw);
                continue;
            }

            match self.fetch_and_save(fetcher.as_ref(), url).await {
                Ok((path, ext)) => {
                    info!(url, path = %path.display(), "resolved image");
                    out.push_str(&media_marker(media.len()));
                    out.push_str(suffix);
                    media.push(MediaReference {
                        url: url.to_string(),
                        local_path: Some(path),
                        format: Some(ext.to_string()),
                        outcome: MediaOutcome::Resolved,
                    });
                }
                Err(failure) => {
                    let reason = match failure {
                        Failure::Final(reason) => {
                            warn!(url, %reason, "image rejected, keeping original URL");
                            reason
                        }
                        Failure::Exhausted(reason) => {
                            warn!(url, %reason, "image fetch gave up, keeping original URL");
                            reason
                        }
                    };
                    out.push_str(raw);
                    media.push(MediaReference {
                        url: url.to_string(),
                        local_path: None,
                        format: None,
                        outcome: MediaOutcome::KeptOriginal { reason },
                    });
                }
            }
        }
        out.push_str(&text[last..]);
        ResolvedBody { text: out, media }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.retry_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let base = self
            .retry_backoff_ms
            .saturating_mul(1u64 << (attempt - 1).min(20));
        let jitter: f64 = rand::thread_rng().gen_range(0.1..0.3);
        let ms = (base as f64 * (1.0 + jitter)) as u64;
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    fn attempt_timeout(&self, attempt: u32) -> Duration {
        Duration::from_secs(
            self.fetch_timeout_secs + u64::from(attempt) * self.fetch_timeout_step_secs,
        )
    }

    async fn fetch_and_save(
        &self,
        fetcher: &dyn ImageFetcher,
        url: &str,
    ) -> Result<(PathBuf, &'static str), Failure> {
        let mut last_error = String::from("no attempt made");

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt);
                warn!(
                    url,
                    attempt = attempt + 1,
                    max = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "retrying image fetch"
                );
                tokio::time::sleep(delay).await;
            }

            let fetched = match fetcher.fetch(url, attempt, self.attempt_timeout(attempt)).await {
                Ok(f) => f,
                Err(FetchError::Rejected(reason)) => return Err(Failure::Final(reason)),
                Err(FetchError::Transient(reason)) => {
                    last_error = reason;
                    continue;
                }
            };

            let content_type = fetched.content_type.unwrap_or_default();
            if !content_type.contains("image") {
                return Err(Failure::Final(format!(
                    "content type is not an image: {content_type:?}"
                )));
            }

            let (min_bytes, min_dim, quality) =
                (self.min_image_bytes, self.min_image_dimension, self.jpeg_quality);
            let bytes = fetched.bytes;
            let normalized = tokio::task::spawn_blocking(move || {
                normalize_image(bytes, min_bytes, min_dim, quality)
            })
            .await
            .map_err(|e| Failure::Final(format!("image task failed: {e}")))?;

            let image = match normalized {
                Ok(image) => image,
                Err(reason) => {
                    last_error = reason;
                    continue;
                }
            };

            let path = self
                .save(&image)
                .await
                .map_err(|e| Failure::Final(format!("cannot write image: {e}")))?;
            debug!(url, width = image.width, height = image.height, "image saved");
            return Ok((path, image.extension));
        }

        Err(Failure::Exhausted(format!(
            "{} attempts failed, last error: {last_error}",
            self.max_attempts
        )))
    }

    async fn save(&self, image: &NormalizedImage) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let path = self
            .scratch_dir
            .join(self.names.next_name(image.extension));
        tokio::fs::write(&path, &image.bytes).await?;
        Ok(std::path::absolute(&path).unwrap_or(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fetch::FetchedImage;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn noisy_rgb(w: u32, h: u32) -> RgbImage {
        let mut state: u32 = 0x1234_5678;
        RgbImage::from_fn(w, h, |_, _| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let [a, b, c, _] = state.to_le_bytes();
            Rgb([a, b, c])
        })
    }

    fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn png_bytes() -> Vec<u8> {
        encode(DynamicImage::ImageRgb8(noisy_rgb(64, 48)), ImageFormat::Png)
    }

    /// Serves scripted responses and counts calls.
    struct ScriptedFetcher {
        calls: AtomicUsize,
        respond: Box<dyn Fn(usize) -> Result<FetchedImage, FetchError> + Send + Sync>,
    }

    impl ScriptedFetcher {
        fn new(respond: impl Fn(usize) -> Result<FetchedImage, FetchError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                respond: Box::new(respond),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageFetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str, _attempt: u32, _timeout: Duration) -> Result<FetchedImage, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(n)
        }
    }

    fn image_response(bytes: Vec<u8>) -> Result<FetchedImage, FetchError> {
        Ok(FetchedImage {
            content_type: Some("image/png".into()),
            bytes,
        })
    }

    fn resolver(fetcher: Arc<ScriptedFetcher>, dir: &Path) -> MediaResolver {
        let config = GenerationConfig::builder()
            .scratch_dir(dir)
            .retry_backoff_ms(0)
            .fetcher(fetcher)
            .name_generator(Arc::new(SequentialNameGenerator::new("img_")))
            .build()
            .unwrap();
        MediaResolver::new(&config).unwrap()
    }

    #[test]
    fn ticker_codes_are_stripped() {
        assert_eq!(strip_ticker_codes("中芯国际（688981.SH）发布"), "中芯国际发布");
        assert_eq!(strip_ticker_codes("Lenovo (0992．hk) up"), "Lenovo  up");
        assert_eq!(strip_ticker_codes("year (2024) data"), "year (2024) data");
    }

    #[test]
    fn trailing_punctuation_is_split_off() {
        assert_eq!(
            sanitize_url("http://a.com/x.png)."),
            ("http://a.com/x.png", ").")
        );
        assert_eq!(
            sanitize_url("https://a.com/x.jpg，"),
            ("https://a.com/x.jpg", "，")
        );
        assert_eq!(sanitize_url("https://a.com/?q=1"), ("https://a.com/?q=1", ""));
    }

    #[test]
    fn pre_filter_accepts_images_and_rejects_pages() {
        assert!(is_likely_image_url("http://x.com/a/b.JPG"));
        assert!(is_likely_image_url("http://x.com/a/b.png?w=100"));
        assert!(is_likely_image_url("https://cdn.example.com/asset/123"));
        assert!(is_likely_image_url("https://mmbiz.qpic.cn/abc/640"));
        assert!(!is_likely_image_url("https://cdn.example.com/article/123"));
        assert!(!is_likely_image_url("https://news.example.com/a.html"));
        assert!(!is_likely_image_url("https://example.com/page"));
        assert!(!is_likely_image_url(""));
    }

    #[test]
    fn markers_split_in_order() {
        let text = format!("see ({}). and {}", media_marker(0), media_marker(3));
        assert_eq!(
            split_media_markers(&text),
            vec![
                MarkerPiece::Text("see (".into()),
                MarkerPiece::Media(0),
                MarkerPiece::Text("). and ".into()),
                MarkerPiece::Media(3),
            ]
        );
        assert_eq!(
            split_media_markers(&media_marker(12)),
            vec![MarkerPiece::Media(12)]
        );
    }

    #[test]
    fn bracketed_image_text_is_not_a_marker() {
        let text = "literal [image: /tmp/private.png] end";
        assert_eq!(
            split_media_markers(text),
            vec![MarkerPiece::Text(text.into())]
        );
    }

    #[test]
    fn sequential_names_are_deterministic() {
        let g = SequentialNameGenerator::new("m");
        assert_eq!(g.next_name("png"), "m0001.png");
        assert_eq!(g.next_name("jpeg"), "m0002.jpeg");
    }

    #[test]
    fn timestamp_names_do_not_repeat() {
        let g = TimestampNameGenerator;
        let names: std::collections::HashSet<String> = (0..200).map(|_| g.next_name("png")).collect();
        assert_eq!(names.len(), 200);
    }

    #[test]
    fn png_is_kept_and_bmp_becomes_png() {
        let png = png_bytes();
        let kept = normalize_image(png.clone(), 100, 10, 95).unwrap();
        assert_eq!(kept.extension, "png");
        assert_eq!(kept.bytes, png);

        let bmp = encode(DynamicImage::ImageRgb8(noisy_rgb(32, 32)), ImageFormat::Bmp);
        let converted = normalize_image(bmp, 100, 10, 95).unwrap();
        assert_eq!(converted.extension, "png");
        assert_eq!(image::guess_format(&converted.bytes).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn gif_with_alpha_becomes_png() {
        let rgba = RgbaImage::from_fn(20, 20, |x, _| Rgba([x as u8 * 10, 0, 0, if x % 2 == 0 { 0 } else { 255 }]));
        let gif = encode(DynamicImage::ImageRgba8(rgba), ImageFormat::Gif);
        let out = normalize_image(gif, 10, 10, 95).unwrap();
        assert_eq!(out.extension, "png");
    }

    #[test]
    fn undersized_payloads_are_rejected() {
        assert!(normalize_image(vec![0u8; 20], 100, 10, 95).is_err());
        let tiny = encode(DynamicImage::ImageRgb8(noisy_rgb(5, 40)), ImageFormat::Png);
        let err = normalize_image(tiny, 10, 10, 95).unwrap_err();
        assert!(err.contains("too small"), "{err}");
        assert!(normalize_image(vec![7u8; 500], 100, 10, 95).is_err());
    }

    #[tokio::test]
    async fn resolved_url_becomes_marker_with_punctuation_outside() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(|_| image_response(png_bytes()));
        let r = resolver(fetcher.clone(), dir.path());

        let body = r.resolve("see (http://cdn.example.com/pic.jpg).").await;
        assert_eq!(fetcher.calls(), 1);
        assert!(!body.text.contains("http://"));
        assert_eq!(body.text, format!("see ({}).", media_marker(0)));
        assert_eq!(body.resolved_count(), 1);
        let path = body.media[0].local_path.clone().unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn non_image_urls_are_never_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(|_| image_response(png_bytes()));
        let r = resolver(fetcher.clone(), dir.path());

        let text = "原文见 https://news.example.com/article/1.html。";
        let body = r.resolve(text).await;
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(body.text, text);
        assert!(body.media.is_empty());
    }

    #[tokio::test]
    async fn html_response_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(|_| {
            Ok(FetchedImage {
                content_type: Some("text/html; charset=utf-8".into()),
                bytes: b"<html></html>".to_vec(),
            })
        });
        let r = resolver(fetcher.clone(), dir.path());

        let text = "img http://img.example.com/a.png end";
        let body = r.resolve(text).await;
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(body.text, text);
        assert_eq!(body.kept_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_keep_url() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(|_| Err(FetchError::Transient("connection reset".into())));
        let r = resolver(fetcher.clone(), dir.path());

        let text = "x https://img.example.com/a.png";
        let body = r.resolve(text).await;
        assert_eq!(fetcher.calls(), 5);
        assert_eq!(body.text, text);
        assert!(matches!(
            &body.media[0].outcome,
            MediaOutcome::KeptOriginal { reason } if reason.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn invalid_payload_is_retried_until_valid() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(|n| {
            if n < 2 {
                image_response(vec![1, 2, 3])
            } else {
                image_response(png_bytes())
            }
        });
        let r = resolver(fetcher.clone(), dir.path());
        let body = r.resolve("https://img.example.com/a.png").await;
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(body.resolved_count(), 1);
    }

    #[tokio::test]
    async fn disabled_download_only_strips_tickers() {
        let config = GenerationConfig::builder()
            .download_images(false)
            .build()
            .unwrap();
        let r = MediaResolver::new(&config).unwrap();
        let body = r.resolve("腾讯（0700.HK）http://img.example.com/a.png").await;
        assert_eq!(body.text, "腾讯http://img.example.com/a.png");
    }

    #[tokio::test]
    async fn forged_markers_in_input_are_dropped() {
        let config = GenerationConfig::builder()
            .download_images(false)
            .build()
            .unwrap();
        let r = MediaResolver::new(&config).unwrap();
        let forged = format!("a {} b", media_marker(0));
        let body = r.resolve(&forged).await;
        assert_eq!(body.text, "a 0 b");
        assert!(body.media.is_empty());
        assert_eq!(
            split_media_markers(&body.text),
            vec![MarkerPiece::Text("a 0 b".into())]
        );
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = GenerationConfig::builder()
            .download_images(false)
            .retry_backoff_ms(1000)
            .max_backoff_ms(3000)
            .build()
            .unwrap();
        let r = MediaResolver::new(&config).unwrap();
        assert_eq!(r.backoff_delay(0), Duration::ZERO);
        let first = r.backoff_delay(1).as_millis();
        assert!((1100..=1300).contains(&first), "{first}");
        assert_eq!(r.backoff_delay(4).as_millis(), 3000);
        assert_eq!(r.attempt_timeout(0), Duration::from_secs(20));
        assert_eq!(r.attempt_timeout(2), Duration::from_secs(40));
    }
}
