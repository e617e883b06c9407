//! Remote image fetching.
//!
//! [`ImageFetcher`] is the seam between the media resolver and the network:
//! the resolver owns retry, backoff and payload validation, a fetcher only
//! performs one request. [`HttpImageFetcher`] is the production
//! implementation; tests substitute an in-memory fetcher.
//!
//! Image hosts frequently refuse hot-linking, so every request carries a
//! randomly chosen browser user agent and a plausible referer.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, PRAGMA, REFERER, USER_AGENT};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::error::Csv2DocxError;

/// Body and declared type of one successful response.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Lower-cased `Content-Type` header, if any.
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Failure of a single fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Network error, timeout, bad status: worth another attempt.
    #[error("transient: {0}")]
    Transient(String),

    /// The server answered with something that is not an image.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Performs one HTTP GET for an image URL.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// `attempt` counts from 0; implementations may vary request identity
    /// per attempt.
    async fn fetch(&self, url: &str, attempt: u32, timeout: Duration) -> Result<FetchedImage, FetchError>;
}

// ── Request identity ─────────────────────────────────────────────────────────

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

const SINA_REFERERS: &[&str] = &[
    "https://finance.sina.com.cn/",
    "https://news.sina.com.cn/",
    "https://www.sina.com.cn/",
    "https://mobile.sina.com.cn/",
    "https://sina.com.cn/",
];

fn pick<'a>(pool: &[&'a str]) -> &'a str {
    pool.choose(&mut rand::thread_rng()).copied().unwrap_or_default()
}

/// Referer for `url`: a sina portal page for sina image hosts, otherwise
/// the URL's own origin.
pub fn referer_for(url: &str) -> Option<String> {
    let lower = url.to_ascii_lowercase();
    if lower.contains("sinaimg.cn") || lower.contains("sina.com") {
        return Some(pick(SINA_REFERERS).to_string());
    }
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}/", parsed.scheme(), host, port),
        None => format!("{}://{}/", parsed.scheme(), host),
    })
}

fn request_headers(url: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(pick(USER_AGENTS)));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("image/webp,image/apng,image/*,*/*;q=0.8"),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("image"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("no-cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("cross-site"));
    if let Some(value) = referer_for(url).and_then(|r| HeaderValue::from_str(&r).ok()) {
        headers.insert(REFERER, value);
    }
    headers
}

// ── HTTP implementation ──────────────────────────────────────────────────────

/// [`ImageFetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Result<Self, Csv2DocxError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Csv2DocxError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str, attempt: u32, timeout: Duration) -> Result<FetchedImage, FetchError> {
        debug!(url, attempt, timeout_secs = timeout.as_secs(), "fetching image");

        let response = self
            .client
            .get(url)
            .headers(request_headers(url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Transient(format!("timed out after {}s", timeout.as_secs()))
                } else {
                    FetchError::Transient(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Transient(format!("HTTP {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        Ok(FetchedImage {
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}
