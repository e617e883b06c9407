//! Error types for the csv2docx library.
//!
//! Two error types cover two failure scopes:
//!
//! * [`Csv2DocxError`]: **Fatal**, the conversion cannot proceed at all
//!   (unknown template, broken configuration, missing or undecodable source,
//!   unwritable output). Returned as `Err(Csv2DocxError)` from the `generate`
//!   entry points and captured into a task's error text by the orchestrator.
//!
//! * [`RecordError`]: **Non-fatal**, a single record failed to assemble but
//!   the rest of the document is fine. Collected into
//!   [`crate::generate::GenerationOutput::record_errors`].
//!
//! Media-resolution failures never surface as errors at all: the resolver
//! keeps the original URL text and logs the outcome.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the csv2docx library.
#[derive(Debug, Error)]
pub enum Csv2DocxError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// The requested template key is not in the registry.
    #[error("Unknown template '{name}'. Available templates: {}", available.join(", "))]
    UnknownTemplate {
        name: String,
        available: Vec<String>,
    },

    /// A template entry is missing a required key.
    #[error("Invalid template config: template '{template}' is missing required key '{key}'")]
    InvalidTemplateConfig { template: String, key: String },

    /// The template configuration file could not be read.
    #[error("Failed to read template config '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The template configuration is not valid YAML or has wrongly typed values.
    #[error("Template config could not be parsed: {0}")]
    ConfigParse(String),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// Source table was not found at the given path.
    #[error("Source file not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    /// None of the candidate text encodings decoded the source table.
    #[error("Could not decode '{path}' with any of: {}", tried.join(", "))]
    NoDecodableEncoding { path: PathBuf, tried: Vec<String> },

    /// The source decoded but is not well-formed delimited text.
    #[error("Failed to parse '{path}': {detail}")]
    SourceParse { path: PathBuf, detail: String },

    // ── Document errors ───────────────────────────────────────────────────
    /// A skeleton or boilerplate document could not be opened.
    #[error("Failed to open document '{path}': {detail}")]
    DocumentOpen { path: PathBuf, detail: String },

    /// A package part is present but its XML cannot be parsed.
    #[error("Malformed document part '{part}': {detail}")]
    MalformedDocument { part: String, detail: String },

    /// Could not create or write the output document.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Task errors ───────────────────────────────────────────────────────
    /// A task exceeded its configured wall-clock ceiling.
    #[error("Task timed out after {secs}s")]
    TaskTimeout { secs: u64 },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Csv2DocxError {
    /// Whether a task failing with this error may be re-queued.
    ///
    /// Configuration errors will fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Csv2DocxError::UnknownTemplate { .. }
                | Csv2DocxError::InvalidTemplateConfig { .. }
                | Csv2DocxError::ConfigRead { .. }
                | Csv2DocxError::ConfigParse(_)
                | Csv2DocxError::InvalidConfig(_)
        )
    }
}

/// A non-fatal error for a single record.
///
/// The assembler logs it and moves on to the next record.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum RecordError {
    /// Appending the record's blocks to the document failed.
    #[error("Record {record}: assembly failed: {detail}")]
    AssemblyFailed { record: usize, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_template_lists_known_names() {
        let e = Csv2DocxError::UnknownTemplate {
            name: "missing".into(),
            available: vec!["guoziwei".into(), "weekly".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("missing"), "got: {msg}");
        assert!(msg.contains("guoziwei, weekly"), "got: {msg}");
    }

    #[test]
    fn invalid_template_config_names_template_and_key() {
        let e = Csv2DocxError::InvalidTemplateConfig {
            template: "weekly".into(),
            key: "styles".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("'weekly'"));
        assert!(msg.contains("'styles'"));
    }

    #[test]
    fn encoding_failure_lists_attempts() {
        let e = Csv2DocxError::NoDecodableEncoding {
            path: PathBuf::from("data.csv"),
            tried: vec!["utf-8".into(), "gbk".into()],
        };
        assert!(e.to_string().contains("utf-8, gbk"));
    }

    #[test]
    fn config_errors_are_not_retryable() {
        assert!(!Csv2DocxError::InvalidConfig("x".into()).is_retryable());
        assert!(!Csv2DocxError::UnknownTemplate {
            name: "a".into(),
            available: vec![],
        }
        .is_retryable());
        assert!(Csv2DocxError::SourceNotFound {
            path: PathBuf::from("gone.csv")
        }
        .is_retryable());
        assert!(Csv2DocxError::TaskTimeout { secs: 5 }.is_retryable());
    }

    #[test]
    fn record_error_display() {
        let e = RecordError::AssemblyFailed {
            record: 7,
            detail: "bad image".into(),
        };
        assert_eq!(e.to_string(), "Record 7: assembly failed: bad image");
    }
}
