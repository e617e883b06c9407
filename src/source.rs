//! Structured reader: delimited text → ordered records.
//!
//! The raw bytes are decoded with each candidate encoding in turn; the first
//! one that decodes without malformed sequences wins. A leading byte-order
//! mark is dropped so the first header is not polluted by it.

use crate::error::Csv2DocxError;
use crate::record::{ContentRecord, FieldValue};
use encoding_rs::Encoding;
use std::borrow::Cow;
use std::path::Path;
use tracing::{debug, info};

/// Candidate encodings, tried in order. encoding_rs decodes `gb18030` with
/// the same decoder as `gbk`, so listing it would never change the outcome.
pub const SOURCE_ENCODINGS: [&str; 2] = ["utf-8", "gbk"];

/// Read and parse a delimited-text file.
pub async fn read_records(path: &Path) -> Result<Vec<ContentRecord>, Csv2DocxError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Csv2DocxError::SourceNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(Csv2DocxError::SourceParse {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
    };
    let records = parse_records(&bytes, path)?;
    info!("Read {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Parse raw bytes; `origin` is only used in error messages.
pub fn parse_records(bytes: &[u8], origin: &Path) -> Result<Vec<ContentRecord>, Csv2DocxError> {
    let (text, encoding) = decode(bytes).ok_or_else(|| Csv2DocxError::NoDecodableEncoding {
        path: origin.to_path_buf(),
        tried: SOURCE_ENCODINGS.iter().map(|s| s.to_string()).collect(),
    })?;
    debug!("Decoded {} as {}", origin.display(), encoding);

    let parse_err = |e: csv::Error| Csv2DocxError::SourceParse {
        path: origin.to_path_buf(),
        detail: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(parse_err)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(parse_err)?;
        let mut record = ContentRecord::new();
        for (i, name) in headers.iter().enumerate() {
            let value = row.get(i).map(FieldValue::from_cell).unwrap_or(FieldValue::Null);
            record.insert(name.clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}

fn decode(bytes: &[u8]) -> Option<(Cow<'_, str>, &'static str)> {
    for label in SOURCE_ENCODINGS {
        let Some(encoding) = Encoding::for_label(label.as_bytes()) else {
            continue;
        };
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            let text = match text {
                Cow::Borrowed(s) => Cow::Borrowed(s.strip_prefix('\u{feff}').unwrap_or(s)),
                Cow::Owned(s) => match s.strip_prefix('\u{feff}') {
                    Some(rest) => Cow::Owned(rest.to_string()),
                    None => Cow::Owned(s),
                },
            };
            return Some((text, label));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn origin() -> PathBuf {
        PathBuf::from("test.csv")
    }

    #[test]
    fn parses_utf8_with_bom() {
        let data = "\u{feff}heading_1,title,content\nA,T,Body\n";
        let records = parse_records(data.as_bytes(), &origin()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text("heading_1").as_deref(), Some("A"));
        assert_eq!(records[0].text("content").as_deref(), Some("Body"));
    }

    #[test]
    fn falls_back_to_gbk() {
        let (bytes, _, _) = encoding_rs::GBK.encode("title,content\n标题,正文内容\n");
        assert!(std::str::from_utf8(&bytes).is_err());
        let records = parse_records(&bytes, &origin()).unwrap();
        assert_eq!(records[0].text("title").as_deref(), Some("标题"));
    }

    #[test]
    fn gb18030_four_byte_sequences_decode_as_gbk() {
        let (bytes, _, _) = encoding_rs::GB18030.encode("title,content\n𠀀,€\n");
        let records = parse_records(&bytes, &origin()).unwrap();
        assert_eq!(records[0].text("title").as_deref(), Some("𠀀"));
        assert_eq!(records[0].text("content").as_deref(), Some("€"));
    }

    #[test]
    fn undecodable_bytes_fail_with_all_encodings_listed() {
        let err = parse_records(&[0xFF, 0xFE, 0xFF, 0xFF], &origin()).unwrap_err();
        match err {
            Csv2DocxError::NoDecodableEncoding { tried, .. } => {
                assert_eq!(tried, vec!["utf-8", "gbk"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn short_rows_fill_missing_cells_with_null() {
        let data = "title,content,source\nOnly title\n";
        let records = parse_records(data.as_bytes(), &origin()).unwrap();
        assert_eq!(records[0].get("source"), Some(&FieldValue::Null));
    }

    #[test]
    fn quoted_multiline_content_survives() {
        let data = "title,content\nT,\"line one\n\nline two\"\n";
        let records = parse_records(data.as_bytes(), &origin()).unwrap();
        assert_eq!(
            records[0].text("content").as_deref(),
            Some("line one\n\nline two")
        );
    }

    #[tokio::test]
    async fn missing_file_is_source_not_found() {
        let err = read_records(Path::new("/definitely/not/here.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, Csv2DocxError::SourceNotFound { .. }));
    }

    #[test]
    fn reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("week.csv");
        std::fs::write(&path, "title,content\nT,Body\n,\n").unwrap();
        let records = tokio_test::block_on(read_records(&path)).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].has_content());
        assert!(!records[1].has_content());
    }
}
