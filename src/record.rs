//! Input records and the single "is this field present" rule.
//!
//! Tabular parsing produces cells of mixed shape: empty strings, numbers,
//! `NaN` sentinels. Every field check in the pipeline goes through
//! [`FieldValue::as_present_text`] so that those shapes are judged the same
//! way everywhere.

use std::collections::HashMap;
use std::fmt;

/// Field names the content transformer reads.
pub mod fields {
    pub const HEADING_1: &str = "heading_1";
    pub const HEADING_2: &str = "heading_2";
    pub const HEADING_3: &str = "heading_3";
    pub const TITLE: &str = "title";
    pub const CONTENT: &str = "content";
    pub const SOURCE: &str = "source";
    pub const DATE: &str = "date";

    /// Fields whose presence makes a record worth emitting.
    pub const CONTENT_BEARING: [&str; 5] = [HEADING_1, HEADING_2, HEADING_3, TITLE, CONTENT];
}

/// One cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl FieldValue {
    /// Interpret a raw cell from delimited text.
    ///
    /// Empty cells are null; numeric-looking cells become numbers (so `nan`
    /// becomes a NaN number, which is absent); everything else stays text.
    pub fn from_cell(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return FieldValue::Null;
        }
        if looks_numeric(trimmed) {
            if let Ok(n) = trimmed.parse::<f64>() {
                return FieldValue::Number(n);
            }
        }
        match trimmed {
            "True" | "true" | "TRUE" => FieldValue::Bool(true),
            "False" | "false" | "FALSE" => FieldValue::Bool(false),
            _ => FieldValue::Text(raw.to_string()),
        }
    }

    /// The canonical presence predicate.
    ///
    /// Returns the value rendered as text when it is non-null, not NaN,
    /// truthy, and non-empty after trimming. Returned text is not trimmed.
    pub fn as_present_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Number(n) if n.is_nan() || *n == 0.0 => None,
            FieldValue::Bool(false) => None,
            FieldValue::Text(s) if s.trim().is_empty() => None,
            other => Some(other.to_string()),
        }
    }

    pub fn is_present(&self) -> bool {
        self.as_present_text().is_some()
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Bool(true) => f.write_str("True"),
            FieldValue::Bool(false) => f.write_str("False"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

fn looks_numeric(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    matches!(lower.as_str(), "nan" | "-nan" | "inf" | "-inf" | "infinity")
        || (s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
            && s.chars().any(|c| c.is_ascii_digit()))
}

/// One input row: field name → value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentRecord {
    values: HashMap<String, FieldValue>,
}

impl ContentRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from `(field, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) {
        self.values.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    /// Text of `field` if it passes the presence predicate.
    pub fn text(&self, field: &str) -> Option<String> {
        self.values.get(field).and_then(FieldValue::as_present_text)
    }

    /// Whether any content-bearing field is present.
    pub fn has_content(&self) -> bool {
        fields::CONTENT_BEARING
            .iter()
            .any(|f| self.text(f).is_some())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_whitespace_cells_are_absent() {
        assert!(!FieldValue::from_cell("").is_present());
        assert!(!FieldValue::from_cell("   ").is_present());
        assert!(!FieldValue::Text(" \t ".into()).is_present());
    }

    #[test]
    fn nan_sentinel_is_absent_not_text() {
        let v = FieldValue::from_cell("NaN");
        assert!(matches!(v, FieldValue::Number(n) if n.is_nan()));
        assert_eq!(v.as_present_text(), None);
    }

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(FieldValue::from_cell("2024").as_present_text().as_deref(), Some("2024"));
        assert_eq!(FieldValue::from_cell("3.5").as_present_text().as_deref(), Some("3.5"));
    }

    #[test]
    fn zero_and_false_are_falsy() {
        assert!(!FieldValue::Number(0.0).is_present());
        assert!(!FieldValue::Bool(false).is_present());
        assert!(FieldValue::Bool(true).is_present());
    }

    #[test]
    fn dates_and_codes_stay_text() {
        assert_eq!(
            FieldValue::from_cell("2024-05-01"),
            FieldValue::Text("2024-05-01".into())
        );
        assert_eq!(FieldValue::from_cell("e"), FieldValue::Text("e".into()));
    }

    #[test]
    fn has_content_ignores_source_and_date() {
        let r = ContentRecord::from_pairs([("source", "Xinhua"), ("date", "2024-01-01")]);
        assert!(!r.has_content());
        let r = ContentRecord::from_pairs([("title", "Hello")]);
        assert!(r.has_content());
    }
}
