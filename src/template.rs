//! Template registry: named document templates loaded from YAML.
//!
//! ```yaml
//! templates:
//!   weekly:
//!     name: Weekly digest
//!     start_template: templates/weekly_start.docx
//!     end_template: templates/weekly_end.docx
//!     target_bookmark: 目录
//!     return_link: { text: 返回目录, alignment: right, underline: true }
//!     title_mapping: { title: 3 }
//!     styles:
//!       heading_1: { alignment: center, font_name: 黑体, font_size: 16, bold: true }
//!       content:   { first_line_indent: 2, line_spacing: 1.5, space_after: 6 }
//!       image:     { max_width: 5.0, max_height: 4.0, alignment: center }
//! ```
//!
//! Every entry is validated when the registry is built, so a broken entry
//! fails the load instead of the first conversion that uses it.

use crate::error::Csv2DocxError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Keys every template entry must carry.
pub const REQUIRED_KEYS: [&str; 3] = ["name", "start_template", "styles"];

pub const DEFAULT_ANCHOR_KEYWORD: &str = "目录";
pub const DEFAULT_BOOKMARK_NAME: &str = "TOC_ANCHOR";
pub const DEFAULT_RETURN_TEXT: &str = "返回目录";
pub const DEFAULT_FONT: &str = "宋体";

// ── Style vocabulary ─────────────────────────────────────────────────────

/// Paragraph alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
    Justify,
}

impl Alignment {
    /// WordprocessingML `w:jc` value.
    pub fn as_ooxml(&self) -> &'static str {
        match self {
            Alignment::Left => "left",
            Alignment::Center => "center",
            Alignment::Right => "right",
            Alignment::Justify => "both",
        }
    }
}

/// Formatting rule for one kind of content block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleRule {
    pub alignment: Option<Alignment>,
    /// First-line indent in characters (1 char = 12 pt).
    pub first_line_indent: Option<f32>,
    /// Line spacing as a multiple of single spacing.
    pub line_spacing: Option<f32>,
    /// Space after the paragraph in points.
    pub space_after: Option<f32>,
    pub font_name: Option<String>,
    /// Font size in points.
    pub font_size: Option<f32>,
    pub bold: Option<bool>,
    pub color: Option<String>,
    /// Title decoration with a `{}` slot; only read for `title`.
    pub format: Option<String>,
}

impl StyleRule {
    /// Whether the rule sets any paragraph-level property.
    pub fn has_paragraph_format(&self) -> bool {
        self.alignment.is_some()
            || self.first_line_indent.is_some()
            || self.line_spacing.is_some()
            || self.space_after.is_some()
    }
}

/// Sizing and placement of embedded pictures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageStyle {
    /// Maximum width in inches.
    pub max_width: f32,
    /// Maximum height in inches.
    pub max_height: f32,
    pub alignment: Alignment,
}

impl Default for ImageStyle {
    fn default() -> Self {
        Self {
            max_width: 5.0,
            max_height: 4.0,
            alignment: Alignment::Center,
        }
    }
}

/// Per-kind style map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleMap {
    pub heading_1: Option<StyleRule>,
    pub heading_2: Option<StyleRule>,
    pub heading_3: Option<StyleRule>,
    pub title: Option<StyleRule>,
    pub content: Option<StyleRule>,
    pub source_date: Option<StyleRule>,
    pub image: ImageStyle,
}

/// The return-to-index placeholder text and look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturnLinkStyle {
    pub text: String,
    pub font_name: String,
    pub font_size: f32,
    pub alignment: Alignment,
    pub underline: bool,
    pub color: Option<String>,
}

impl Default for ReturnLinkStyle {
    fn default() -> Self {
        Self {
            text: DEFAULT_RETURN_TEXT.to_string(),
            font_name: DEFAULT_FONT.to_string(),
            font_size: 12.0,
            alignment: Alignment::Right,
            underline: false,
            color: None,
        }
    }
}

// ── Template definition ──────────────────────────────────────────────────

/// A loaded, validated template. Immutable once the registry is built.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDefinition {
    /// Registry key.
    pub key: String,
    /// Human-readable name.
    pub display_name: String,
    /// Skeleton the document starts from.
    pub start_document: PathBuf,
    /// Closing boilerplate appended at the end.
    pub end_document: Option<PathBuf>,
    pub styles: StyleMap,
    /// Text locating the paragraph that hosts the bookmark.
    pub anchor_keyword: String,
    pub bookmark_name: String,
    pub return_link: ReturnLinkStyle,
    /// Overrides for the block-kind → heading-level mapping.
    pub heading_levels: HashMap<String, u8>,
}

impl TemplateDefinition {
    /// A template with default styles, anchor and return link.
    pub fn new(key: impl Into<String>, start_document: impl Into<PathBuf>) -> Self {
        let key = key.into();
        Self {
            display_name: key.clone(),
            key,
            start_document: start_document.into(),
            end_document: None,
            styles: StyleMap::default(),
            anchor_keyword: DEFAULT_ANCHOR_KEYWORD.to_string(),
            bookmark_name: DEFAULT_BOOKMARK_NAME.to_string(),
            return_link: ReturnLinkStyle::default(),
            heading_levels: HashMap::new(),
        }
    }
}

/// Raw shape of a template entry, after the required-key check.
#[derive(Debug, Deserialize)]
struct RawTemplate {
    name: String,
    start_template: PathBuf,
    #[serde(default)]
    end_template: Option<PathBuf>,
    styles: StyleMap,
    #[serde(default)]
    target_bookmark: Option<String>,
    #[serde(default)]
    bookmark_name: Option<String>,
    #[serde(default)]
    return_link: ReturnLinkStyle,
    #[serde(default)]
    title_mapping: HashMap<String, Option<u8>>,
}

impl RawTemplate {
    fn into_definition(self, key: &str, base_dir: &Path) -> TemplateDefinition {
        let resolve = |p: PathBuf| {
            if p.is_absolute() {
                p
            } else {
                base_dir.join(p)
            }
        };
        TemplateDefinition {
            key: key.to_string(),
            display_name: self.name,
            start_document: resolve(self.start_template),
            end_document: self.end_template.map(resolve),
            styles: self.styles,
            anchor_keyword: self
                .target_bookmark
                .unwrap_or_else(|| DEFAULT_ANCHOR_KEYWORD.to_string()),
            bookmark_name: self
                .bookmark_name
                .unwrap_or_else(|| DEFAULT_BOOKMARK_NAME.to_string()),
            return_link: self.return_link,
            heading_levels: self
                .title_mapping
                .into_iter()
                .map(|(kind, level)| (kind, level.unwrap_or(0)))
                .collect(),
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

/// All templates from one configuration source, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: Vec<Arc<TemplateDefinition>>,
}

impl TemplateRegistry {
    /// Load and validate a YAML configuration file.
    ///
    /// Relative document paths resolve against the file's directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Csv2DocxError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Csv2DocxError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let registry = Self::from_yaml_str(&text, base_dir)?;
        info!(
            "Loaded {} templates from {}",
            registry.templates.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Load and validate YAML text.
    pub fn from_yaml_str(yaml: &str, base_dir: &Path) -> Result<Self, Csv2DocxError> {
        let root: Value =
            serde_yaml::from_str(yaml).map_err(|e| Csv2DocxError::ConfigParse(e.to_string()))?;
        let entries = root
            .get("templates")
            .and_then(Value::as_mapping)
            .ok_or_else(|| Csv2DocxError::InvalidTemplateConfig {
                template: "<root>".to_string(),
                key: "templates".to_string(),
            })?;

        let mut templates = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            let key = key_to_string(key);
            let body = entry.as_mapping().ok_or_else(|| Csv2DocxError::InvalidTemplateConfig {
                template: key.clone(),
                key: "name".to_string(),
            })?;
            validate_entry(&key, body)?;

            let raw: RawTemplate = serde_yaml::from_value(entry.clone()).map_err(|e| {
                Csv2DocxError::ConfigParse(format!("template '{key}': {e}"))
            })?;
            debug!("Template '{}' validated", key);
            templates.push(Arc::new(raw.into_definition(&key, base_dir)));
        }

        Ok(Self { templates })
    }

    /// Look up a template by key.
    pub fn resolve(&self, name: &str) -> Result<Arc<TemplateDefinition>, Csv2DocxError> {
        self.templates
            .iter()
            .find(|t| t.key == name)
            .cloned()
            .ok_or_else(|| Csv2DocxError::UnknownTemplate {
                name: name.to_string(),
                available: self.list_names(),
            })
    }

    /// Template keys in configuration order.
    pub fn list_names(&self) -> Vec<String> {
        self.templates.iter().map(|t| t.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn validate_entry(template: &str, body: &Mapping) -> Result<(), Csv2DocxError> {
    for key in REQUIRED_KEYS {
        match body.get(key) {
            None | Some(Value::Null) => {
                return Err(Csv2DocxError::InvalidTemplateConfig {
                    template: template.to_string(),
                    key: key.to_string(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn key_to_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

// ── Colors ───────────────────────────────────────────────────────────────

static RE_HEX_COLOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#?[0-9A-Fa-f]{6}$").unwrap());
static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Parse a configured color into `RRGGBB`.
///
/// Accepts `#RRGGBB`, `RRGGBB`, `rgb(r, g, b)` (components clamped to 255)
/// and the names red, blue, black, green and purple.
pub fn parse_color(value: &str) -> Option<String> {
    let v = value.trim();
    let named = match v.to_ascii_lowercase().as_str() {
        "red" => Some("FF0000"),
        "blue" => Some("0000FF"),
        "black" => Some("000000"),
        "green" => Some("008000"),
        "purple" => Some("800080"),
        _ => None,
    };
    if let Some(hex) = named {
        return Some(hex.to_string());
    }
    if RE_HEX_COLOR.is_match(v) {
        return Some(v.trim_start_matches('#').to_ascii_uppercase());
    }
    if v.to_ascii_lowercase().starts_with("rgb") {
        let parts: Vec<u32> = RE_DIGITS
            .find_iter(v)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        if let [r, g, b] = parts[..] {
            return Some(format!("{:02X}{:02X}{:02X}", r.min(255), g.min(255), b.min(255)));
        }
    }
    None
}

// ── Heading levels ───────────────────────────────────────────────────────

/// Heading level for a block kind, honouring `overrides`.
///
/// Built-in levels: `heading_1` → 1, `heading_2` → 2, `heading_3` → 3,
/// `title` → 3. An override of `0`, a level above 9, or an unknown kind
/// yields `None`, which the assembler renders as a plain paragraph.
pub fn heading_level(kind: &str, overrides: &HashMap<String, u8>) -> Option<u8> {
    let level = match overrides.get(kind) {
        Some(level) => *level,
        None => match kind {
            "heading_1" => 1,
            "heading_2" => 2,
            "heading_3" | "title" => 3,
            _ => return None,
        },
    };
    (1..=9).contains(&level).then_some(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
templates:
  weekly:
    name: Weekly digest
    start_template: skeletons/start.docx
    end_template: /abs/end.docx
    styles:
      heading_1: { alignment: center, font_size: 16, bold: true }
      content: { first_line_indent: 2, line_spacing: 1.5 }
  alpha:
    name: Alpha
    start_template: a.docx
    target_bookmark: Contents
    return_link: { text: Back to contents, underline: true }
    title_mapping: { title: 2, heading_3: ~ }
    styles: {}
"#;

    fn registry() -> TemplateRegistry {
        TemplateRegistry::from_yaml_str(CONFIG, Path::new("/cfg")).unwrap()
    }

    #[test]
    fn names_keep_configuration_order() {
        assert_eq!(registry().list_names(), vec!["weekly", "alpha"]);
    }

    #[test]
    fn resolve_applies_defaults_and_paths() {
        let t = registry().resolve("weekly").unwrap();
        assert_eq!(t.display_name, "Weekly digest");
        assert_eq!(t.start_document, PathBuf::from("/cfg/skeletons/start.docx"));
        assert_eq!(t.end_document, Some(PathBuf::from("/abs/end.docx")));
        assert_eq!(t.anchor_keyword, DEFAULT_ANCHOR_KEYWORD);
        assert_eq!(t.bookmark_name, DEFAULT_BOOKMARK_NAME);
        assert_eq!(t.return_link.text, DEFAULT_RETURN_TEXT);
        assert_eq!(t.return_link.alignment, Alignment::Right);
        let h1 = t.styles.heading_1.as_ref().unwrap();
        assert_eq!(h1.alignment, Some(Alignment::Center));
        assert_eq!(h1.bold, Some(true));
        assert_eq!(t.styles.image, ImageStyle::default());
    }

    #[test]
    fn optional_keys_are_read() {
        let t = registry().resolve("alpha").unwrap();
        assert_eq!(t.anchor_keyword, "Contents");
        assert_eq!(t.return_link.text, "Back to contents");
        assert!(t.return_link.underline);
        assert_eq!(heading_level("title", &t.heading_levels), Some(2));
        assert_eq!(heading_level("heading_3", &t.heading_levels), None);
    }

    #[test]
    fn unknown_template_lists_available() {
        let err = registry().resolve("nope").unwrap_err();
        match err {
            Csv2DocxError::UnknownTemplate { name, available } => {
                assert_eq!(name, "nope");
                assert_eq!(available, vec!["weekly", "alpha"]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn missing_styles_fails_at_load() {
        let yaml = "templates:\n  ok:\n    name: Ok\n    start_template: a.docx\n    styles: {}\n  broken:\n    name: Broken\n    start_template: b.docx\n";
        let err = TemplateRegistry::from_yaml_str(yaml, Path::new(".")).unwrap_err();
        match err {
            Csv2DocxError::InvalidTemplateConfig { template, key } => {
                assert_eq!(template, "broken");
                assert_eq!(key, "styles");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn missing_name_and_start_are_reported() {
        let yaml = "templates:\n  t:\n    start_template: a.docx\n    styles: {}\n";
        let err = TemplateRegistry::from_yaml_str(yaml, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("'name'"));

        let yaml = "templates:\n  t:\n    name: T\n    styles: {}\n";
        let err = TemplateRegistry::from_yaml_str(yaml, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("'start_template'"));
    }

    #[test]
    fn missing_templates_root_is_invalid() {
        let err = TemplateRegistry::from_yaml_str("other: 1\n", Path::new(".")).unwrap_err();
        assert!(matches!(
            err,
            Csv2DocxError::InvalidTemplateConfig { ref key, .. } if key == "templates"
        ));
    }

    #[test]
    fn malformed_yaml_is_parse_error() {
        let err = TemplateRegistry::from_yaml_str("templates: [unclosed", Path::new(".")).unwrap_err();
        assert!(matches!(err, Csv2DocxError::ConfigParse(_)));
    }

    #[test]
    fn default_heading_levels() {
        let none = HashMap::new();
        assert_eq!(heading_level("heading_1", &none), Some(1));
        assert_eq!(heading_level("heading_2", &none), Some(2));
        assert_eq!(heading_level("heading_3", &none), Some(3));
        assert_eq!(heading_level("title", &none), Some(3));
        assert_eq!(heading_level("content", &none), None);
    }

    #[test]
    fn colors_parse_to_hex() {
        assert_eq!(parse_color("#0563c1").as_deref(), Some("0563C1"));
        assert_eq!(parse_color("FF0000").as_deref(), Some("FF0000"));
        assert_eq!(parse_color(" Blue ").as_deref(), Some("0000FF"));
        assert_eq!(parse_color("rgb(255, 0, 300)").as_deref(), Some("FF00FF"));
        assert_eq!(parse_color("rgb(1,2)"), None);
        assert_eq!(parse_color("chartreuse"), None);
    }

    #[test]
    fn alignment_maps_to_ooxml() {
        assert_eq!(Alignment::Justify.as_ooxml(), "both");
        assert_eq!(Alignment::Center.as_ooxml(), "center");
    }
}
