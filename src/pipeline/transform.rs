//! Content transformer: classify one record's fields into ordered blocks.

use crate::record::{fields, ContentRecord};
use crate::template::TemplateDefinition;
use std::collections::HashSet;
use std::fmt;

/// Decoration applied to `title`-sourced headings when the template sets none.
pub const DEFAULT_TITLE_FORMAT: &str = "【{}】";

/// Which field a heading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadingKind {
    Heading1,
    Heading2,
    Heading3,
    Title,
}

impl HeadingKind {
    /// Field / style key for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            HeadingKind::Heading1 => fields::HEADING_1,
            HeadingKind::Heading2 => fields::HEADING_2,
            HeadingKind::Heading3 => fields::HEADING_3,
            HeadingKind::Title => fields::TITLE,
        }
    }
}

impl fmt::Display for HeadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of output, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Heading { kind: HeadingKind, text: String },
    /// Body text; may carry media markers after resolution.
    Body { text: String },
    /// At least one of the two is set.
    SourceDate {
        source: Option<String>,
        date: Option<String>,
    },
    ReturnPlaceholder,
}

impl ContentBlock {
    pub fn is_body(&self) -> bool {
        matches!(self, ContentBlock::Body { .. })
    }
}

/// Turns records into [`ContentBlock`]s for one template.
#[derive(Debug, Clone)]
pub struct ContentTransformer {
    title_format: String,
}

impl ContentTransformer {
    pub fn new(template: &TemplateDefinition) -> Self {
        let title_format = template
            .styles
            .title
            .as_ref()
            .and_then(|rule| rule.format.clone())
            .filter(|f| f.contains("{}"))
            .unwrap_or_else(|| DEFAULT_TITLE_FORMAT.to_string());
        Self { title_format }
    }

    /// Classify `record`.
    ///
    /// `written_heading_1` holds the level-1 headings already emitted into
    /// the current document; a heading found there is not emitted again and a
    /// new one is added to it. A record without any content-bearing field
    /// yields no blocks.
    pub fn transform(
        &self,
        record: &ContentRecord,
        written_heading_1: &mut HashSet<String>,
    ) -> Vec<ContentBlock> {
        if !record.has_content() {
            return Vec::new();
        }
        let mut blocks = Vec::new();

        if let Some(h1) = record.text(fields::HEADING_1) {
            if written_heading_1.insert(h1.clone()) {
                blocks.push(ContentBlock::Heading {
                    kind: HeadingKind::Heading1,
                    text: h1,
                });
            }
        }

        if let Some(h2) = record.text(fields::HEADING_2) {
            blocks.push(ContentBlock::Heading {
                kind: HeadingKind::Heading2,
                text: h2,
            });
        }

        match (record.text(fields::HEADING_3), record.text(fields::TITLE)) {
            (Some(h3), _) => blocks.push(ContentBlock::Heading {
                kind: HeadingKind::Heading3,
                text: h3,
            }),
            (None, Some(title)) => blocks.push(ContentBlock::Heading {
                kind: HeadingKind::Title,
                text: self.decorate_title(&title),
            }),
            (None, None) => {}
        }

        let has_body = match record.text(fields::CONTENT) {
            Some(content) => {
                blocks.push(ContentBlock::Body { text: content });
                true
            }
            None => false,
        };

        let source = record
            .text(fields::SOURCE)
            .map(|s| s.trim().to_string());
        let date = record.text(fields::DATE).map(|s| s.trim().to_string());
        if source.is_some() || date.is_some() {
            blocks.push(ContentBlock::SourceDate { source, date });
        }

        if has_body {
            blocks.push(ContentBlock::ReturnPlaceholder);
        }
        blocks
    }

    fn decorate_title(&self, title: &str) -> String {
        self.title_format.replacen("{}", title, 1)
    }
}
