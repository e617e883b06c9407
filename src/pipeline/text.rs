//! Text shaping for body content: whitespace cleanup, paragraph splitting,
//! `**bold**` emphasis and the inline-heading heuristic.
//!
//! All functions are pure (`&str → owned`) so the assembler can apply them
//! in a fixed order:
//!
//! 1. [`normalize_whitespace`]: drop full-width spaces, collapse blanks,
//!    trim lines, cap blank-line runs
//! 2. [`split_paragraph_lines`]: blank-line paragraphs, then one entry per line
//! 3. [`parse_emphasis`] for lines carrying `*`, otherwise
//!    [`looks_like_inline_heading`]

use crate::config::InlineHeadingPolicy;
use once_cell::sync::Lazy;
use regex::Regex;

// ── Rule 1: Whitespace ───────────────────────────────────────────────────────

static RE_BLANKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());
static RE_BLANK_LINE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n\s*\n+").unwrap());

/// Remove U+3000, collapse space/tab runs, trim every line and reduce three
/// or more consecutive line breaks to one blank separator.
pub fn normalize_whitespace(input: &str) -> String {
    let s = input.replace("\r\n", "\n").replace('\r', "\n");
    let s = s.replace('\u{3000}', "");
    let s = RE_BLANKS.replace_all(&s, " ");
    let s = s.split('\n').map(str::trim).collect::<Vec<_>>().join("\n");
    RE_BLANK_LINE_RUNS.replace_all(&s, "\n\n").into_owned()
}

// ── Rule 2: Paragraph splitting ──────────────────────────────────────────────

static RE_PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").unwrap());

/// Split normalized text into the lines that each become one paragraph.
///
/// Blank-line boundaries separate paragraphs; a single newline inside a
/// paragraph also starts a new one. Empty lines are dropped.
pub fn split_paragraph_lines(text: &str) -> Vec<String> {
    RE_PARAGRAPH_BREAK
        .split(text)
        .flat_map(|para| para.split('\n'))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Rule 3: Emphasis ─────────────────────────────────────────────────────────

static RE_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.*?)\*\*").unwrap());

/// A piece of a line with its emphasis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub bold: bool,
}

/// Split `**marked**` spans into bold segments. Stray `*` outside a pair is
/// removed. Empty segments are skipped.
pub fn parse_emphasis(line: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut push = |text: String, bold: bool| {
        if !text.is_empty() {
            out.push(Segment { text, bold });
        }
    };
    let mut last = 0;
    for caps in RE_BOLD.captures_iter(line) {
        let Some(whole) = caps.get(0) else { continue };
        push(line[last..whole.start()].replace('*', ""), false);
        push(caps[1].to_string(), true);
        last = whole.end();
    }
    push(line[last..].replace('*', ""), false);
    out
}

// ── Rule 4: Inline headings ──────────────────────────────────────────────────

const TERMINAL_PUNCT: &[char] = &['。', '；', ';', '.', '!', '！', '？', '?'];
const MID_SENTENCE_PUNCT: &[char] = &['，', '、', '；', '。', '.', '!', '！', '？'];
const DENSITY_PUNCT: &[char] = &[
    '\'', '‘', '’', '(', ')', '（', '）', '[', ']', '【', '】', '<', '>', '《', '》', '—', '-',
    '·', '+', '/', ':', '"',
];

fn is_ideograph(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn ideograph_count(s: &str) -> usize {
    s.chars().filter(|c| is_ideograph(*c)).count()
}

/// Whether a plain line reads like a short sub-heading and should be bold.
///
/// Two shapes qualify:
/// - `label：description`, with a short label and no terminal punctuation
/// - a short phrase with no sentence punctuation, enough ideographs and a
///   low punctuation density
pub fn looks_like_inline_heading(line: &str, policy: &InlineHeadingPolicy) -> bool {
    if !policy.enabled {
        return false;
    }
    let t = line.trim();
    let len = t.chars().count();
    if len < policy.min_chars || len > policy.max_chars {
        return false;
    }
    let lower = t.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return false;
    }

    // Label shape.
    let colon = if t.contains('：') { '：' } else { ':' };
    let parts: Vec<&str> = t.split(colon).collect();
    if parts.len() == 2 {
        let label = parts[0].trim().chars().count();
        let description = parts[1].trim();
        if (policy.label_min_chars..=policy.label_max_chars).contains(&label)
            && !description.ends_with(TERMINAL_PUNCT)
            && ideograph_count(t) >= policy.label_min_ideographs
        {
            return true;
        }
    }

    if t.ends_with(TERMINAL_PUNCT) || t.ends_with([':', '：']) {
        return false;
    }
    if t.contains(MID_SENTENCE_PUNCT) {
        return false;
    }
    if ideograph_count(t) < policy.min_ideographs {
        return false;
    }
    let punct = t.chars().filter(|c| DENSITY_PUNCT.contains(c)).count();
    punct <= policy.punct_floor.max(len / policy.punct_divisor.max(1))
}
