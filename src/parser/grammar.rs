use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DIVISION_HEADER_PATTERN: &str = r"^\s*DIVISION\s+(\d+)\s*[-–—:]\s*(\S.*?)\s*$";
pub const SECTION_HEADER_PATTERN: &str = r"^\s*SECTION\s+(\d+[A-Z]?)\s*[-–—:]\s*(\S.*?)\s*$";
pub const SUBSECTION_HEADER_PATTERN: &str = r"^\s*(\d+(?:\.\d+)+)\.?\s+(\S.*?)\s*$";
pub const PAY_ITEM_CODE_PATTERN: &str = r"\b\d{3}-\d{2}(?:-\d{2})?\b";
pub const CROSS_REFERENCE_PATTERN: &str = r"\b(?:Section|Subsection)\s+(\d+(?:\.\d+)*)";
pub const TOC_LINE_PATTERN: &str = r"\.{3,}\s*\d+\s*$";
pub const MAX_SUBSECTION_TITLE_CHARS: usize = 140;

/// Form feed on a line of its own separates pages in normalized text.
pub const PAGE_BREAK_MARKER: char = '\u{000C}';

/// Raw patterns for one specification dialect. Every header pattern must
/// capture the number in group 1 and the title in group 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrammarPatterns {
    pub division_header: String,
    pub section_header: String,
    pub subsection_header: String,
    pub pay_item_code: String,
    pub cross_reference: String,
    pub toc_line: String,
    pub max_subsection_title_chars: usize,
}

impl Default for GrammarPatterns {
    fn default() -> Self {
        Self {
            division_header: DIVISION_HEADER_PATTERN.to_string(),
            section_header: SECTION_HEADER_PATTERN.to_string(),
            subsection_header: SUBSECTION_HEADER_PATTERN.to_string(),
            pay_item_code: PAY_ITEM_CODE_PATTERN.to_string(),
            cross_reference: CROSS_REFERENCE_PATTERN.to_string(),
            toc_line: TOC_LINE_PATTERN.to_string(),
            max_subsection_title_chars: MAX_SUBSECTION_TITLE_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Division,
    Section,
    Subsection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind<'a> {
    PageBreak,
    Blank,
    Header {
        kind: HeaderKind,
        number: &'a str,
        title: &'a str,
    },
    Content(&'a str),
}

#[derive(Debug, Clone)]
pub struct SpecGrammar {
    division_header: Regex,
    section_header: Regex,
    subsection_header: Regex,
    pay_item_code: Regex,
    cross_reference: Regex,
    toc_line: Regex,
    max_subsection_title_chars: usize,
}

impl SpecGrammar {
    pub fn standard() -> Result<Self> {
        Self::new(&GrammarPatterns::default())
    }

    pub fn new(patterns: &GrammarPatterns) -> Result<Self> {
        Ok(Self {
            division_header: compile_header(&patterns.division_header, "division header")?,
            section_header: compile_header(&patterns.section_header, "section header")?,
            subsection_header: compile_header(&patterns.subsection_header, "subsection header")?,
            pay_item_code: Regex::new(&patterns.pay_item_code)
                .context("failed to compile pay item code regex")?,
            cross_reference: Regex::new(&patterns.cross_reference)
                .context("failed to compile cross-reference regex")?,
            toc_line: Regex::new(&patterns.toc_line)
                .context("failed to compile table-of-contents line regex")?,
            max_subsection_title_chars: patterns.max_subsection_title_chars,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let patterns: GrammarPatterns = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::new(&patterns).with_context(|| format!("invalid grammar in {}", path.display()))
    }

    /// Headers are tried Division, then Section, then Subsection; the first
    /// match wins even when a later pattern would also match.
    pub fn classify_line<'a>(&self, line: &'a str) -> LineKind<'a> {
        if is_page_break(line) {
            return LineKind::PageBreak;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            return LineKind::Blank;
        }

        if self.toc_line.is_match(trimmed) {
            return LineKind::Content(trimmed);
        }

        let candidates = [
            (HeaderKind::Division, &self.division_header),
            (HeaderKind::Section, &self.section_header),
            (HeaderKind::Subsection, &self.subsection_header),
        ];

        for (kind, pattern) in candidates {
            let Some(captures) = pattern.captures(trimmed) else {
                continue;
            };
            let (Some(number), Some(title)) = (captures.get(1), captures.get(2)) else {
                continue;
            };

            let title = title.as_str().trim();
            if kind == HeaderKind::Subsection
                && (title.is_empty() || title.chars().count() > self.max_subsection_title_chars)
            {
                return LineKind::Content(trimmed);
            }

            return LineKind::Header {
                kind,
                number: number.as_str().trim(),
                title,
            };
        }

        LineKind::Content(trimmed)
    }

    pub fn is_header_line(&self, line: &str) -> bool {
        matches!(self.classify_line(line), LineKind::Header { .. })
    }

    pub fn pay_item_codes<'a>(&self, text: &'a str) -> impl Iterator<Item = &'a str> {
        self.pay_item_code.find_iter(text).map(|found| found.as_str())
    }

    pub fn cross_references<'a>(&self, text: &'a str) -> impl Iterator<Item = &'a str> {
        self.cross_reference
            .captures_iter(text)
            .filter_map(|captures| captures.get(1).map(|found| found.as_str()))
    }
}

pub fn is_page_break(line: &str) -> bool {
    line.contains(PAGE_BREAK_MARKER) && line.trim().is_empty()
}

fn compile_header(pattern: &str, label: &str) -> Result<Regex> {
    let regex = Regex::new(pattern).with_context(|| format!("failed to compile {label} regex"))?;
    if regex.captures_len() < 3 {
        bail!("{label} pattern must capture a number and a title: {pattern}");
    }
    Ok(regex)
}
