use anyhow::{Context, Result};
use regex::Regex;

use crate::parser::PAGE_BREAK_MARKER;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPart {
    pub name: String,
    pub text: String,
}

/// Reassembles a split document. Parts are ordered by their provider name
/// using plain string order, so providers must name parts to sort correctly
/// (`doc-p01`, `doc-p02`, ... `doc-p10`).
#[derive(Debug)]
pub struct PartMerger {
    code_fence: Regex,
    page_chrome_comment: Regex,
    page_break_comment: Regex,
}

impl PartMerger {
    pub fn new() -> Result<Self> {
        Ok(Self {
            code_fence: Regex::new(r"^\s*```[A-Za-z0-9_-]*\s*$")
                .context("failed to compile code fence regex")?,
            page_chrome_comment: Regex::new(
                r"(?i)^\s*<!--\s*(?:PageHeader|PageFooter|PageNumber|image)\b.*-->\s*$",
            )
            .context("failed to compile page chrome comment regex")?,
            page_break_comment: Regex::new(r"(?i)^\s*<!--\s*PageBreak\s*-->\s*$")
                .context("failed to compile page break comment regex")?,
        })
    }

    pub fn merge(&self, mut parts: Vec<ExtractedPart>) -> String {
        parts.sort_by(|left, right| left.name.cmp(&right.name));

        let separator = format!("\n{PAGE_BREAK_MARKER}\n");
        parts
            .iter()
            .map(|part| self.clean_part(&part.text))
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(&separator)
    }

    /// Strips backend chrome and puts every page break on a line of its own.
    pub fn clean_part(&self, raw: &str) -> String {
        let unified = raw
            .replace("\r\n", "\n")
            .replace('\u{0000}', "")
            .replace(PAGE_BREAK_MARKER, &format!("\n{PAGE_BREAK_MARKER}\n"));

        let mut lines = Vec::<String>::new();
        for line in unified.lines() {
            if self.code_fence.is_match(line) || self.page_chrome_comment.is_match(line) {
                continue;
            }
            if line.contains(PAGE_BREAK_MARKER) || self.page_break_comment.is_match(line) {
                lines.push(PAGE_BREAK_MARKER.to_string());
                continue;
            }
            lines.push(line.trim_end().to_string());
        }

        let is_edge = |line: &String| line.trim().is_empty();
        while lines.last().is_some_and(is_edge) {
            lines.pop();
        }
        let leading = lines.iter().take_while(|line| is_edge(line)).count();
        lines.drain(..leading);

        lines.join("\n")
    }
}
