use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::parser::PAGE_BREAK_MARKER;

const MIN_REPEATED_EDGE_PAGES: usize = 3;
const MAX_EDGE_LINE_CHARS: usize = 120;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizationStats {
    pub pages: usize,
    pub header_lines_removed: usize,
    pub footer_lines_removed: usize,
    pub dehyphenation_merges: usize,
}

/// Removes running headers/footers repeated across pages and re-joins words
/// hyphenated across line ends. Lines for which `is_protected` holds (the
/// structural headers) are never treated as running page chrome.
pub fn normalize_pages(
    text: &str,
    is_protected: impl Fn(&str) -> bool,
) -> (String, NormalizationStats) {
    let pages = split_pages(text);
    let header_candidates = detect_repeated_edge_lines(&pages, true, &is_protected);
    let footer_candidates = detect_repeated_edge_lines(&pages, false, &is_protected);

    let mut stats = NormalizationStats {
        pages: pages.len(),
        ..NormalizationStats::default()
    };

    let mut normalized_pages = Vec::with_capacity(pages.len());
    for page in pages {
        let mut lines = page;

        if let Some(index) = first_nonempty_line_index(&lines) {
            let candidate = normalize_edge_line(&lines[index]);
            if header_candidates.contains(&candidate) {
                lines.remove(index);
                stats.header_lines_removed += 1;
            }
        }

        if let Some(index) = last_nonempty_line_index(&lines) {
            let candidate = normalize_edge_line(&lines[index]);
            if footer_candidates.contains(&candidate) {
                lines.remove(index);
                stats.footer_lines_removed += 1;
            }
        }

        let (merged, merges) = merge_hyphenated_lines(lines);
        stats.dehyphenation_merges += merges;
        normalized_pages.push(merged.join("\n"));
    }

    (
        normalized_pages.join(&format!("\n{PAGE_BREAK_MARKER}\n")),
        stats,
    )
}

fn split_pages(text: &str) -> Vec<Vec<String>> {
    let mut pages = vec![Vec::new()];
    for line in text.lines() {
        if line.contains(PAGE_BREAK_MARKER) && line.trim().is_empty() {
            pages.push(Vec::new());
            continue;
        }
        if let Some(page) = pages.last_mut() {
            page.push(line.to_string());
        }
    }
    pages
}

fn detect_repeated_edge_lines(
    pages: &[Vec<String>],
    header: bool,
    is_protected: &impl Fn(&str) -> bool,
) -> HashSet<String> {
    let mut counts = HashMap::<String, usize>::new();
    for page in pages {
        let candidate = if header {
            page.iter().map(|line| line.trim()).find(|line| !line.is_empty())
        } else {
            page.iter().rev().map(|line| line.trim()).find(|line| !line.is_empty())
        };

        let Some(candidate) = candidate else {
            continue;
        };
        if is_protected(candidate) {
            continue;
        }

        let normalized = normalize_edge_line(candidate);
        if normalized.is_empty() || normalized.len() > MAX_EDGE_LINE_CHARS {
            continue;
        }
        *counts.entry(normalized).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .filter_map(|(candidate, count)| {
            if count >= MIN_REPEATED_EDGE_PAGES {
                Some(candidate)
            } else {
                None
            }
        })
        .collect()
}

fn normalize_edge_line(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .to_ascii_lowercase()
}

fn first_nonempty_line_index(lines: &[String]) -> Option<usize> {
    lines.iter().position(|line| !line.trim().is_empty())
}

fn last_nonempty_line_index(lines: &[String]) -> Option<usize> {
    lines.iter().rposition(|line| !line.trim().is_empty())
}

fn merge_hyphenated_lines(lines: Vec<String>) -> (Vec<String>, usize) {
    let mut merged = Vec::<String>::with_capacity(lines.len());
    let mut merges = 0usize;
    let mut index = 0usize;

    while index < lines.len() {
        let current = &lines[index];
        if let Some(next) = lines.get(index + 1) {
            if should_merge_hyphenated_pair(current, next) {
                merged.push(format!(
                    "{}{}",
                    current.trim_end().trim_end_matches('-'),
                    next.trim_start()
                ));
                merges += 1;
                index += 2;
                continue;
            }
        }

        merged.push(current.clone());
        index += 1;
    }

    (merged, merges)
}

fn should_merge_hyphenated_pair(current: &str, next: &str) -> bool {
    let left = current.trim_end();
    if !left.ends_with('-') {
        return false;
    }

    let starts_with_lowercase = next
        .trim_start()
        .chars()
        .next()
        .is_some_and(|character| character.is_ascii_lowercase());
    if !starts_with_lowercase {
        return false;
    }

    left.trim_end_matches('-')
        .chars()
        .last()
        .is_some_and(|character| character.is_ascii_alphabetic())
}
