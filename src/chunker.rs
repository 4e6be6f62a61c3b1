//! Token-bounded chunking of parsed sections for downstream retrieval.

use std::collections::HashMap;

use serde::Serialize;

use crate::classify::classify_subsection;
use crate::model::ChunkType;
use crate::parser::{ParsedSection, SpecGrammar};

pub const DEFAULT_MAX_CHUNK_TOKENS: usize = 512;
const CHARS_PER_TOKEN: usize = 4;
const MAX_KEYWORDS: usize = 10;
const MIN_KEYWORD_CHARS: usize = 4;

const STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "also", "been", "before", "being", "below",
    "between", "both", "but", "could", "does", "doing", "down", "during", "each", "from",
    "further", "have", "having", "here", "into", "itself", "just", "more", "most", "only",
    "other", "over", "same", "shall", "should", "some", "such", "than", "that", "their",
    "them", "then", "there", "these", "they", "this", "those", "through", "under", "until",
    "upon", "very", "were", "what", "when", "where", "which", "while", "will", "with", "within",
    "would", "your",
];

/// Character-count approximation; monotonic in the text length.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkDraft {
    pub chunk_type: ChunkType,
    pub content: String,
    pub section_context: String,
    pub pay_item_codes: Vec<String>,
    pub keywords: Vec<String>,
    pub page_number: i64,
    pub token_count: usize,
    /// Index into the owning section's subsections.
    pub subsection_index: Option<usize>,
}

/// A packed run of paragraphs and the page its first paragraph starts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedPiece {
    pub page_number: i64,
    pub content: String,
}

pub struct Chunker<'g> {
    grammar: &'g SpecGrammar,
    max_tokens: usize,
}

impl<'g> Chunker<'g> {
    pub fn new(grammar: &'g SpecGrammar, max_tokens: usize) -> Self {
        Self {
            grammar,
            max_tokens: max_tokens.max(1),
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn chunk_section(&self, section: &ParsedSection) -> Vec<ChunkDraft> {
        let section_label = format!("Section {}", section.number);
        let mut chunks = vec![self.draft(
            ChunkType::SectionHeader,
            format!("SECTION {} - {}", section.number, section.title),
            section_label.clone(),
            section.start_page,
            None,
        )];

        if !section.preamble.trim().is_empty() {
            let chunk_type = classify_subsection(&section.title, &section.preamble);
            let pieces =
                self.pack_paragraphs(&section.preamble, &section.preamble_pages, section.start_page);
            for piece in pieces {
                chunks.push(self.draft(
                    chunk_type,
                    piece.content,
                    section_label.clone(),
                    piece.page_number,
                    None,
                ));
            }
        }

        for (index, subsection) in section.subsections.iter().enumerate() {
            if subsection.content.trim().is_empty() {
                continue;
            }

            let chunk_type = classify_subsection(&subsection.title, &subsection.content);
            let context = format!(
                "{} > {} {}",
                section_label, subsection.number, subsection.title
            );
            let pieces = self.pack_paragraphs(
                &subsection.content,
                &subsection.paragraph_pages,
                subsection.page_number,
            );
            for piece in pieces {
                chunks.push(self.draft(
                    chunk_type,
                    piece.content,
                    context.clone(),
                    piece.page_number,
                    Some(index),
                ));
            }
        }

        chunks
    }

    /// Greedy packing on blank-line boundaries. A paragraph is never split,
    /// so one that alone exceeds the budget becomes an oversized piece.
    /// `paragraph_pages[i]` is the page paragraph `i` starts on; paragraphs
    /// without an entry inherit the previous page, starting from
    /// `first_page`.
    pub fn pack_paragraphs(
        &self,
        content: &str,
        paragraph_pages: &[i64],
        first_page: i64,
    ) -> Vec<PackedPiece> {
        let first_page = paragraph_pages.first().copied().unwrap_or(first_page);
        if estimate_tokens(content) <= self.max_tokens {
            return vec![PackedPiece {
                page_number: first_page,
                content: content.to_string(),
            }];
        }

        let mut pieces = Vec::new();
        let mut buffer = String::new();
        let mut buffer_page = first_page;
        let mut page = first_page;

        for (index, paragraph) in split_paragraphs(content).into_iter().enumerate() {
            page = paragraph_pages.get(index).copied().unwrap_or(page);
            if buffer.is_empty() {
                buffer = paragraph;
                buffer_page = page;
                continue;
            }

            let candidate = format!("{buffer}\n\n{paragraph}");
            if estimate_tokens(&candidate) > self.max_tokens {
                pieces.push(PackedPiece {
                    page_number: buffer_page,
                    content: std::mem::replace(&mut buffer, paragraph),
                });
                buffer_page = page;
            } else {
                buffer = candidate;
            }
        }

        if !buffer.is_empty() {
            pieces.push(PackedPiece {
                page_number: buffer_page,
                content: buffer,
            });
        }

        pieces
    }

    fn draft(
        &self,
        chunk_type: ChunkType,
        content: String,
        section_context: String,
        page_number: i64,
        subsection_index: Option<usize>,
    ) -> ChunkDraft {
        let mut pay_item_codes = Vec::<String>::new();
        for code in self.grammar.pay_item_codes(&content) {
            if !pay_item_codes.iter().any(|existing| existing == code) {
                pay_item_codes.push(code.to_string());
            }
        }

        ChunkDraft {
            chunk_type,
            keywords: extract_keywords(&content),
            token_count: estimate_tokens(&content),
            pay_item_codes,
            content,
            section_context,
            page_number,
            subsection_index,
        }
    }
}

fn split_paragraphs(content: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = Vec::<&str>::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        current.push(line);
    }

    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs
}

/// Top terms by frequency; ties keep first-occurrence order.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let normalized = text
        .to_lowercase()
        .chars()
        .map(|character| {
            if character.is_alphanumeric() {
                character
            } else {
                ' '
            }
        })
        .collect::<String>();

    let mut counts = HashMap::<&str, (usize, usize)>::new();
    for (position, token) in normalized.split_whitespace().enumerate() {
        if token.chars().count() < MIN_KEYWORD_CHARS || STOP_WORDS.contains(&token) {
            continue;
        }
        counts.entry(token).or_insert((0, position)).0 += 1;
    }

    let mut ranked = counts.into_iter().collect::<Vec<_>>();
    ranked.sort_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
        count_b.cmp(count_a).then(first_a.cmp(first_b))
    });

    ranked
        .into_iter()
        .take(MAX_KEYWORDS)
        .map(|(token, _)| token.to_string())
        .collect()
}
