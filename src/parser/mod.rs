//! Structural parser: recovers the Division > Section > Subsection tree from
//! normalized extraction text in one forward pass over its lines.

mod grammar;

pub use grammar::{GrammarPatterns, HeaderKind, LineKind, PAGE_BREAK_MARKER, SpecGrammar};

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedDocument {
    pub divisions: Vec<ParsedDivision>,
    pub total_pages: i64,
    pub report: ParseReport,
}

impl ParsedDocument {
    pub fn sections(&self) -> impl Iterator<Item = (&ParsedDivision, &ParsedSection)> {
        self.divisions
            .iter()
            .flat_map(|division| division.sections.iter().map(move |section| (division, section)))
    }

    pub fn section_count(&self) -> usize {
        self.divisions.iter().map(|division| division.sections.len()).sum()
    }

    pub fn subsection_count(&self) -> usize {
        self.sections()
            .map(|(_, section)| section.subsections.len())
            .sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedDivision {
    pub number: i64,
    pub title: String,
    pub start_page: i64,
    pub end_page: i64,
    pub sections: Vec<ParsedSection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedSection {
    pub number: String,
    pub title: String,
    pub start_page: i64,
    pub end_page: i64,
    pub pay_item_codes: Vec<String>,
    pub full_text: String,
    /// Content that appeared before the first subsection header.
    pub preamble: String,
    /// Page each blank-line separated paragraph of `preamble` starts on.
    pub preamble_pages: Vec<i64>,
    pub subsections: Vec<ParsedSubsection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedSubsection {
    pub number: String,
    pub title: String,
    pub content: String,
    /// Page each blank-line separated paragraph of `content` starts on.
    pub paragraph_pages: Vec<i64>,
    pub level: usize,
    pub page_number: i64,
    pub cross_references: Vec<String>,
}

/// Lines the scanner could not attribute. None of these fail a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseReport {
    pub lines_scanned: usize,
    pub page_breaks: usize,
    pub orphan_headers: usize,
    pub unattributed_lines: usize,
    pub demoted_subsection_headers: usize,
}

pub struct StructuralParser<'g> {
    grammar: &'g SpecGrammar,
}

impl<'g> StructuralParser<'g> {
    pub fn new(grammar: &'g SpecGrammar) -> Self {
        Self { grammar }
    }

    pub fn parse(&self, text: &str) -> ParsedDocument {
        let mut state = ParseState::new();

        for line in text.lines() {
            state.report.lines_scanned += 1;
            match self.grammar.classify_line(line) {
                LineKind::PageBreak => state.page_break(),
                LineKind::Blank => state.paragraph_break(),
                LineKind::Header {
                    kind: HeaderKind::Division,
                    number,
                    title,
                } => match number.parse::<i64>() {
                    Ok(number) => state.open_division(number, title),
                    Err(_) => self.append_content(&mut state, line.trim()),
                },
                LineKind::Header {
                    kind: HeaderKind::Section,
                    number,
                    title,
                } => state.open_section(number, title),
                LineKind::Header {
                    kind: HeaderKind::Subsection,
                    number,
                    title,
                } => {
                    if !state.open_subsection(number, title) {
                        self.append_content(&mut state, line.trim());
                    }
                }
                LineKind::Content(content) => self.append_content(&mut state, content),
            }
        }

        state.finish()
    }

    fn append_content(&self, state: &mut ParseState, line: &str) {
        state.mark_line();

        let Some((division_index, section_index)) = state.section else {
            state.report.unattributed_lines += 1;
            return;
        };

        let page = state.page;
        let section = &mut state.divisions[division_index].sections[section_index];
        append_line(&mut section.full_text, line, state.section_break);
        state.section_break = false;

        for code in self.grammar.pay_item_codes(line) {
            push_unique(&mut section.pay_item_codes, code);
        }

        let Some(subsection_index) = state.subsection else {
            if append_line(&mut section.preamble, line, state.subsection_break) {
                section.preamble_pages.push(page);
            }
            state.subsection_break = false;
            return;
        };

        let subsection = &mut section.subsections[subsection_index];
        if append_line(&mut subsection.content, line, state.subsection_break) {
            subsection.paragraph_pages.push(page);
        }
        state.subsection_break = false;

        for reference in self.grammar.cross_references(line) {
            push_unique(&mut subsection.cross_references, reference);
        }
    }
}

/// Cursors for the single pass. `section` may still point into an earlier
/// division: a division header alone does not close the open section.
struct ParseState {
    divisions: Vec<ParsedDivision>,
    division: Option<usize>,
    section: Option<(usize, usize)>,
    subsection: Option<usize>,
    page: i64,
    last_line_page: i64,
    saw_content: bool,
    section_break: bool,
    subsection_break: bool,
    report: ParseReport,
}

impl ParseState {
    fn new() -> Self {
        Self {
            divisions: Vec::new(),
            division: None,
            section: None,
            subsection: None,
            page: 1,
            last_line_page: 1,
            saw_content: false,
            section_break: false,
            subsection_break: false,
            report: ParseReport::default(),
        }
    }

    fn mark_line(&mut self) {
        self.last_line_page = self.page;
        self.saw_content = true;
    }

    fn page_break(&mut self) {
        self.page += 1;
        self.report.page_breaks += 1;
    }

    fn paragraph_break(&mut self) {
        self.section_break = true;
        self.subsection_break = true;
    }

    fn open_division(&mut self, number: i64, title: &str) {
        // Not a line of the open section, so last_line_page stays put.
        self.saw_content = true;

        let index = match self
            .divisions
            .iter()
            .position(|division| division.number == number)
        {
            Some(index) => {
                debug!(division = number, "re-opened division");
                index
            }
            None => {
                self.divisions.push(ParsedDivision {
                    number,
                    title: title.to_string(),
                    start_page: self.page,
                    end_page: self.page,
                    sections: Vec::new(),
                });
                self.divisions.len() - 1
            }
        };

        self.division = Some(index);
    }

    fn open_section(&mut self, number: &str, title: &str) {
        let Some(division_index) = self.division else {
            self.report.orphan_headers += 1;
            debug!(section = number, "section header without a division");
            return;
        };

        self.close_section();
        self.mark_line();

        let sections = &mut self.divisions[division_index].sections;
        let index = match sections.iter().position(|section| section.number == number) {
            Some(index) => index,
            None => {
                sections.push(ParsedSection {
                    number: number.to_string(),
                    title: title.to_string(),
                    start_page: self.page,
                    end_page: self.page,
                    pay_item_codes: Vec::new(),
                    full_text: String::new(),
                    preamble: String::new(),
                    preamble_pages: Vec::new(),
                    subsections: Vec::new(),
                });
                sections.len() - 1
            }
        };

        self.section = Some((division_index, index));
        self.subsection = None;
        self.section_break = true;
        self.subsection_break = false;
    }

    /// Returns false when the number does not extend the open section's
    /// number; the caller then treats the line as content.
    fn open_subsection(&mut self, number: &str, title: &str) -> bool {
        let Some((division_index, section_index)) = self.section else {
            self.report.orphan_headers += 1;
            debug!(subsection = number, "subsection header without a section");
            return true;
        };

        let section = &mut self.divisions[division_index].sections[section_index];
        let extends_section = number
            .strip_prefix(section.number.as_str())
            .is_some_and(|rest| rest.starts_with('.'));
        if !extends_section {
            self.report.demoted_subsection_headers += 1;
            return false;
        }

        self.last_line_page = self.page;
        self.saw_content = true;

        section.subsections.push(ParsedSubsection {
            number: number.to_string(),
            title: title.to_string(),
            content: String::new(),
            paragraph_pages: Vec::new(),
            level: number.matches('.').count(),
            page_number: self.page,
            cross_references: Vec::new(),
        });
        self.subsection = Some(section.subsections.len() - 1);
        self.section_break = true;
        self.subsection_break = false;
        true
    }

    fn close_section(&mut self) {
        if let Some((division_index, section_index)) = self.section {
            let section = &mut self.divisions[division_index].sections[section_index];
            section.end_page = self.last_line_page.max(section.start_page);
        }
    }

    fn finish(mut self) -> ParsedDocument {
        let final_page = if self.saw_content { self.page } else { 0 };

        if let Some((division_index, section_index)) = self.section {
            let section = &mut self.divisions[division_index].sections[section_index];
            section.end_page = final_page.max(section.start_page);
        }

        for division in &mut self.divisions {
            let last_section_end = division
                .sections
                .iter()
                .map(|section| section.end_page)
                .max()
                .unwrap_or(division.start_page);
            division.end_page = last_section_end.max(division.start_page);
        }

        if let Some(division_index) = self.division {
            let division = &mut self.divisions[division_index];
            division.end_page = final_page.max(division.start_page);
        }

        ParsedDocument {
            divisions: self.divisions,
            total_pages: final_page,
            report: self.report,
        }
    }
}

/// Returns true when the line starts a new paragraph of `buffer`.
fn append_line(buffer: &mut String, line: &str, paragraph_break: bool) -> bool {
    let starts_paragraph = buffer.is_empty() || paragraph_break;
    if !buffer.is_empty() {
        buffer.push_str(if paragraph_break { "\n\n" } else { "\n" });
    }
    buffer.push_str(line);
    starts_paragraph
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|existing| existing == value) {
        values.push(value.to_string());
    }
}
