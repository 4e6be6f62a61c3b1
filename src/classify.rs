//! Phrase-rule classifier for subsection content.
//!
//! Best-effort heuristic: lower-cased substring matching over the title and
//! content, evaluated in a fixed order where the first matching rule wins.

use crate::model::ChunkType;

const MEASUREMENT_PHRASES: &[&str] = &[
    "method of measurement",
    "measurement",
    "will be measured",
    "shall be measured",
    "measured by",
    "measured in",
];

const PAYMENT_PHRASES: &[&str] = &[
    "basis of payment",
    "payment will be made",
    "will be paid",
    "paid for",
    "pay item",
    "payment",
    "compensation",
];

const MATERIAL_PHRASES: &[&str] = &[
    "material requirements",
    "materials",
    "material shall",
    "aashto",
    "astm",
    "gradation",
];

const PROCEDURE_PHRASES: &[&str] = &[
    "construction requirements",
    "construction methods",
    "method of construction",
    "procedure",
    "shall be placed",
    "installation",
];

const DEFINITION_PHRASES: &[&str] = &[
    "definitions",
    "definition",
    "defined as",
    "shall mean",
    "the term",
];

const OBLIGATION_WORDS: &[&str] = &["shall", "must", "required"];

const RULES: &[(ChunkType, &[&str])] = &[
    (ChunkType::Measurement, MEASUREMENT_PHRASES),
    (ChunkType::Payment, PAYMENT_PHRASES),
    (ChunkType::MaterialSpec, MATERIAL_PHRASES),
    (ChunkType::Procedure, PROCEDURE_PHRASES),
    (ChunkType::Definition, DEFINITION_PHRASES),
    (ChunkType::Requirement, OBLIGATION_WORDS),
];

pub fn classify_subsection(title: &str, content: &str) -> ChunkType {
    let haystack = format!("{title} {content}").to_lowercase();

    RULES
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|phrase| haystack.contains(phrase)))
        .map(|(chunk_type, _)| *chunk_type)
        .unwrap_or(ChunkType::Requirement)
}
