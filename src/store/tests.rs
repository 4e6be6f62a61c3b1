use super::*;
use crate::chunker::Chunker;
use crate::parser::{SpecGrammar, StructuralParser};

const SAMPLE: &str = "DIVISION 200 - EARTHWORK
SECTION 203 - EXCAVATION
203.1 Description
Excavate to lines shown per Section 203.2. Pay item 203-01.
203.2 Materials
Aggregate per Subsection 703.1.
\u{000C}
SECTION 204 - EMBANKMENT
204.1 Description
Build embankment in lifts.";

fn new_document(doc_id: &str, sha256: &str) -> NewDocument {
    NewDocument {
        doc_id: doc_id.to_string(),
        filename: "spec.pdf".to_string(),
        storage_location: "/tmp/spec.pdf".to_string(),
        sha256: sha256.to_string(),
    }
}

fn parse_and_chunk(text: &str) -> (ParsedDocument, Vec<Vec<ChunkDraft>>) {
    let grammar = SpecGrammar::standard().expect("standard grammar compiles");
    let parsed = StructuralParser::new(&grammar).parse(text);
    let chunker = Chunker::new(&grammar, 512);
    let chunks = parsed
        .sections()
        .map(|(_, section)| chunker.chunk_section(section))
        .collect();
    (parsed, chunks)
}

#[test]
fn register_creates_pending_document() {
    let store = SpecStore::open_in_memory().expect("store opens");

    let record = store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("registers");

    assert_eq!(record.status, ProcessingStatus::Pending);
    assert_eq!(record.total_chunks, 0);
    assert!(record.started_at.is_none());
}

#[test]
fn register_rejects_blank_id() {
    let store = SpecStore::open_in_memory().expect("store opens");

    assert!(store.register_document(&new_document("  ", "abc")).is_err());
}

#[test]
fn register_refuses_in_flight_document() {
    let store = SpecStore::open_in_memory().expect("store opens");
    store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("registers");
    store
        .set_status("spec-2024", ProcessingStatus::Parsing)
        .expect("status set");

    assert!(store.register_document(&new_document("spec-2024", "abc")).is_err());
}

#[test]
fn reregistering_completed_document_resets_only_on_hash_change() {
    let mut store = SpecStore::open_in_memory().expect("store opens");
    store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("registers");
    let (parsed, chunks) = parse_and_chunk(SAMPLE);
    store
        .replace_structure("spec-2024", &parsed, &chunks)
        .expect("structure stored");

    let same = store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("re-registers");
    assert_eq!(same.status, ProcessingStatus::Completed);

    let changed = store
        .register_document(&new_document("spec-2024", "def"))
        .expect("re-registers");
    assert_eq!(changed.status, ProcessingStatus::Pending);
    assert_eq!(changed.sha256, "def");
}

#[test]
fn extracting_stamps_started_at_and_clears_error() {
    let store = SpecStore::open_in_memory().expect("store opens");
    store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("registers");
    store
        .mark_failed("spec-2024", "extraction job spec timed out")
        .expect("failure recorded");

    store
        .set_status_at("spec-2024", ProcessingStatus::Extracting, "2026-01-02T03:04:05Z")
        .expect("status set");

    let record = store
        .get_document("spec-2024")
        .expect("loads")
        .expect("exists");
    assert_eq!(record.status, ProcessingStatus::Extracting);
    assert_eq!(record.started_at.as_deref(), Some("2026-01-02T03:04:05Z"));
    assert!(record.error_message.is_none());
}

#[test]
fn status_update_on_missing_document_fails() {
    let store = SpecStore::open_in_memory().expect("store opens");

    assert!(store.set_status("missing", ProcessingStatus::Parsing).is_err());
    assert!(store.mark_failed("missing", "boom").is_err());
}

#[test]
fn replace_structure_stores_rows_and_completes_document() {
    let mut store = SpecStore::open_in_memory().expect("store opens");
    store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("registers");
    let (parsed, chunks) = parse_and_chunk(SAMPLE);

    let counts = store
        .replace_structure("spec-2024", &parsed, &chunks)
        .expect("structure stored");

    assert_eq!(
        counts,
        StructureCounts {
            divisions: 1,
            sections: 2,
            subsections: 3,
            chunks: 5,
        }
    );
    assert_eq!(store.structure_counts("spec-2024").expect("counts"), counts);

    let record = store
        .get_document("spec-2024")
        .expect("loads")
        .expect("exists");
    assert_eq!(record.status, ProcessingStatus::Completed);
    assert_eq!(record.total_pages, 2);
    assert_eq!(record.total_sections, 2);
    assert_eq!(record.total_chunks, 5);
    assert!(record.completed_at.is_some());

    let types = store.chunk_type_counts("spec-2024").expect("type counts");
    assert!(types.contains(&("SECTION_HEADER".to_string(), 2)));
}

#[test]
fn replacing_twice_does_not_duplicate_rows() {
    let mut store = SpecStore::open_in_memory().expect("store opens");
    store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("registers");
    let (parsed, chunks) = parse_and_chunk(SAMPLE);

    let first = store
        .replace_structure("spec-2024", &parsed, &chunks)
        .expect("first store");
    let second = store
        .replace_structure("spec-2024", &parsed, &chunks)
        .expect("second store");

    assert_eq!(first, second);
    assert_eq!(store.structure_counts("spec-2024").expect("counts"), first);
}

#[test]
fn mismatched_chunk_groups_leave_previous_generation_intact() {
    let mut store = SpecStore::open_in_memory().expect("store opens");
    store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("registers");
    let (parsed, chunks) = parse_and_chunk(SAMPLE);
    let stored = store
        .replace_structure("spec-2024", &parsed, &chunks)
        .expect("stored");

    let result = store.replace_structure("spec-2024", &parsed, &chunks[..1]);

    assert!(result.is_err());
    assert_eq!(store.structure_counts("spec-2024").expect("counts"), stored);
}

#[test]
fn list_documents_is_ordered_by_id() {
    let store = SpecStore::open_in_memory().expect("store opens");
    store
        .register_document(&new_document("b-spec", "1"))
        .expect("registers");
    store
        .register_document(&new_document("a-spec", "2"))
        .expect("registers");

    let ids = store
        .list_documents()
        .expect("lists")
        .into_iter()
        .map(|document| document.doc_id)
        .collect::<Vec<_>>();

    assert_eq!(ids, vec!["a-spec", "b-spec"]);
}

#[test]
fn claim_is_refused_while_another_run_holds_the_document() {
    let store = SpecStore::open_in_memory().expect("store opens");
    store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("registers");

    let first = store
        .claim_for_extraction("spec-2024", "2026-05-01T10:00:00Z", "2026-05-01T09:30:00Z")
        .expect("first claim runs");
    let second = store
        .claim_for_extraction("spec-2024", "2026-05-01T10:05:00Z", "2026-05-01T09:35:00Z")
        .expect("second claim runs");

    assert!(first);
    assert!(!second);
    let record = store.get_document("spec-2024").expect("loads").expect("exists");
    assert_eq!(record.status, ProcessingStatus::Extracting);
    assert_eq!(record.started_at.as_deref(), Some("2026-05-01T10:00:00Z"));
}

#[test]
fn stale_holder_can_be_claimed_over() {
    let store = SpecStore::open_in_memory().expect("store opens");
    store
        .register_document(&new_document("spec-2024", "abc"))
        .expect("registers");
    store
        .set_status_at("spec-2024", ProcessingStatus::Extracting, "2026-05-01T08:00:00Z")
        .expect("status set");
    store
        .set_status_at("spec-2024", ProcessingStatus::Chunking, "2026-05-01T08:10:00Z")
        .expect("status set");

    let claimed = store
        .claim_for_extraction("spec-2024", "2026-05-01T10:00:00Z", "2026-05-01T09:30:00Z")
        .expect("claim runs");

    assert!(claimed);
    let record = store.get_document("spec-2024").expect("loads").expect("exists");
    assert_eq!(record.status, ProcessingStatus::Extracting);
    assert_eq!(record.started_at.as_deref(), Some("2026-05-01T10:00:00Z"));
}

#[test]
fn claim_of_unknown_document_is_refused() {
    let store = SpecStore::open_in_memory().expect("store opens");

    let claimed = store
        .claim_for_extraction("missing", "2026-05-01T10:00:00Z", "2026-05-01T09:30:00Z")
        .expect("claim runs");

    assert!(!claimed);
}
