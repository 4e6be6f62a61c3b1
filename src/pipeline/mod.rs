//! Drives one document through extraction, parsing and chunking.
//!
//! Every status transition is persisted before the stage's work starts. Any
//! stage error ends the run in FAILED with the error recorded on the document;
//! only input errors (unknown document, missing payload, held lock) surface as
//! `Err` and leave the document untouched.
//!
//! The in-flight check up front only reports early; the lock itself is the
//! conditional EXTRACTING write in [`SpecStore::claim_for_extraction`].


use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::chunker::Chunker;
use crate::extraction::{
    DocumentPayload, ExtractedDocument, ExtractionClient, JobHandle, normalize_pages,
};
use crate::model::{DocumentRecord, IngestOutcome, ProcessingStatus, StructureCounts};
use crate::parser::{SpecGrammar, StructuralParser};
use crate::payload::PayloadSource;
use crate::store::SpecStore;
use crate::util::{parse_utc, sha256_bytes, utc_string};

pub const DEFAULT_STALE_LOCK_MINUTES: i64 = 30;

#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub doc_id: String,
    pub force: bool,
    /// Jobs already submitted to the primary backend; polled, not resubmitted.
    pub job_handles: Vec<JobHandle>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_chunk_tokens: usize,
    pub stale_after: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: crate::chunker::DEFAULT_MAX_CHUNK_TOKENS,
            stale_after: Duration::minutes(DEFAULT_STALE_LOCK_MINUTES),
        }
    }
}

enum ExtractionInput {
    Payload(DocumentPayload),
    Prestaged(Vec<JobHandle>),
}

pub struct IngestPipeline<'a> {
    store: &'a mut SpecStore,
    client: &'a ExtractionClient,
    payloads: &'a dyn PayloadSource,
    grammar: &'a SpecGrammar,
    config: PipelineConfig,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(
        store: &'a mut SpecStore,
        client: &'a ExtractionClient,
        payloads: &'a dyn PayloadSource,
        grammar: &'a SpecGrammar,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            client,
            payloads,
            grammar,
            config,
        }
    }

    pub fn run(&mut self, request: &IngestRequest) -> Result<IngestOutcome> {
        let doc_id = request.doc_id.trim();
        if doc_id.is_empty() {
            bail!("document id must not be blank");
        }

        let Some(document) = self.store.get_document(doc_id)? else {
            bail!("document not found: {doc_id}");
        };

        if document.status == ProcessingStatus::Completed && !request.force {
            info!(doc_id, "document already completed, skipping");
            return Ok(IngestOutcome {
                doc_id: document.doc_id.clone(),
                status: ProcessingStatus::Completed,
                short_circuited: true,
                total_pages: document.total_pages,
                counts: self.store.structure_counts(doc_id)?,
                error: None,
            });
        }

        self.check_lock(&document)?;

        let input = if request.job_handles.is_empty() {
            let payload = self.payloads.load(&document)?;
            let sha256 = sha256_bytes(&payload.bytes);
            if sha256 != document.sha256 {
                warn!(
                    doc_id,
                    registered = %document.sha256,
                    loaded = %sha256,
                    "payload changed since registration"
                );
            }
            ExtractionInput::Payload(payload)
        } else {
            ExtractionInput::Prestaged(request.job_handles.clone())
        };

        self.claim(doc_id)?;

        info!(
            doc_id,
            previous_status = document.status.as_str(),
            force = request.force,
            "starting ingestion"
        );

        match self.derive(doc_id, &input) {
            Ok((total_pages, counts)) => {
                info!(
                    doc_id,
                    total_pages,
                    divisions = counts.divisions,
                    sections = counts.sections,
                    subsections = counts.subsections,
                    chunks = counts.chunks,
                    "ingestion completed"
                );
                Ok(IngestOutcome {
                    doc_id: doc_id.to_string(),
                    status: ProcessingStatus::Completed,
                    short_circuited: false,
                    total_pages,
                    counts,
                    error: None,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(doc_id, error = %message, "ingestion failed");
                self.store
                    .mark_failed(doc_id, &message)
                    .with_context(|| format!("failed to record failure for {doc_id}"))?;

                let stored = self
                    .store
                    .get_document(doc_id)?
                    .with_context(|| format!("document not found: {doc_id}"))?;
                Ok(IngestOutcome {
                    doc_id: doc_id.to_string(),
                    status: ProcessingStatus::Failed,
                    short_circuited: false,
                    total_pages: stored.total_pages,
                    counts: self.store.structure_counts(doc_id)?,
                    error: Some(message),
                })
            }
        }
    }

    /// An in-flight status is a soft lock held by another run, unless its
    /// start is older than the stale window.
    fn check_lock(&self, document: &DocumentRecord) -> Result<()> {
        if !document.status.is_in_flight() {
            return Ok(());
        }

        let started = document.started_at.as_deref().and_then(parse_utc);
        match started {
            Some(started) if Utc::now() - started > self.config.stale_after => {
                warn!(
                    doc_id = %document.doc_id,
                    status = document.status.as_str(),
                    started_at = %started,
                    "taking over stale in-flight run"
                );
                Ok(())
            }
            _ => bail!(
                "document {} is locked by an in-flight run ({} since {})",
                document.doc_id,
                document.status.as_str(),
                document.started_at.as_deref().unwrap_or("unknown")
            ),
        }
    }

    /// Another run may have claimed the document since `check_lock` read it.
    fn claim(&self, doc_id: &str) -> Result<()> {
        let now = Utc::now();
        let stale_before = utc_string(now - self.config.stale_after);
        if self
            .store
            .claim_for_extraction(doc_id, &utc_string(now), &stale_before)?
        {
            return Ok(());
        }

        let holder = self
            .store
            .get_document(doc_id)?
            .with_context(|| format!("document not found: {doc_id}"))?;
        bail!(
            "document {doc_id} is locked by an in-flight run ({} since {})",
            holder.status.as_str(),
            holder.started_at.as_deref().unwrap_or("unknown")
        )
    }

    /// Runs with the document already claimed in EXTRACTING.
    fn derive(&mut self, doc_id: &str, input: &ExtractionInput) -> Result<(i64, StructureCounts)> {
        let extracted = self.extract(input)?;
        let (text, normalization) =
            normalize_pages(&extracted.text, |line| self.grammar.is_header_line(line));
        info!(
            doc_id,
            backend = extracted.backend,
            parts = extracted.parts.len(),
            pages = normalization.pages,
            header_lines_removed = normalization.header_lines_removed,
            footer_lines_removed = normalization.footer_lines_removed,
            dehyphenation_merges = normalization.dehyphenation_merges,
            "extraction finished"
        );

        self.store.set_status(doc_id, ProcessingStatus::Parsing)?;
        let parsed = StructuralParser::new(self.grammar).parse(&text);
        info!(
            doc_id,
            total_pages = parsed.total_pages,
            divisions = parsed.divisions.len(),
            sections = parsed.section_count(),
            subsections = parsed.subsection_count(),
            "parsed document structure"
        );
        if parsed.report.orphan_headers > 0 || parsed.report.unattributed_lines > 0 {
            warn!(
                doc_id,
                orphan_headers = parsed.report.orphan_headers,
                unattributed_lines = parsed.report.unattributed_lines,
                "text outside the document structure"
            );
        }

        self.store.set_status(doc_id, ProcessingStatus::Chunking)?;
        let chunker = Chunker::new(self.grammar, self.config.max_chunk_tokens);
        let section_chunks = parsed
            .sections()
            .map(|(_, section)| chunker.chunk_section(section))
            .collect::<Vec<_>>();
        info!(
            doc_id,
            max_chunk_tokens = chunker.max_tokens(),
            chunks = section_chunks.iter().map(Vec::len).sum::<usize>(),
            "chunked sections"
        );

        let counts = self
            .store
            .replace_structure(doc_id, &parsed, &section_chunks)
            .context("failed to store derived structure")?;

        Ok((parsed.total_pages, counts))
    }

    fn extract(&self, input: &ExtractionInput) -> Result<ExtractedDocument> {
        let extracted = match input {
            ExtractionInput::Payload(payload) => self.client.extract(payload),
            ExtractionInput::Prestaged(handles) => self.client.extract_prestaged(handles),
        };
        Ok(extracted?)
    }
}
