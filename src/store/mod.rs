//! SQLite persistence for documents and their derived structure.

mod db_setup;
#[cfg(test)]
mod tests;

pub use db_setup::DB_SCHEMA_VERSION;

use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;

use crate::chunker::ChunkDraft;
use crate::model::{DocumentRecord, ProcessingStatus, StructureCounts};
use crate::parser::ParsedDocument;
use crate::util::{now_utc_string, sanitize_ref_for_id};

const DOCUMENT_COLUMNS: &str = "doc_id, filename, storage_location, sha256, status, error_message,
    total_pages, total_sections, total_chunks, created_at, started_at, completed_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub doc_id: String,
    pub filename: String,
    pub storage_location: String,
    pub sha256: String,
}

pub struct SpecStore {
    connection: Connection,
}

impl SpecStore {
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        db_setup::configure_connection(&connection)?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        db_setup::enable_foreign_keys(&connection)?;
        db_setup::ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    /// Creates a PENDING document or refreshes an existing one. A COMPLETED
    /// document keeps its status unless the payload hash changed.
    pub fn register_document(&self, document: &NewDocument) -> Result<DocumentRecord> {
        if document.doc_id.trim().is_empty() {
            bail!("document id must not be blank");
        }

        let now = now_utc_string();
        match self.get_document(&document.doc_id)? {
            None => {
                self.connection
                    .execute(
                        "INSERT INTO documents(doc_id, filename, storage_location, sha256, status,
                           created_at, updated_at)
                         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                        params![
                            &document.doc_id,
                            &document.filename,
                            &document.storage_location,
                            &document.sha256,
                            ProcessingStatus::Pending.as_str(),
                            &now
                        ],
                    )
                    .with_context(|| format!("failed to insert document {}", document.doc_id))?;
            }
            Some(existing) => {
                if existing.status.is_in_flight() {
                    bail!(
                        "document {} is being processed ({}), refusing to re-register",
                        existing.doc_id,
                        existing.status.as_str()
                    );
                }

                let keep_completed = existing.status == ProcessingStatus::Completed
                    && existing.sha256 == document.sha256;
                let status = if keep_completed {
                    ProcessingStatus::Completed
                } else {
                    ProcessingStatus::Pending
                };

                self.connection
                    .execute(
                        "UPDATE documents SET filename = ?2, storage_location = ?3, sha256 = ?4,
                           status = ?5,
                           error_message = CASE WHEN ?6 THEN error_message ELSE NULL END,
                           updated_at = ?7
                         WHERE doc_id = ?1",
                        params![
                            &document.doc_id,
                            &document.filename,
                            &document.storage_location,
                            &document.sha256,
                            status.as_str(),
                            keep_completed,
                            &now
                        ],
                    )
                    .with_context(|| format!("failed to refresh document {}", document.doc_id))?;
            }
        }

        self.get_document(&document.doc_id)?
            .with_context(|| format!("document {} vanished after registration", document.doc_id))
    }

    pub fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRecord>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE doc_id = ?1");
        self.connection
            .query_row(&sql, [doc_id], document_from_row)
            .optional()
            .with_context(|| format!("failed to load document {doc_id}"))
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY doc_id");
        let mut statement = self.connection.prepare(&sql)?;
        let rows = statement.query_map([], document_from_row)?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(row.context("failed to read document row")?);
        }
        Ok(documents)
    }

    pub fn set_status(&self, doc_id: &str, status: ProcessingStatus) -> Result<()> {
        self.set_status_at(doc_id, status, &now_utc_string())
    }

    /// Entering EXTRACTING stamps `started_at` and clears the previous run's
    /// error; that timestamp is what the stale-lock check reads.
    pub fn set_status_at(&self, doc_id: &str, status: ProcessingStatus, at: &str) -> Result<()> {
        let result = if status == ProcessingStatus::Extracting {
            self.connection.execute(
                "UPDATE documents SET status = ?2, started_at = ?3, error_message = NULL,
                   updated_at = ?3
                 WHERE doc_id = ?1",
                params![doc_id, status.as_str(), at],
            )
        } else {
            self.connection.execute(
                "UPDATE documents SET status = ?2, updated_at = ?3 WHERE doc_id = ?1",
                params![doc_id, status.as_str(), at],
            )
        };
        let updated = result
            .with_context(|| format!("failed to set status {} on {doc_id}", status.as_str()))?;

        if updated == 0 {
            bail!("document not found: {doc_id}");
        }
        Ok(())
    }

    /// Moves the document into EXTRACTING in one conditional write. Another
    /// run holds the document while its status is in flight and its
    /// `started_at` is not older than `stale_before`; the claim is then
    /// refused and `false` returned.
    pub fn claim_for_extraction(&self, doc_id: &str, at: &str, stale_before: &str) -> Result<bool> {
        let updated = self
            .connection
            .execute(
                "UPDATE documents SET status = ?2, started_at = ?3, error_message = NULL,
                   updated_at = ?3
                 WHERE doc_id = ?1
                   AND (status NOT IN (?2, ?5, ?6)
                        OR (started_at IS NOT NULL AND started_at < ?4))",
                params![
                    doc_id,
                    ProcessingStatus::Extracting.as_str(),
                    at,
                    stale_before,
                    ProcessingStatus::Parsing.as_str(),
                    ProcessingStatus::Chunking.as_str()
                ],
            )
            .with_context(|| format!("failed to claim {doc_id} for extraction"))?;

        Ok(updated > 0)
    }

    pub fn mark_failed(&self, doc_id: &str, message: &str) -> Result<()> {
        let updated = self
            .connection
            .execute(
                "UPDATE documents SET status = ?2, error_message = ?3, updated_at = ?4
                 WHERE doc_id = ?1",
                params![
                    doc_id,
                    ProcessingStatus::Failed.as_str(),
                    message,
                    now_utc_string()
                ],
            )
            .with_context(|| format!("failed to record failure on {doc_id}"))?;

        if updated == 0 {
            bail!("document not found: {doc_id}");
        }
        Ok(())
    }

    pub fn structure_counts(&self, doc_id: &str) -> Result<StructureCounts> {
        Ok(StructureCounts {
            divisions: self.count_rows("divisions", doc_id)?,
            sections: self.count_rows("sections", doc_id)?,
            subsections: self.count_rows("subsections", doc_id)?,
            chunks: self.count_rows("chunks", doc_id)?,
        })
    }

    pub fn chunk_type_counts(&self, doc_id: &str) -> Result<Vec<(String, i64)>> {
        let mut statement = self.connection.prepare(
            "SELECT chunk_type, COUNT(*) FROM chunks WHERE doc_id = ?1
             GROUP BY chunk_type ORDER BY chunk_type",
        )?;
        let rows = statement.query_map([doc_id], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    fn count_rows(&self, table: &str, doc_id: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE doc_id = ?1");
        self.connection
            .query_row(&sql, [doc_id], |row| row.get(0))
            .with_context(|| format!("failed to count {table} rows for {doc_id}"))
    }

    /// Replaces every derived row of the document and marks it COMPLETED, all
    /// in one transaction. `section_chunks` lines up with
    /// [`ParsedDocument::sections`].
    pub fn replace_structure(
        &mut self,
        doc_id: &str,
        parsed: &ParsedDocument,
        section_chunks: &[Vec<ChunkDraft>],
    ) -> Result<StructureCounts> {
        if section_chunks.len() != parsed.section_count() {
            bail!(
                "chunk groups ({}) do not match parsed sections ({})",
                section_chunks.len(),
                parsed.section_count()
            );
        }

        let tx = self.connection.transaction()?;

        tx.execute("DELETE FROM chunks WHERE doc_id = ?1", [doc_id])?;
        tx.execute("DELETE FROM subsections WHERE doc_id = ?1", [doc_id])?;
        tx.execute("DELETE FROM sections WHERE doc_id = ?1", [doc_id])?;
        tx.execute("DELETE FROM divisions WHERE doc_id = ?1", [doc_id])?;

        let mut counts = StructureCounts::default();
        {
            let mut division_statement = tx.prepare(
                "INSERT INTO divisions(division_id, doc_id, division_number, title, start_page,
                   end_page, order_index)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let mut section_statement = tx.prepare(
                "INSERT INTO sections(section_id, doc_id, division_id, section_number, title,
                   start_page, end_page, pay_item_codes, full_text, order_index)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let mut subsection_statement = tx.prepare(
                "INSERT INTO subsections(subsection_id, doc_id, section_id, subsection_number,
                   title, content, level, page_number, cross_references, order_index)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let mut chunk_statement = tx.prepare(
                "INSERT INTO chunks(chunk_id, doc_id, section_id, subsection_id, chunk_index,
                   chunk_type, content, section_context, pay_item_codes, keywords, page_number,
                   token_count)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;

            let mut chunk_groups = section_chunks.iter();
            for (division_index, division) in parsed.divisions.iter().enumerate() {
                let division_id = format!("{doc_id}:div:{}", division.number);
                division_statement.execute(params![
                    &division_id,
                    doc_id,
                    division.number,
                    &division.title,
                    division.start_page,
                    division.end_page,
                    division_index as i64
                ])?;
                counts.divisions += 1;

                for (section_index, section) in division.sections.iter().enumerate() {
                    let section_id = format!(
                        "{doc_id}:sec:{}:{}",
                        division.number,
                        sanitize_ref_for_id(&section.number)
                    );
                    section_statement.execute(params![
                        &section_id,
                        doc_id,
                        &division_id,
                        &section.number,
                        &section.title,
                        section.start_page,
                        section.end_page,
                        serde_json::to_string(&section.pay_item_codes)?,
                        &section.full_text,
                        section_index as i64
                    ])?;
                    counts.sections += 1;

                    let mut subsection_ids = Vec::with_capacity(section.subsections.len());
                    for (subsection_index, subsection) in section.subsections.iter().enumerate() {
                        let subsection_id = format!("{section_id}:sub:{subsection_index}");
                        subsection_statement.execute(params![
                            &subsection_id,
                            doc_id,
                            &section_id,
                            &subsection.number,
                            &subsection.title,
                            &subsection.content,
                            subsection.level as i64,
                            subsection.page_number,
                            serde_json::to_string(&subsection.cross_references)?,
                            subsection_index as i64
                        ])?;
                        subsection_ids.push(subsection_id);
                        counts.subsections += 1;
                    }

                    let Some(chunks) = chunk_groups.next() else {
                        bail!("missing chunk group for section {}", section.number);
                    };
                    for chunk in chunks {
                        let subsection_id = match chunk.subsection_index {
                            Some(index) => Some(subsection_ids.get(index).with_context(|| {
                                format!(
                                    "chunk refers to subsection {index} outside section {}",
                                    section.number
                                )
                            })?),
                            None => None,
                        };

                        let chunk_index = counts.chunks;
                        chunk_statement.execute(params![
                            format!("{doc_id}:chunk:{chunk_index:05}"),
                            doc_id,
                            &section_id,
                            subsection_id,
                            chunk_index,
                            chunk.chunk_type.as_str(),
                            &chunk.content,
                            &chunk.section_context,
                            serde_json::to_string(&chunk.pay_item_codes)?,
                            serde_json::to_string(&chunk.keywords)?,
                            chunk.page_number,
                            chunk.token_count as i64
                        ])?;
                        counts.chunks += 1;
                    }
                }
            }
        }

        let now = now_utc_string();
        let updated = tx.execute(
            "UPDATE documents SET status = ?2, error_message = NULL, total_pages = ?3,
               total_sections = ?4, total_chunks = ?5, completed_at = ?6, updated_at = ?6
             WHERE doc_id = ?1",
            params![
                doc_id,
                ProcessingStatus::Completed.as_str(),
                parsed.total_pages,
                counts.sections,
                counts.chunks,
                &now
            ],
        )?;
        if updated == 0 {
            bail!("document not found: {doc_id}");
        }

        tx.commit()
            .with_context(|| format!("failed to commit structure for {doc_id}"))?;

        info!(
            doc_id,
            divisions = counts.divisions,
            sections = counts.sections,
            subsections = counts.subsections,
            chunks = counts.chunks,
            "stored document structure"
        );

        Ok(counts)
    }
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let status_raw: String = row.get(4)?;
    let status = ProcessingStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown processing status {status_raw}").into(),
        )
    })?;

    Ok(DocumentRecord {
        doc_id: row.get(0)?,
        filename: row.get(1)?,
        storage_location: row.get(2)?,
        sha256: row.get(3)?,
        status,
        error_message: row.get(5)?,
        total_pages: row.get(6)?,
        total_sections: row.get(7)?,
        total_chunks: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
