use anyhow::{Context, Result, bail};
use rusqlite::Connection;

use crate::util::now_utc_string;

pub const DB_SCHEMA_VERSION: &str = "1";

pub(super) fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub(super) fn enable_foreign_keys(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys")?;
    Ok(())
}

pub(super) fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS documents (
          doc_id TEXT PRIMARY KEY,
          filename TEXT NOT NULL,
          storage_location TEXT NOT NULL,
          sha256 TEXT NOT NULL,
          status TEXT NOT NULL,
          error_message TEXT,
          total_pages INTEGER NOT NULL DEFAULT 0,
          total_sections INTEGER NOT NULL DEFAULT 0,
          total_chunks INTEGER NOT NULL DEFAULT 0,
          created_at TEXT NOT NULL,
          started_at TEXT,
          completed_at TEXT,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS divisions (
          division_id TEXT PRIMARY KEY,
          doc_id TEXT NOT NULL,
          division_number INTEGER NOT NULL,
          title TEXT NOT NULL,
          start_page INTEGER,
          end_page INTEGER,
          order_index INTEGER NOT NULL DEFAULT 0,
          UNIQUE(doc_id, division_number),
          FOREIGN KEY(doc_id) REFERENCES documents(doc_id)
        );

        CREATE TABLE IF NOT EXISTS sections (
          section_id TEXT PRIMARY KEY,
          doc_id TEXT NOT NULL,
          division_id TEXT NOT NULL,
          section_number TEXT NOT NULL,
          title TEXT NOT NULL,
          start_page INTEGER,
          end_page INTEGER,
          pay_item_codes TEXT NOT NULL DEFAULT '[]',
          full_text TEXT NOT NULL DEFAULT '',
          order_index INTEGER NOT NULL DEFAULT 0,
          UNIQUE(division_id, section_number),
          FOREIGN KEY(doc_id) REFERENCES documents(doc_id),
          FOREIGN KEY(division_id) REFERENCES divisions(division_id)
        );

        CREATE TABLE IF NOT EXISTS subsections (
          subsection_id TEXT PRIMARY KEY,
          doc_id TEXT NOT NULL,
          section_id TEXT NOT NULL,
          subsection_number TEXT NOT NULL,
          title TEXT NOT NULL,
          content TEXT NOT NULL DEFAULT '',
          level INTEGER NOT NULL,
          page_number INTEGER,
          cross_references TEXT NOT NULL DEFAULT '[]',
          order_index INTEGER NOT NULL DEFAULT 0,
          FOREIGN KEY(doc_id) REFERENCES documents(doc_id),
          FOREIGN KEY(section_id) REFERENCES sections(section_id)
        );

        CREATE TABLE IF NOT EXISTS chunks (
          chunk_id TEXT PRIMARY KEY,
          doc_id TEXT NOT NULL,
          section_id TEXT NOT NULL,
          subsection_id TEXT,
          chunk_index INTEGER NOT NULL,
          chunk_type TEXT NOT NULL,
          content TEXT NOT NULL,
          section_context TEXT NOT NULL,
          pay_item_codes TEXT NOT NULL DEFAULT '[]',
          keywords TEXT NOT NULL DEFAULT '[]',
          page_number INTEGER,
          token_count INTEGER NOT NULL,
          FOREIGN KEY(doc_id) REFERENCES documents(doc_id),
          FOREIGN KEY(section_id) REFERENCES sections(section_id),
          FOREIGN KEY(subsection_id) REFERENCES subsections(subsection_id)
        );
        ",
        )
        .context("failed to create schema")?;

    ensure_column_exists(connection, "documents", "started_at TEXT")?;
    ensure_column_exists(connection, "documents", "completed_at TEXT")?;
    ensure_column_exists(connection, "subsections", "cross_references TEXT NOT NULL DEFAULT '[]'")?;
    ensure_column_exists(connection, "chunks", "keywords TEXT NOT NULL DEFAULT '[]'")?;

    connection.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
        CREATE INDEX IF NOT EXISTS idx_divisions_doc ON divisions(doc_id, order_index);
        CREATE INDEX IF NOT EXISTS idx_sections_doc_division ON sections(doc_id, division_id, order_index);
        CREATE INDEX IF NOT EXISTS idx_subsections_section ON subsections(section_id, order_index);
        CREATE INDEX IF NOT EXISTS idx_chunks_doc_order ON chunks(doc_id, chunk_index);
        CREATE INDEX IF NOT EXISTS idx_chunks_section ON chunks(section_id);
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

fn ensure_column_exists(
    connection: &Connection,
    table_name: &str,
    column_definition: &str,
) -> Result<()> {
    let Some(column_name) = column_definition.split_whitespace().next() else {
        bail!("invalid column definition: {column_definition}");
    };

    let pragma_sql = format!("PRAGMA table_info({table_name})");
    let mut statement = connection
        .prepare(&pragma_sql)
        .with_context(|| format!("failed to inspect schema for table {table_name}"))?;

    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let existing_name: String = row.get(1)?;
        if existing_name == column_name {
            return Ok(());
        }
    }

    let alter_sql = format!("ALTER TABLE {table_name} ADD COLUMN {column_definition}");
    connection
        .execute(&alter_sql, [])
        .with_context(|| format!("failed to add column {column_name} on {table_name}"))?;

    Ok(())
}
