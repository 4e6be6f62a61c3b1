use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::{DocumentRecord, StructureCounts};
use crate::store::SpecStore;
use crate::util::default_db_path;

#[derive(Debug, Serialize)]
struct DocumentStatus {
    document: DocumentRecord,
    counts: StructureCounts,
    chunk_types: Vec<ChunkTypeCount>,
}

#[derive(Debug, Serialize)]
struct ChunkTypeCount {
    chunk_type: String,
    count: i64,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let db_path = default_db_path(&args.cache_root, args.db_path.as_ref());

    info!(cache_root = %args.cache_root.display(), "status requested");

    if !args.json {
        report_latest_manifest(&manifest_dir)?;
    }

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        if args.json {
            println!("[]");
        }
        return Ok(());
    }

    let store = SpecStore::open(&db_path)?;
    let documents = match args.doc_id.as_deref() {
        Some(doc_id) => match store.get_document(doc_id)? {
            Some(document) => vec![document],
            None => bail!("document not found: {doc_id}"),
        },
        None => store.list_documents()?,
    };

    let mut statuses = Vec::with_capacity(documents.len());
    for document in documents {
        let counts = store.structure_counts(&document.doc_id)?;
        let chunk_types = store
            .chunk_type_counts(&document.doc_id)?
            .into_iter()
            .map(|(chunk_type, count)| ChunkTypeCount { chunk_type, count })
            .collect();
        statuses.push(DocumentStatus {
            document,
            counts,
            chunk_types,
        });
    }

    if args.json {
        let rendered =
            serde_json::to_string_pretty(&statuses).context("failed to serialize status")?;
        println!("{rendered}");
        return Ok(());
    }

    info!(path = %db_path.display(), documents = statuses.len(), "database status");
    for status in &statuses {
        let document = &status.document;
        info!(
            doc_id = %document.doc_id,
            filename = %document.filename,
            status = document.status.as_str(),
            total_pages = document.total_pages,
            total_sections = document.total_sections,
            total_chunks = document.total_chunks,
            divisions = status.counts.divisions,
            subsections = status.counts.subsections,
            started_at = %document.started_at.as_deref().unwrap_or_default(),
            completed_at = %document.completed_at.as_deref().unwrap_or_default(),
            error = %document.error_message.as_deref().unwrap_or_default(),
            "document"
        );
        for entry in &status.chunk_types {
            info!(doc_id = %document.doc_id, chunk_type = %entry.chunk_type, count = entry.count, "chunk type");
        }
    }

    Ok(())
}

fn report_latest_manifest(manifest_dir: &Path) -> Result<()> {
    let Some(path) = latest_ingest_manifest(manifest_dir)? else {
        warn!(path = %manifest_dir.display(), "no ingest run manifest found");
        return Ok(());
    };

    let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let manifest: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let field = |key: &str| {
        manifest
            .get(key)
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string()
    };

    info!(
        path = %path.display(),
        run_id = %field("run_id"),
        status = %field("status"),
        updated_at = %field("updated_at"),
        "loaded latest ingest run manifest"
    );
    Ok(())
}

/// Run manifests carry a compact UTC timestamp, so the greatest name is the
/// newest run.
fn latest_ingest_manifest(manifest_dir: &Path) -> Result<Option<PathBuf>> {
    if !manifest_dir.is_dir() {
        return Ok(None);
    }

    let entries = fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?;
    let mut latest: Option<PathBuf> = None;
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in {}", manifest_dir.display()))?;
        let path = entry.path();
        let is_run_manifest = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("ingest_run_") && name.ends_with(".json"));
        if is_run_manifest && latest.as_ref().is_none_or(|current| path > *current) {
            latest = Some(path);
        }
    }

    Ok(latest)
}
