use std::fs;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::RegisterArgs;
use crate::store::{NewDocument, SpecStore};
use crate::util::{default_db_path, ensure_directory, sha256_file};

const DERIVED_ID_HASH_CHARS: usize = 12;

pub fn run(args: RegisterArgs) -> Result<()> {
    if !args.file.is_file() {
        bail!("specification file not found: {}", args.file.display());
    }

    let storage_location = fs::canonicalize(&args.file)
        .with_context(|| format!("failed to resolve {}", args.file.display()))?;
    let filename = storage_location
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToOwned::to_owned)
        .with_context(|| format!("invalid UTF-8 filename: {}", storage_location.display()))?;
    let sha256 = sha256_file(&storage_location)?;
    let doc_id = match args.doc_id.as_deref().map(str::trim) {
        Some(doc_id) if !doc_id.is_empty() => doc_id.to_string(),
        Some(_) => bail!("--doc-id must not be blank"),
        None => derived_doc_id(&sha256),
    };

    ensure_directory(&args.cache_root)?;
    let db_path = default_db_path(&args.cache_root, args.db_path.as_ref());
    let store = SpecStore::open(&db_path)?;

    let record = store.register_document(&NewDocument {
        doc_id,
        filename,
        storage_location: storage_location.display().to_string(),
        sha256,
    })?;

    info!(
        doc_id = %record.doc_id,
        filename = %record.filename,
        sha256 = %record.sha256,
        status = record.status.as_str(),
        db_path = %db_path.display(),
        "document registered"
    );

    Ok(())
}

fn derived_doc_id(sha256: &str) -> String {
    let prefix = sha256.get(..DERIVED_ID_HASH_CHARS).unwrap_or(sha256);
    format!("doc-{prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_id_uses_hash_prefix() {
        assert_eq!(
            derived_doc_id("0123456789abcdef0123456789abcdef"),
            "doc-0123456789ab"
        );
        assert_eq!(derived_doc_id("abc"), "doc-abc");
    }
}
