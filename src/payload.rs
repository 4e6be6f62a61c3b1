use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::extraction::DocumentPayload;
use crate::model::DocumentRecord;

/// Reads a registered document's binary by its storage location.
pub trait PayloadSource {
    fn load(&self, document: &DocumentRecord) -> Result<DocumentPayload>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsPayloadSource;

impl PayloadSource for FsPayloadSource {
    fn load(&self, document: &DocumentRecord) -> Result<DocumentPayload> {
        let path = Path::new(&document.storage_location);
        if !path.is_file() {
            bail!(
                "payload for {} not found at {}",
                document.doc_id,
                path.display()
            );
        }

        let bytes =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        if bytes.is_empty() {
            bail!("payload for {} is empty: {}", document.doc_id, path.display());
        }

        Ok(DocumentPayload {
            filename: document.filename.clone(),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessingStatus;

    fn record(storage_location: &str) -> DocumentRecord {
        DocumentRecord {
            doc_id: "spec-2024".to_string(),
            filename: "spec.pdf".to_string(),
            storage_location: storage_location.to_string(),
            sha256: String::new(),
            status: ProcessingStatus::Pending,
            error_message: None,
            total_pages: 0,
            total_sections: 0,
            total_chunks: 0,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            started_at: None,
            completed_at: None,
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = FsPayloadSource
            .load(&record("/nonexistent/specdex/spec.pdf"))
            .expect_err("missing payload");

        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn existing_file_is_read_with_registered_filename() {
        let path = std::env::temp_dir().join(format!("specdex-payload-{}.pdf", std::process::id()));
        fs::write(&path, b"%PDF-1.7").expect("fixture written");

        let payload = FsPayloadSource
            .load(&record(&path.to_string_lossy()))
            .expect("payload loads");

        assert_eq!(payload.filename, "spec.pdf");
        assert_eq!(payload.bytes, b"%PDF-1.7");
        let _ = fs::remove_file(path);
    }
}
