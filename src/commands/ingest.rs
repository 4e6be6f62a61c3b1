use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::IngestArgs;
use crate::extraction::{
    ExtractionBackend, ExtractionClient, JobHandle, PollPolicy, RemoteOcrBackend,
    TextLayerBackend,
};
use crate::model::{IngestPaths, IngestRunManifest};
use crate::parser::SpecGrammar;
use crate::payload::FsPayloadSource;
use crate::pipeline::{IngestPipeline, IngestRequest, PipelineConfig};
use crate::store::{DB_SCHEMA_VERSION, SpecStore};
use crate::util::{
    default_db_path, ensure_directory, now_utc_string, utc_compact_string, write_json_pretty,
};

pub fn run(args: IngestArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let ingest_manifest_path = args.ingest_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!(
            "ingest_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });
    let db_path = default_db_path(&cache_root, args.db_path.as_ref());

    info!(cache_root = %cache_root.display(), run_id = %run_id, doc_id = %args.doc_id, "starting ingest");

    let grammar = match &args.grammar_path {
        Some(path) => SpecGrammar::load(path)?,
        None => SpecGrammar::standard()?,
    };
    let job_handles = parse_job_handles(&args.job_handles)?;
    let client = build_client(&args)?;
    let backends = client.backend_names();
    info!(backends = %backends.join(","), "extraction backends ready");

    let mut store = SpecStore::open(&db_path)?;
    let payloads = FsPayloadSource;
    let config = PipelineConfig {
        max_chunk_tokens: args.max_chunk_tokens,
        stale_after: chrono::Duration::minutes(args.stale_lock_minutes.max(0)),
    };
    let request = IngestRequest {
        doc_id: args.doc_id.clone(),
        force: args.force,
        job_handles,
    };

    let outcome =
        IngestPipeline::new(&mut store, &client, &payloads, &grammar, config).run(&request)?;

    let manifest = IngestRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: outcome.status.as_str().to_ascii_lowercase(),
        started_at,
        updated_at: now_utc_string(),
        command: render_ingest_command(&args),
        backends,
        paths: IngestPaths {
            cache_root: cache_root.display().to_string(),
            db_path: db_path.display().to_string(),
            grammar_path: args
                .grammar_path
                .as_ref()
                .map(|path| path.display().to_string()),
        },
        outcome,
    };
    write_json_pretty(&ingest_manifest_path, &manifest)?;
    info!(path = %ingest_manifest_path.display(), "wrote ingest run manifest");

    let outcome = manifest.outcome;
    if !outcome.succeeded() {
        bail!(
            "ingestion of {} failed: {}",
            outcome.doc_id,
            outcome.error.unwrap_or_default()
        );
    }

    info!(
        run_id = %run_id,
        doc_id = %outcome.doc_id,
        short_circuited = outcome.short_circuited,
        total_pages = outcome.total_pages,
        divisions = outcome.counts.divisions,
        sections = outcome.counts.sections,
        subsections = outcome.counts.subsections,
        chunks = outcome.counts.chunks,
        "ingest completed"
    );

    Ok(())
}

fn build_client(args: &IngestArgs) -> Result<ExtractionClient> {
    let primary: Option<Box<dyn ExtractionBackend>> =
        match (non_blank(&args.ocr_api_url), non_blank(&args.ocr_api_key)) {
            (Some(url), Some(key)) => Some(Box::new(RemoteOcrBackend::new(
                url,
                key,
                Duration::from_secs(args.ocr_request_timeout_secs),
            )?)),
            _ => {
                info!("remote OCR service not configured");
                None
            }
        };

    let fallback: Option<Box<dyn ExtractionBackend>> = if args.no_text_layer_fallback {
        None
    } else if TextLayerBackend::available() {
        let staging = args.cache_root.join("staging");
        Some(Box::new(TextLayerBackend::new(staging)?))
    } else {
        warn!("pdftotext not found, text layer fallback disabled");
        None
    };

    if primary.is_none() && fallback.is_none() {
        bail!(
            "no extraction backend available: set SPECDEX_OCR_API_URL and SPECDEX_OCR_API_KEY or install pdftotext"
        );
    }

    ExtractionClient::new(
        primary,
        fallback,
        PollPolicy {
            interval: Duration::from_millis(args.poll_interval_ms),
            max_attempts: args.poll_max_attempts.max(1),
        },
    )
    .context("failed to build extraction client")
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_job_handles(raw: &[String]) -> Result<Vec<JobHandle>> {
    raw.iter()
        .map(|value| {
            JobHandle::parse(value)
                .with_context(|| format!("invalid job handle '{value}', expected name=id or id"))
        })
        .collect()
}

fn render_ingest_command(args: &IngestArgs) -> String {
    let mut command = vec![
        "specdex".to_string(),
        "ingest".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
        "--doc-id".to_string(),
        args.doc_id.clone(),
    ];

    if let Some(path) = &args.ingest_manifest_path {
        command.push("--ingest-manifest-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    if args.force {
        command.push("--force".to_string());
    }
    for handle in &args.job_handles {
        command.push("--job-handle".to_string());
        command.push(handle.clone());
    }
    if let Some(url) = &args.ocr_api_url {
        command.push("--ocr-api-url".to_string());
        command.push(url.clone());
    }
    if args.no_text_layer_fallback {
        command.push("--no-text-layer-fallback".to_string());
    }
    command.push("--poll-interval-ms".to_string());
    command.push(args.poll_interval_ms.to_string());
    command.push("--poll-max-attempts".to_string());
    command.push(args.poll_max_attempts.to_string());
    command.push("--max-chunk-tokens".to_string());
    command.push(args.max_chunk_tokens.to_string());
    if let Some(path) = &args.grammar_path {
        command.push("--grammar-path".to_string());
        command.push(path.display().to_string());
    }

    command.join(" ")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn args() -> IngestArgs {
        IngestArgs {
            cache_root: PathBuf::from(".cache/specdex"),
            db_path: None,
            ingest_manifest_path: None,
            doc_id: "spec-2024".to_string(),
            force: true,
            job_handles: vec!["spec-p01=abc".to_string()],
            ocr_api_url: Some("https://ocr.example.test".to_string()),
            ocr_api_key: Some("secret-key".to_string()),
            ocr_request_timeout_secs: 120,
            no_text_layer_fallback: true,
            poll_interval_ms: 2000,
            poll_max_attempts: 150,
            max_chunk_tokens: 512,
            stale_lock_minutes: 30,
            grammar_path: None,
        }
    }

    #[test]
    fn rendered_command_never_contains_the_api_key() {
        let command = render_ingest_command(&args());

        assert!(command.contains("--doc-id spec-2024"));
        assert!(command.contains("--force"));
        assert!(command.contains("--job-handle spec-p01=abc"));
        assert!(command.contains("--no-text-layer-fallback"));
        assert!(!command.contains("secret-key"));
    }

    #[test]
    fn job_handles_are_validated() {
        let handles = parse_job_handles(&["spec-p01=abc".to_string(), "def".to_string()])
            .expect("handles parse");
        assert_eq!(
            handles,
            vec![JobHandle::new("abc", "spec-p01"), JobHandle::new("def", "def")]
        );

        assert!(parse_job_handles(&["spec-p01=".to_string()]).is_err());
    }

    #[test]
    fn blank_provider_settings_are_ignored() {
        assert_eq!(non_blank(&Some("  ".to_string())), None);
        assert_eq!(non_blank(&Some(" url ".to_string())), Some("url"));
        assert_eq!(non_blank(&None), None);
    }

    #[test]
    fn missing_backends_are_a_configuration_error() {
        let mut args = args();
        args.ocr_api_url = None;

        let err = build_client(&args).err().expect("no backend configured");

        assert!(err.to_string().contains("no extraction backend"));
    }
}
