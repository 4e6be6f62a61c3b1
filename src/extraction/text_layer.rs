//! Local fallback that reads the embedded text layer with `pdftotext`.
//!
//! Each submission stages the payload on disk and spawns one child process;
//! polling checks the child without blocking.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::debug;

use super::{DocumentPayload, ExtractionBackend, ExtractionError, FailureKind, JobHandle, JobPoll, JobStatus};
use crate::parser::PAGE_BREAK_MARKER;

const BACKEND_NAME: &str = "text_layer";
const PDFTOTEXT: &str = "pdftotext";

struct RunningJob {
    child: Child,
    pdf_path: PathBuf,
    text_path: PathBuf,
    stderr_path: PathBuf,
}

pub struct TextLayerBackend {
    staging_dir: PathBuf,
    jobs: Mutex<HashMap<String, RunningJob>>,
    next_id: AtomicU64,
}

impl TextLayerBackend {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Result<Self> {
        let staging_dir = staging_dir.into();
        fs::create_dir_all(&staging_dir).with_context(|| {
            format!("failed to create staging directory {}", staging_dir.display())
        })?;

        Ok(Self {
            staging_dir,
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn available() -> bool {
        Command::new(PDFTOTEXT).arg("-v").output().is_ok()
    }

    fn start_job(&self, payload: &DocumentPayload) -> Result<(String, RunningJob)> {
        let id = format!(
            "{}-{}",
            std::process::id(),
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let pdf_path = self.staging_dir.join(format!("{id}.pdf"));
        let text_path = self.staging_dir.join(format!("{id}.txt"));
        let stderr_path = self.staging_dir.join(format!("{id}.stderr"));

        fs::write(&pdf_path, &payload.bytes)
            .with_context(|| format!("failed to stage {}", pdf_path.display()))?;
        let stderr_file = File::create(&stderr_path)
            .with_context(|| format!("failed to create {}", stderr_path.display()))?;

        let child = Command::new(PDFTOTEXT)
            .arg("-enc")
            .arg("UTF-8")
            .arg(&pdf_path)
            .arg(&text_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .with_context(|| format!("failed to execute {PDFTOTEXT} for {}", payload.filename))?;

        Ok((
            id,
            RunningJob {
                child,
                pdf_path,
                text_path,
                stderr_path,
            },
        ))
    }
}

impl ExtractionBackend for TextLayerBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn submit(&self, payload: &DocumentPayload) -> Result<Vec<JobHandle>, ExtractionError> {
        let (id, job) = self
            .start_job(payload)
            .map_err(|err| ExtractionError::SubmissionRejected {
                backend: BACKEND_NAME.to_string(),
                message: format!("{err:#}"),
            })?;

        let mut jobs = self.jobs.lock().map_err(|_| ExtractionError::SubmissionRejected {
            backend: BACKEND_NAME.to_string(),
            message: "job table lock poisoned".to_string(),
        })?;
        jobs.insert(id.clone(), job);
        debug!(backend = BACKEND_NAME, job = %id, "spawned text layer extraction");

        Ok(vec![JobHandle::new(id, payload.filename.clone())])
    }

    fn poll(&self, handle: &JobHandle) -> Result<JobPoll, ExtractionError> {
        let mut jobs = self.jobs.lock().map_err(|_| ExtractionError::JobFailed {
            job: handle.name.clone(),
            message: "job table lock poisoned".to_string(),
        })?;

        let Some(job) = jobs.get_mut(&handle.id) else {
            return Err(ExtractionError::JobFailed {
                job: handle.name.clone(),
                message: format!("unknown text layer job {}", handle.id),
            });
        };

        let exit = match job.child.try_wait() {
            Ok(Some(exit)) => exit,
            Ok(None) => return Ok(JobPoll::Pending(JobStatus::Processing)),
            Err(err) => return Err(ExtractionError::Transient(format!("{}: {err}", handle.name))),
        };

        let Some(job) = jobs.remove(&handle.id) else {
            return Err(ExtractionError::JobFailed {
                job: handle.name.clone(),
                message: format!("unknown text layer job {}", handle.id),
            });
        };
        drop(jobs);

        let outcome = if exit.success() {
            match fs::read(&job.text_path) {
                Ok(raw) => {
                    let text = join_text_layer_pages(&String::from_utf8_lossy(&raw));
                    if text.trim().is_empty() {
                        JobPoll::Failed {
                            kind: FailureKind::Unsupported,
                            reason: "document has no text layer".to_string(),
                        }
                    } else {
                        JobPoll::Done(text)
                    }
                }
                Err(err) => JobPoll::Failed {
                    kind: FailureKind::Failed,
                    reason: format!("failed to read {}: {err}", job.text_path.display()),
                },
            }
        } else {
            let stderr = fs::read_to_string(&job.stderr_path).unwrap_or_default();
            JobPoll::Failed {
                kind: failure_kind_from_stderr(&stderr),
                reason: format!("{PDFTOTEXT} exited with {exit}: {}", stderr.trim()),
            }
        };

        cleanup(&[&job.pdf_path, &job.text_path, &job.stderr_path]);
        Ok(outcome)
    }
}

impl Drop for TextLayerBackend {
    fn drop(&mut self) {
        if let Ok(jobs) = self.jobs.get_mut() {
            for (_, mut job) in jobs.drain() {
                let _ = job.child.kill();
                let _ = job.child.wait();
                cleanup(&[&job.pdf_path, &job.text_path, &job.stderr_path]);
            }
        }
    }
}

fn cleanup(paths: &[&Path]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
}

fn failure_kind_from_stderr(stderr: &str) -> FailureKind {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("may not be a pdf") || lowered.contains("couldn't find trailer") {
        FailureKind::Unsupported
    } else {
        FailureKind::Failed
    }
}

/// `pdftotext` separates pages with form feeds and ends with a trailing one.
fn join_text_layer_pages(raw: &str) -> String {
    let mut pages = raw
        .split(PAGE_BREAK_MARKER)
        .map(|page| page.replace('\u{0000}', ""))
        .collect::<Vec<_>>();

    while pages.last().is_some_and(|page| page.trim().is_empty()) {
        pages.pop();
    }

    pages
        .iter()
        .map(|page| page.trim_matches('\n'))
        .collect::<Vec<_>>()
        .join(&format!("\n{PAGE_BREAK_MARKER}\n"))
}
