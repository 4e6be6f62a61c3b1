//! Text extraction through pluggable job-based backends.
//!
//! A backend only knows how to submit a payload and report on one job. The
//! [`ExtractionClient`] owns the bounded poll loop, the primary/fallback
//! choice and the full join over multi-part submissions.

mod merge;
mod normalize;
mod remote;
mod text_layer;
#[cfg(test)]
mod tests;

pub use merge::{ExtractedPart, PartMerger};
pub use normalize::{NormalizationStats, normalize_pages};
pub use remote::RemoteOcrBackend;
pub use text_layer::TextLayerBackend;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 150;

#[derive(Debug, Clone)]
pub struct DocumentPayload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One provider-side job. `name` orders parts of a split document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: String,
    pub name: String,
}

impl JobHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Accepts `name=id` or a bare `id`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        match raw.split_once('=') {
            Some((name, id)) if !name.trim().is_empty() && !id.trim().is_empty() => {
                Some(Self::new(id.trim(), name.trim()))
            }
            Some(_) => None,
            None => Some(Self::new(raw, raw)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    QuotaExceeded,
    Unsupported,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPoll {
    Pending(JobStatus),
    Done(String),
    Failed { kind: FailureKind, reason: String },
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no extraction backend is configured")]
    NoBackend,

    #[error("{backend} backend is required for pre-staged jobs but is not configured")]
    NotConfigured { backend: &'static str },

    #[error("{backend} rejected the submission: {message}")]
    SubmissionRejected { backend: String, message: String },

    #[error("{backend} returned no extraction jobs")]
    NoJobs { backend: String },

    #[error("extraction quota exceeded for job {job}: {message}")]
    QuotaExceeded { job: String, message: String },

    #[error("document not supported by extraction job {job}: {message}")]
    Unsupported { job: String, message: String },

    #[error("extraction job {job} failed: {message}")]
    JobFailed { job: String, message: String },

    #[error("extraction job {job} timed out after {attempts} poll attempts ({waited_secs}s)")]
    Timeout {
        job: String,
        attempts: u32,
        waited_secs: u64,
    },

    /// Retryable inside the poll loop; consumes one attempt.
    #[error("transient extraction error: {0}")]
    Transient(String),

    #[error("extraction part '{part}' failed: {source}")]
    PartFailed {
        part: String,
        source: Box<ExtractionError>,
    },
}

impl ExtractionError {
    /// Stable label for logs, so quota exhaustion reads apart from an outage.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoBackend | Self::NotConfigured { .. } => "not_configured",
            Self::SubmissionRejected { .. } => "rejected",
            Self::NoJobs { .. } => "no_jobs",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Unsupported { .. } => "unsupported",
            Self::JobFailed { .. } => "job_failed",
            Self::Timeout { .. } => "timeout",
            Self::Transient(_) => "transient",
            Self::PartFailed { source, .. } => source.kind(),
        }
    }

    fn from_failure(kind: FailureKind, job: &str, reason: String) -> Self {
        let job = job.to_string();
        match kind {
            FailureKind::QuotaExceeded => Self::QuotaExceeded {
                job,
                message: reason,
            },
            FailureKind::Unsupported => Self::Unsupported {
                job,
                message: reason,
            },
            FailureKind::Failed => Self::JobFailed {
                job,
                message: reason,
            },
        }
    }
}

pub trait ExtractionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn submit(&self, payload: &DocumentPayload) -> Result<Vec<JobHandle>, ExtractionError>;

    fn poll(&self, handle: &JobHandle) -> Result<JobPoll, ExtractionError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub backend: &'static str,
    pub parts: Vec<String>,
    pub text: String,
}

pub struct ExtractionClient {
    primary: Option<Box<dyn ExtractionBackend>>,
    fallback: Option<Box<dyn ExtractionBackend>>,
    policy: PollPolicy,
    merger: PartMerger,
}

impl ExtractionClient {
    pub fn new(
        primary: Option<Box<dyn ExtractionBackend>>,
        fallback: Option<Box<dyn ExtractionBackend>>,
        policy: PollPolicy,
    ) -> Result<Self> {
        Ok(Self {
            primary,
            fallback,
            policy,
            merger: PartMerger::new()?,
        })
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.primary
            .iter()
            .chain(self.fallback.iter())
            .map(|backend| backend.name().to_string())
            .collect()
    }

    /// Submits to the primary backend, falling back to the secondary for the
    /// whole document when the primary is absent or rejects the submission.
    pub fn extract(&self, payload: &DocumentPayload) -> Result<ExtractedDocument, ExtractionError> {
        if let Some(primary) = self.primary.as_deref() {
            match primary.submit(payload) {
                Ok(handles) => return self.collect(primary, handles),
                Err(err) if self.fallback.is_some() => {
                    warn!(
                        backend = primary.name(),
                        kind = err.kind(),
                        error = %err,
                        "primary extraction submission failed, using fallback"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let Some(fallback) = self.fallback.as_deref() else {
            return Err(ExtractionError::NoBackend);
        };
        let handles = fallback.submit(payload)?;
        self.collect(fallback, handles)
    }

    /// Polls jobs an upstream step already submitted to the primary backend.
    pub fn extract_prestaged(
        &self,
        handles: &[JobHandle],
    ) -> Result<ExtractedDocument, ExtractionError> {
        let Some(primary) = self.primary.as_deref() else {
            return Err(ExtractionError::NotConfigured { backend: "primary" });
        };
        self.collect(primary, handles.to_vec())
    }

    fn collect(
        &self,
        backend: &dyn ExtractionBackend,
        handles: Vec<JobHandle>,
    ) -> Result<ExtractedDocument, ExtractionError> {
        if handles.is_empty() {
            return Err(ExtractionError::NoJobs {
                backend: backend.name().to_string(),
            });
        }

        info!(
            backend = backend.name(),
            parts = handles.len(),
            "polling extraction jobs"
        );

        let policy = self.policy;
        let results = thread::scope(|scope| {
            let workers = handles
                .iter()
                .map(|handle| scope.spawn(move || poll_until_terminal(backend, handle, policy)))
                .collect::<Vec<_>>();

            handles
                .iter()
                .zip(workers)
                .map(|(handle, worker)| {
                    let result = worker.join().unwrap_or_else(|_| {
                        Err(ExtractionError::JobFailed {
                            job: handle.name.clone(),
                            message: "poll worker panicked".to_string(),
                        })
                    });
                    (handle.clone(), result)
                })
                .collect::<Vec<_>>()
        });

        let multi_part = results.len() > 1;
        let mut parts = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (handle, result) in results {
            match result {
                Ok(text) => parts.push(ExtractedPart {
                    name: handle.name,
                    text,
                }),
                Err(err) => failures.push((handle.name, err)),
            }
        }

        if !failures.is_empty() {
            failures.sort_by(|(left, _), (right, _)| left.cmp(right));
            let (part, err) = failures.remove(0);
            if !multi_part {
                return Err(err);
            }
            return Err(ExtractionError::PartFailed {
                part,
                source: Box::new(err),
            });
        }

        let part_names = {
            let mut names = parts.iter().map(|part| part.name.clone()).collect::<Vec<_>>();
            names.sort();
            names
        };

        Ok(ExtractedDocument {
            backend: backend.name(),
            parts: part_names,
            text: self.merger.merge(parts),
        })
    }
}

/// Sleeps between attempts and gives up with a timeout at the ceiling.
/// Terminal job failures return immediately.
pub fn poll_until_terminal(
    backend: &dyn ExtractionBackend,
    handle: &JobHandle,
    policy: PollPolicy,
) -> Result<String, ExtractionError> {
    let started = Instant::now();

    for attempt in 1..=policy.max_attempts {
        match backend.poll(handle) {
            Ok(JobPoll::Done(text)) => {
                debug!(job = %handle.name, attempt, "extraction job done");
                return Ok(text);
            }
            Ok(JobPoll::Failed { kind, reason }) => {
                return Err(ExtractionError::from_failure(kind, &handle.name, reason));
            }
            Ok(JobPoll::Pending(status)) => {
                debug!(job = %handle.name, attempt, status = ?status, "extraction job pending");
            }
            Err(ExtractionError::Transient(message)) => {
                warn!(job = %handle.name, attempt, error = %message, "transient poll error");
            }
            Err(err) => return Err(err),
        }

        if attempt < policy.max_attempts {
            thread::sleep(policy.interval);
        }
    }

    Err(ExtractionError::Timeout {
        job: handle.name.clone(),
        attempts: policy.max_attempts,
        waited_secs: started.elapsed().as_secs(),
    })
}
