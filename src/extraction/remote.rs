//! Blocking client for a remote OCR job service.
//!
//! `POST {base}/v1/jobs` (multipart `file`) answers with one or more part
//! jobs; `GET {base}/v1/jobs/{id}` reports a status plus the result in one of
//! several shapes (`pages[].text`, `markdown` or `text`).

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::blocking::{Client, multipart};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{DocumentPayload, ExtractionBackend, ExtractionError, FailureKind, JobHandle, JobPoll, JobStatus};
use crate::parser::PAGE_BREAK_MARKER;

const BACKEND_NAME: &str = "remote_ocr";

pub struct RemoteOcrBackend {
    client: Client,
    jobs_endpoint: String,
}

impl RemoteOcrBackend {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(!base_url.trim().is_empty(), "missing OCR service URL");
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OCR service API key");

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OCR service API key")?,
        );
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OCR service HTTP client")?;

        Ok(Self {
            client,
            jobs_endpoint: format!("{}/v1/jobs", base_url.trim().trim_end_matches('/')),
        })
    }

    fn rejected(&self, message: String) -> ExtractionError {
        ExtractionError::SubmissionRejected {
            backend: BACKEND_NAME.to_string(),
            message,
        }
    }
}

impl ExtractionBackend for RemoteOcrBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn submit(&self, payload: &DocumentPayload) -> Result<Vec<JobHandle>, ExtractionError> {
        let part = multipart::Part::bytes(payload.bytes.clone())
            .file_name(payload.filename.clone())
            .mime_str("application/pdf")
            .map_err(|err| self.rejected(format!("invalid multipart payload: {err}")))?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.jobs_endpoint)
            .multipart(form)
            .send()
            .map_err(|err| self.rejected(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(match classify_rejection(status) {
                Some(FailureKind::QuotaExceeded) => ExtractionError::QuotaExceeded {
                    job: payload.filename.clone(),
                    message: format!("{status}: {body}"),
                },
                Some(FailureKind::Unsupported) => ExtractionError::Unsupported {
                    job: payload.filename.clone(),
                    message: format!("{status}: {body}"),
                },
                _ => self.rejected(format!("{status}: {body}")),
            });
        }

        let parsed: SubmitResponse = response
            .json()
            .map_err(|err| self.rejected(format!("unreadable submit response: {err}")))?;

        let handles = parsed.into_handles(&payload.filename);
        debug!(
            backend = BACKEND_NAME,
            parts = handles.len(),
            "submitted document for extraction"
        );
        Ok(handles)
    }

    fn poll(&self, handle: &JobHandle) -> Result<JobPoll, ExtractionError> {
        let url = format!("{}/{}", self.jobs_endpoint, handle.id);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| ExtractionError::Transient(format!("{}: {err}", handle.name)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(poll_failure(status, &handle.name, &body));
        }

        let job: JobResponse = response.json().map_err(|err| {
            ExtractionError::Transient(format!("{}: unreadable job status: {err}", handle.name))
        })?;

        Ok(job.into_poll(&handle.name))
    }
}

fn classify_rejection(status: StatusCode) -> Option<FailureKind> {
    match status {
        StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
            Some(FailureKind::QuotaExceeded)
        }
        StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY => {
            Some(FailureKind::Unsupported)
        }
        _ => None,
    }
}

/// Rate-limited and 5xx status requests are retried by the poll loop. A
/// quota or media rejection keeps its type, as on submission.
fn poll_failure(status: StatusCode, job: &str, body: &str) -> ExtractionError {
    let message = format!("{status}: {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ExtractionError::Transient(format!("{job}: job status request returned {message}"));
    }

    let kind = classify_rejection(status).unwrap_or(FailureKind::Failed);
    ExtractionError::from_failure(kind, job, message)
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    jobs: Vec<SubmittedJob>,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmittedJob {
    id: String,
    name: Option<String>,
}

impl SubmitResponse {
    /// Single-job responses carry `id` at the top level instead of `jobs`.
    fn into_handles(self, filename: &str) -> Vec<JobHandle> {
        let mut handles = self
            .jobs
            .into_iter()
            .map(|job| {
                let name = job.name.unwrap_or_else(|| job.id.clone());
                JobHandle::new(job.id, name)
            })
            .collect::<Vec<_>>();

        if handles.is_empty() {
            if let Some(id) = self.id {
                let name = self.name.unwrap_or_else(|| filename.to_string());
                handles.push(JobHandle::new(id, name));
            }
        }

        handles
    }
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
    text: Option<String>,
    markdown: Option<String>,
    #[serde(default)]
    pages: Vec<PageText>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageText {
    #[serde(alias = "content", alias = "markdown")]
    text: String,
}

impl JobResponse {
    fn into_poll(self, job: &str) -> JobPoll {
        let reason = || self.error.clone().unwrap_or_else(|| self.status.clone());

        match self.status.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" | "submitted" => JobPoll::Pending(JobStatus::Queued),
            "processing" | "running" | "in_progress" => JobPoll::Pending(JobStatus::Processing),
            "done" | "completed" | "succeeded" | "success" => match self.result_text() {
                Some(text) => JobPoll::Done(text),
                None => JobPoll::Failed {
                    kind: FailureKind::Failed,
                    reason: "job finished without text".to_string(),
                },
            },
            "quota_exceeded" => JobPoll::Failed {
                kind: FailureKind::QuotaExceeded,
                reason: reason(),
            },
            "skipped" | "unsupported" => JobPoll::Failed {
                kind: FailureKind::Unsupported,
                reason: reason(),
            },
            "failed" | "error" | "cancelled" => JobPoll::Failed {
                kind: FailureKind::Failed,
                reason: reason(),
            },
            other => {
                warn!(job, status = other, "unknown extraction job status, still waiting");
                JobPoll::Pending(JobStatus::Processing)
            }
        }
    }

    fn result_text(&self) -> Option<String> {
        if !self.pages.is_empty() {
            let separator = format!("\n{PAGE_BREAK_MARKER}\n");
            return Some(
                self.pages
                    .iter()
                    .map(|page| page.text.trim_end())
                    .collect::<Vec<_>>()
                    .join(&separator),
            );
        }

        self.markdown
            .clone()
            .or_else(|| self.text.clone())
            .filter(|text| !text.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(json: &str) -> JobResponse {
        serde_json::from_str(json).expect("job response parses")
    }

    #[test]
    fn pending_statuses_map_to_queue_states() {
        assert_eq!(
            job(r#"{"status":"queued"}"#).into_poll("doc-p01"),
            JobPoll::Pending(JobStatus::Queued)
        );
        assert_eq!(
            job(r#"{"status":"PROCESSING"}"#).into_poll("doc-p01"),
            JobPoll::Pending(JobStatus::Processing)
        );
    }

    #[test]
    fn page_results_are_joined_with_page_breaks() {
        let poll = job(r#"{"status":"done","pages":[{"text":"one"},{"content":"two"}]}"#)
            .into_poll("doc-p01");

        assert_eq!(poll, JobPoll::Done(format!("one\n{PAGE_BREAK_MARKER}\ntwo")));
    }

    #[test]
    fn markdown_result_is_preferred_over_plain_text() {
        let poll = job(r##"{"status":"succeeded","markdown":"# body","text":"body"}"##)
            .into_poll("doc-p01");

        assert_eq!(poll, JobPoll::Done("# body".to_string()));
    }

    #[test]
    fn terminal_statuses_are_typed() {
        assert_eq!(
            job(r#"{"status":"quota_exceeded","error":"monthly pages used"}"#).into_poll("doc"),
            JobPoll::Failed {
                kind: FailureKind::QuotaExceeded,
                reason: "monthly pages used".to_string(),
            }
        );
        assert_eq!(
            job(r#"{"status":"skipped"}"#).into_poll("doc"),
            JobPoll::Failed {
                kind: FailureKind::Unsupported,
                reason: "skipped".to_string(),
            }
        );
    }

    #[test]
    fn done_without_text_is_a_failure() {
        assert!(matches!(
            job(r#"{"status":"done","text":"   "}"#).into_poll("doc"),
            JobPoll::Failed {
                kind: FailureKind::Failed,
                ..
            }
        ));
    }

    #[test]
    fn submit_response_accepts_single_and_multi_job_shapes() {
        let multi: SubmitResponse = serde_json::from_str(
            r#"{"jobs":[{"id":"a1","name":"spec-p01"},{"id":"a2"}]}"#,
        )
        .expect("multi parses");
        assert_eq!(
            multi.into_handles("spec.pdf"),
            vec![JobHandle::new("a1", "spec-p01"), JobHandle::new("a2", "a2")]
        );

        let single: SubmitResponse =
            serde_json::from_str(r#"{"id":"b1"}"#).expect("single parses");
        assert_eq!(
            single.into_handles("spec.pdf"),
            vec![JobHandle::new("b1", "spec.pdf")]
        );
    }

    #[test]
    fn rejection_statuses_are_classified() {
        assert_eq!(
            classify_rejection(StatusCode::TOO_MANY_REQUESTS),
            Some(FailureKind::QuotaExceeded)
        );
        assert_eq!(
            classify_rejection(StatusCode::UNSUPPORTED_MEDIA_TYPE),
            Some(FailureKind::Unsupported)
        );
        assert_eq!(classify_rejection(StatusCode::BAD_REQUEST), None);
    }

    #[test]
    fn poll_status_failures_keep_quota_type() {
        assert!(matches!(
            poll_failure(StatusCode::PAYMENT_REQUIRED, "doc-p02", "credits exhausted"),
            ExtractionError::QuotaExceeded { ref job, .. } if job == "doc-p02"
        ));
        assert!(matches!(
            poll_failure(StatusCode::TOO_MANY_REQUESTS, "doc-p02", "slow down"),
            ExtractionError::Transient(_)
        ));
        assert!(matches!(
            poll_failure(StatusCode::BAD_GATEWAY, "doc-p02", ""),
            ExtractionError::Transient(_)
        ));
        assert!(matches!(
            poll_failure(StatusCode::NOT_FOUND, "doc-p02", "unknown job"),
            ExtractionError::JobFailed { .. }
        ));
    }
}
