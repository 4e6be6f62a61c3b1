use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use super::*;

/// Replays a fixed sequence of poll answers per job id; the last answer
/// repeats once the script runs out.
struct ScriptedBackend {
    name: &'static str,
    submission: Result<Vec<JobHandle>, String>,
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    polls: AtomicU32,
}

#[derive(Clone)]
enum Step {
    Pending,
    Done(&'static str),
    Quota,
    Transient,
}

impl ScriptedBackend {
    fn new(name: &'static str, jobs: Vec<(&str, &str, Vec<Step>)>) -> Self {
        let handles = jobs
            .iter()
            .map(|(id, part, _)| JobHandle::new(*id, *part))
            .collect();
        let scripts = jobs
            .into_iter()
            .map(|(id, _, steps)| (id.to_string(), steps))
            .collect();

        Self {
            name,
            submission: Ok(handles),
            scripts: Mutex::new(scripts),
            polls: AtomicU32::new(0),
        }
    }

    fn rejecting(name: &'static str) -> Self {
        Self {
            name,
            submission: Err("service unavailable".to_string()),
            scripts: Mutex::new(HashMap::new()),
            polls: AtomicU32::new(0),
        }
    }

    fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

impl ExtractionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn submit(&self, _payload: &DocumentPayload) -> Result<Vec<JobHandle>, ExtractionError> {
        self.submission
            .clone()
            .map_err(|message| ExtractionError::SubmissionRejected {
                backend: self.name.to_string(),
                message,
            })
    }

    fn poll(&self, handle: &JobHandle) -> Result<JobPoll, ExtractionError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().expect("script lock");
        let steps = scripts.get_mut(&handle.id).expect("scripted job");
        let step = if steps.len() > 1 {
            steps.remove(0)
        } else {
            steps[0].clone()
        };

        match step {
            Step::Pending => Ok(JobPoll::Pending(JobStatus::Processing)),
            Step::Done(text) => Ok(JobPoll::Done(text.to_string())),
            Step::Quota => Ok(JobPoll::Failed {
                kind: FailureKind::QuotaExceeded,
                reason: "page quota used".to_string(),
            }),
            Step::Transient => Err(ExtractionError::Transient("connection reset".to_string())),
        }
    }
}

fn fast_policy(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(1),
        max_attempts,
    }
}

fn payload() -> DocumentPayload {
    DocumentPayload {
        filename: "spec.pdf".to_string(),
        bytes: b"%PDF-1.7".to_vec(),
    }
}

#[test]
fn pending_job_times_out_at_the_attempt_ceiling() {
    let backend = ScriptedBackend::new("scripted", vec![("j1", "spec-p01", vec![Step::Pending])]);

    let err = poll_until_terminal(&backend, &JobHandle::new("j1", "spec-p01"), fast_policy(5))
        .expect_err("never finishes");

    assert!(matches!(err, ExtractionError::Timeout { attempts: 5, .. }));
    assert!(err.to_string().contains("timed out"));
    assert_eq!(backend.poll_count(), 5);
}

#[test]
fn terminal_quota_failure_stops_polling() {
    let backend = ScriptedBackend::new(
        "scripted",
        vec![("j1", "spec-p01", vec![Step::Pending, Step::Quota])],
    );

    let err = poll_until_terminal(&backend, &JobHandle::new("j1", "spec-p01"), fast_policy(50))
        .expect_err("quota is terminal");

    assert!(matches!(err, ExtractionError::QuotaExceeded { .. }));
    assert_eq!(backend.poll_count(), 2);
}

#[test]
fn transient_errors_consume_attempts_then_recover() {
    let backend = ScriptedBackend::new(
        "scripted",
        vec![(
            "j1",
            "spec-p01",
            vec![Step::Transient, Step::Transient, Step::Done("body")],
        )],
    );

    let text = poll_until_terminal(&backend, &JobHandle::new("j1", "spec-p01"), fast_policy(3))
        .expect("third attempt succeeds");

    assert_eq!(text, "body");
    assert_eq!(backend.poll_count(), 3);
}

#[test]
fn transient_errors_count_toward_timeout() {
    let backend = ScriptedBackend::new("scripted", vec![("j1", "spec-p01", vec![Step::Transient])]);

    let err = poll_until_terminal(&backend, &JobHandle::new("j1", "spec-p01"), fast_policy(4))
        .expect_err("keeps failing");

    assert!(matches!(err, ExtractionError::Timeout { attempts: 4, .. }));
}

#[test]
fn multi_part_document_is_merged_in_part_order() {
    let backend = ScriptedBackend::new(
        "scripted",
        vec![
            ("j2", "spec-p02", vec![Step::Done("SECTION 203 - EXCAVATION")]),
            ("j1", "spec-p01", vec![Step::Pending, Step::Done("DIVISION 200 - EARTHWORK")]),
        ],
    );
    let client = ExtractionClient::new(Some(Box::new(backend)), None, fast_policy(10))
        .expect("client builds");

    let extracted = client.extract(&payload()).expect("extraction succeeds");

    assert_eq!(extracted.backend, "scripted");
    assert_eq!(extracted.parts, vec!["spec-p01", "spec-p02"]);
    assert_eq!(
        extracted.text,
        "DIVISION 200 - EARTHWORK\n\u{000C}\nSECTION 203 - EXCAVATION"
    );
}

#[test]
fn rejected_primary_submission_uses_fallback() {
    let primary = ScriptedBackend::rejecting("primary");
    let fallback = ScriptedBackend::new("fallback", vec![("f1", "spec.pdf", vec![Step::Done("text")])]);
    let client = ExtractionClient::new(
        Some(Box::new(primary)),
        Some(Box::new(fallback)),
        fast_policy(3),
    )
    .expect("client builds");

    let extracted = client.extract(&payload()).expect("fallback succeeds");

    assert_eq!(extracted.backend, "fallback");
    assert_eq!(extracted.text, "text");
}

#[test]
fn rejected_primary_without_fallback_returns_the_rejection() {
    let client = ExtractionClient::new(
        Some(Box::new(ScriptedBackend::rejecting("primary"))),
        None,
        fast_policy(3),
    )
    .expect("client builds");

    let err = client.extract(&payload()).expect_err("no fallback");

    assert!(matches!(err, ExtractionError::SubmissionRejected { .. }));
}

#[test]
fn poll_failure_after_accepted_submission_does_not_fall_back() {
    let primary = ScriptedBackend::new("primary", vec![("p1", "spec.pdf", vec![Step::Quota])]);
    let fallback = ScriptedBackend::new("fallback", vec![("f1", "spec.pdf", vec![Step::Done("text")])]);
    let client = ExtractionClient::new(
        Some(Box::new(primary)),
        Some(Box::new(fallback)),
        fast_policy(3),
    )
    .expect("client builds");

    let err = client.extract(&payload()).expect_err("primary job failed");

    assert!(matches!(err, ExtractionError::QuotaExceeded { .. }));
}

#[test]
fn failing_part_is_named_in_the_error() {
    let backend = ScriptedBackend::new(
        "scripted",
        vec![
            ("j1", "spec-p01", vec![Step::Done("first")]),
            ("j2", "spec-p02", vec![Step::Pending]),
        ],
    );
    let client = ExtractionClient::new(Some(Box::new(backend)), None, fast_policy(3))
        .expect("client builds");

    let err = client.extract(&payload()).expect_err("second part times out");

    match err {
        ExtractionError::PartFailed { part, source } => {
            assert_eq!(part, "spec-p02");
            assert!(matches!(*source, ExtractionError::Timeout { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn error_kind_separates_quota_from_outage() {
    let quota = ExtractionError::QuotaExceeded {
        job: "spec.pdf".to_string(),
        message: "402".to_string(),
    };
    let outage = ExtractionError::SubmissionRejected {
        backend: "primary".to_string(),
        message: "request failed".to_string(),
    };
    let part = ExtractionError::PartFailed {
        part: "spec-p02".to_string(),
        source: Box::new(ExtractionError::Unsupported {
            job: "spec-p02".to_string(),
            message: "not a PDF".to_string(),
        }),
    };

    assert_eq!(quota.kind(), "quota_exceeded");
    assert_eq!(outage.kind(), "rejected");
    assert_eq!(part.kind(), "unsupported");
}

#[test]
fn no_backend_is_an_error() {
    let client = ExtractionClient::new(None, None, fast_policy(1)).expect("client builds");

    assert!(matches!(
        client.extract(&payload()),
        Err(ExtractionError::NoBackend)
    ));
}

#[test]
fn prestaged_jobs_require_the_primary_backend() {
    let fallback = ScriptedBackend::new("fallback", vec![]);
    let client = ExtractionClient::new(None, Some(Box::new(fallback)), fast_policy(1))
        .expect("client builds");

    let err = client
        .extract_prestaged(&[JobHandle::new("j1", "spec-p01")])
        .expect_err("primary missing");

    assert!(matches!(err, ExtractionError::NotConfigured { .. }));
}

#[test]
fn prestaged_jobs_are_polled_without_submitting() {
    let primary = ScriptedBackend::new("primary", vec![("j9", "spec-p01", vec![Step::Done("body")])]);
    let client = ExtractionClient::new(Some(Box::new(primary)), None, fast_policy(2))
        .expect("client builds");

    let extracted = client
        .extract_prestaged(&[JobHandle::new("j9", "spec-p01")])
        .expect("prestaged job completes");

    assert_eq!(extracted.text, "body");
}

#[test]
fn job_handles_parse_named_and_bare_forms() {
    assert_eq!(
        JobHandle::parse("spec-p01=abc123"),
        Some(JobHandle::new("abc123", "spec-p01"))
    );
    assert_eq!(JobHandle::parse("abc123"), Some(JobHandle::new("abc123", "abc123")));
    assert_eq!(JobHandle::parse("  "), None);
    assert_eq!(JobHandle::parse("=abc"), None);
}
