//! Status payload types and the raw-status-to-job-status mapping.
//!
//! Both the polling endpoint and the SSE stream deliver the same JSON
//! shape: `{"status": "<raw>", "result": ..., "error": ...}`. This module
//! deserializes that into [`StatusPayload`] and maps the raw status string
//! into a typed [`JobStatus`].

use imagineit_core::types::{ImageHash, JobRef};
use serde::Deserialize;

/// Raw per-reference status object as sent by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusPayload {
    /// Raw status string (`"completed"`, `"in_progress: (3/28)"`, ...).
    pub status: String,
    /// Content hash(es) on success, failure detail on error, else absent.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Optional error description.
    #[serde(default)]
    pub error: Option<String>,
}

/// Reply of the dispatch endpoint.
///
/// Older deployments return a single combined reference string instead of
/// a list; both shapes are accepted and normalized via
/// [`into_list`](Self::into_list).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReferenceReply {
    /// One reference per requested image, in request order.
    Many(Vec<JobRef>),
    /// A single combined reference.
    One(JobRef),
}

impl ReferenceReply {
    /// Normalize either reply shape to a list of references.
    pub fn into_list(self) -> Vec<JobRef> {
        match self {
            ReferenceReply::Many(refs) => refs,
            ReferenceReply::One(r) => vec![r],
        }
    }
}

/// Typed status of one generation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Generation finished; `hash` identifies the stored image.
    Completed { hash: ImageHash },
    /// Generation is running; `detail` is the human-readable step text.
    InProgress { detail: String },
    /// Generation failed; `detail` describes why.
    Failed { detail: String },
}

/// A status payload that does not fit the known grammar.
///
/// These are expected in the wild (the backend reports transient phases
/// like `in_queue` before generation starts). Callers should log and skip.
#[derive(Debug, thiserror::Error)]
pub enum StatusParseError {
    /// The raw status string is not `completed`, `in_progress*`, or `failed`.
    #[error("Unknown status '{0}'")]
    UnknownStatus(String),

    /// A `completed` payload without a usable result hash.
    #[error("Completed status with bad result: {0}")]
    BadResult(String),
}

/// Prefix of in-progress status strings.
const IN_PROGRESS_PREFIX: &str = "in_progress";

/// Fallback detail for failures that carry no description.
const GENERIC_FAILURE: &str = "generation failed";

/// Map a raw [`StatusPayload`] to a typed [`JobStatus`].
///
/// - `"completed"` requires a result hash: either a JSON string or an
///   array containing exactly one string.
/// - Strings prefixed with `in_progress` become [`JobStatus::InProgress`];
///   the detail is the text after the separator, or the whole raw string
///   when there is none.
/// - `"failed"` uses the result (or `error` field) as detail, falling back
///   to a generic message.
/// - Anything else is a [`StatusParseError`].
pub fn map_status(payload: &StatusPayload) -> Result<JobStatus, StatusParseError> {
    let raw = payload.status.as_str();

    if raw == "completed" {
        let hash = completed_hash(payload.result.as_ref())?;
        return Ok(JobStatus::Completed { hash });
    }

    if raw.starts_with(IN_PROGRESS_PREFIX) {
        let detail = raw[IN_PROGRESS_PREFIX.len()..]
            .trim_start_matches(':')
            .trim();
        let detail = if detail.is_empty() {
            raw.to_string()
        } else {
            detail.to_string()
        };
        return Ok(JobStatus::InProgress { detail });
    }

    if raw == "failed" {
        let detail = payload
            .result
            .as_ref()
            .and_then(|v| v.as_str().map(str::to_string))
            .or_else(|| payload.error.clone())
            .unwrap_or_else(|| GENERIC_FAILURE.to_string());
        return Ok(JobStatus::Failed { detail });
    }

    Err(StatusParseError::UnknownStatus(raw.to_string()))
}

/// Extract the content hash from a `completed` result value.
///
/// Accepts a JSON string or an array containing exactly one string.
fn completed_hash(result: Option<&serde_json::Value>) -> Result<ImageHash, StatusParseError> {
    let value = result.ok_or_else(|| StatusParseError::BadResult("missing".to_string()))?;
    match value {
        serde_json::Value::String(hash) => Ok(hash.clone()),
        serde_json::Value::Array(items) => match items.as_slice() {
            [serde_json::Value::String(hash)] => Ok(hash.clone()),
            _ => Err(StatusParseError::BadResult(format!(
                "expected one hash, got {} elements",
                items.len()
            ))),
        },
        other => Err(StatusParseError::BadResult(format!(
            "unexpected type: {other}"
        ))),
    }
}
