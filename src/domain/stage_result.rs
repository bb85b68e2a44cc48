use serde::Deserialize;
use serde::Serialize;

use super::Stage;
use super::ValidationIssue;

/// Location of a stored payload: `(bucket, key)`. Envelopes carry these
/// instead of payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub bucket: String,
    pub key: String,
}

impl ArtifactRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

/// Routing metadata a successful stage hands to the runtime. Everything
/// here ends up on the tracker or the successor envelope; handlers never
/// write those directly.
#[derive(Debug, Default)]
pub struct AdvanceInfo {
    /// Artifact produced by this stage. `None` carries the inbound
    /// payload pointer forward unchanged (validate does this).
    pub artifact: Option<ArtifactRef>,
    pub has_attachments: bool,
    pub attachment_count: i64,
    /// Key of the secondary parsed-data extract, when it was written.
    pub parsed_data_path: Option<String>,
    /// Payer routing learned while parsing; recorded on the tracker.
    pub payer_id: Option<String>,
    /// Payer-assigned handle, when one was learned.
    pub external_reference_id: Option<String>,
    /// `approved` / `denied` / `error`; consumed by `build-response`.
    pub api_response_status: Option<String>,
    /// Non-retryable business outcome travelling to `build-response` as
    /// `(code, message)`.
    pub error: Option<(String, String)>,
}

/// One branch of a fan-out.
#[derive(Debug, Clone)]
pub struct FanOutLeg {
    pub stage: Stage,
    pub artifact: ArtifactRef,
}

/// Outcome of a stage handler. The worker runtime interprets the
/// variant; handlers never touch the tracker, the outbox or the bus.
#[derive(Debug)]
pub enum StageResult {
    /// Move to the pipeline's default next stage (plus any conditional
    /// branch whose predicate matches).
    Advance(AdvanceInfo),
    /// Stage messages for several destinations at once. Every leg must
    /// map to a declared pipeline edge.
    FanOut {
        legs: Vec<FanOutLeg>,
        info: AdvanceInfo,
    },
    /// The pipeline (or a side branch) is done for this submission.
    TerminalSuccess {
        artifact: Option<ArtifactRef>,
        with_errors: bool,
    },
    /// Non-retryable contract violation; terminalizes the submission.
    ValidationFailure { issues: Vec<ValidationIssue> },
    /// Retryable failure; the bus redelivers the message.
    TransientFailure { code: String, message: String },
    /// Payer answered asynchronously: park the submission until the
    /// callback adapter re-injects at `build-response`.
    AwaitCallback {
        external_reference_id: String,
        artifact: Option<ArtifactRef>,
    },
}

impl StageResult {
    pub fn advance(artifact: ArtifactRef) -> Self {
        StageResult::Advance(AdvanceInfo {
            artifact: Some(artifact),
            ..AdvanceInfo::default()
        })
    }
}
