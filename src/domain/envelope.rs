use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use super::ArtifactRef;
use super::PipelineError;
use super::Stage;
use super::SubmissionId;

/// FIFO envelopes must stay small; large payloads live in the object
/// store and travel by reference only.
pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024;

/// The on-bus message between stages. Carries references and routing
/// metadata; never plaintext PHI beyond already-encrypted pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMessage {
    pub submission_id: SubmissionId,
    pub message_id: Uuid,
    pub schema_version: String,
    /// Next stage to execute.
    pub stage: Stage,
    pub tenant: String,
    pub payload_bucket: String,
    pub payload_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_data_s3_path: Option<String>,
    pub has_attachments: bool,
    pub attachment_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_response_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl PipelineMessage {
    /// First message of a pipeline, pointing `parse` at the raw bundle.
    pub fn initial(
        submission_id: SubmissionId,
        tenant: String,
        raw: &ArtifactRef,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            submission_id,
            message_id: Uuid::new_v4(),
            schema_version: "1.0".to_owned(),
            stage: Stage::Parse,
            tenant,
            payload_bucket: raw.bucket.clone(),
            payload_key: raw.key.clone(),
            parsed_data_s3_path: None,
            has_attachments: false,
            attachment_count: 0,
            external_reference_id: None,
            api_response_status: None,
            error_code: None,
            error_message: None,
            metadata: HashMap::new(),
            created_at: now,
        }
    }

    /// Successor envelope for `next` with a fresh message id. Routing
    /// metadata carries over; the payload pointer moves to `artifact`.
    pub fn successor(&self, next: Stage, artifact: &ArtifactRef, now: DateTime<Utc>) -> Self {
        let mut successor = self.clone();
        successor.message_id = Uuid::new_v4();
        successor.stage = next;
        successor.payload_bucket = artifact.bucket.clone();
        successor.payload_key = artifact.key.clone();
        successor.created_at = now;
        successor
    }

    pub fn payload_ref(&self) -> ArtifactRef {
        ArtifactRef::new(self.payload_bucket.clone(), self.payload_key.clone())
    }

    /// Serializes, enforcing the envelope ceiling.
    pub fn to_json(&self) -> Result<String, PipelineError> {
        let body = serde_json::to_string(self)
            .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
        if body.len() > MAX_ENVELOPE_BYTES {
            return Err(PipelineError::transient(anyhow::anyhow!(
                "envelope for {} exceeds {} bytes ({})",
                self.submission_id,
                MAX_ENVELOPE_BYTES,
                body.len()
            )));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use claims::assert_err;
    use claims::assert_ok;

    use super::*;

    fn message() -> PipelineMessage {
        PipelineMessage::initial(
            SubmissionId::generate(Utc::now()),
            "tenant-a".to_owned(),
            &ArtifactRef::new("bucket", "202601/x/request/raw.json"),
            Utc::now(),
        )
    }

    #[test]
    fn envelope_round_trips() {
        let msg = message();
        let json = assert_ok!(msg.to_json());
        let back: PipelineMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.submission_id, msg.submission_id);
        assert_eq!(back.stage, Stage::Parse);
        assert_eq!(back.payload_key, msg.payload_key);
    }

    #[test]
    fn oversized_envelopes_are_rejected() {
        let mut msg = message();
        msg.metadata
            .insert("blob".to_owned(), "x".repeat(MAX_ENVELOPE_BYTES));
        assert_err!(msg.to_json());
    }

    #[test]
    fn successor_gets_fresh_message_id_and_new_pointer() {
        let msg = message();
        let next = msg.successor(
            Stage::Validate,
            &ArtifactRef::new("bucket", "202601/x/request/parsed.json"),
            Utc::now(),
        );
        assert_ne!(next.message_id, msg.message_id);
        assert_eq!(next.stage, Stage::Validate);
        assert_eq!(next.payload_key, "202601/x/request/parsed.json");
        assert_eq!(next.submission_id, msg.submission_id);
    }
}
