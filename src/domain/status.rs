use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// The canonical submission lifecycle, plus per-stage error states.
///
/// Once a terminal status is recorded, no field other than audit
/// timestamps may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SubmissionStatus {
    Received,
    Parsing,
    Parsed,
    Validating,
    Validated,
    Enriching,
    Enriched,
    Converting,
    Converted,
    Submitting,
    AwaitingCallback,
    Submitted,
    BuildingResponse,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
    Expired,
    ParseError,
    ValidationError,
    EnrichmentError,
    ConversionError,
    SubmissionError,
    ResponseError,
    NotificationError,
    AttachmentError,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Received => "RECEIVED",
            SubmissionStatus::Parsing => "PARSING",
            SubmissionStatus::Parsed => "PARSED",
            SubmissionStatus::Validating => "VALIDATING",
            SubmissionStatus::Validated => "VALIDATED",
            SubmissionStatus::Enriching => "ENRICHING",
            SubmissionStatus::Enriched => "ENRICHED",
            SubmissionStatus::Converting => "CONVERTING",
            SubmissionStatus::Converted => "CONVERTED",
            SubmissionStatus::Submitting => "SUBMITTING",
            SubmissionStatus::AwaitingCallback => "AWAITING_CALLBACK",
            SubmissionStatus::Submitted => "SUBMITTED",
            SubmissionStatus::BuildingResponse => "BUILDING_RESPONSE",
            SubmissionStatus::Completed => "COMPLETED",
            SubmissionStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            SubmissionStatus::Failed => "FAILED",
            SubmissionStatus::Cancelled => "CANCELLED",
            SubmissionStatus::Expired => "EXPIRED",
            SubmissionStatus::ParseError => "PARSE_ERROR",
            SubmissionStatus::ValidationError => "VALIDATION_ERROR",
            SubmissionStatus::EnrichmentError => "ENRICHMENT_ERROR",
            SubmissionStatus::ConversionError => "CONVERSION_ERROR",
            SubmissionStatus::SubmissionError => "SUBMISSION_ERROR",
            SubmissionStatus::ResponseError => "RESPONSE_ERROR",
            SubmissionStatus::NotificationError => "NOTIFICATION_ERROR",
            SubmissionStatus::AttachmentError => "ATTACHMENT_ERROR",
        }
    }

    /// Terminal statuses freeze the tracker row.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed
                | SubmissionStatus::CompletedWithErrors
                | SubmissionStatus::Failed
                | SubmissionStatus::Cancelled
                | SubmissionStatus::Expired
        )
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(SubmissionStatus::Received),
            "PARSING" => Ok(SubmissionStatus::Parsing),
            "PARSED" => Ok(SubmissionStatus::Parsed),
            "VALIDATING" => Ok(SubmissionStatus::Validating),
            "VALIDATED" => Ok(SubmissionStatus::Validated),
            "ENRICHING" => Ok(SubmissionStatus::Enriching),
            "ENRICHED" => Ok(SubmissionStatus::Enriched),
            "CONVERTING" => Ok(SubmissionStatus::Converting),
            "CONVERTED" => Ok(SubmissionStatus::Converted),
            "SUBMITTING" => Ok(SubmissionStatus::Submitting),
            "AWAITING_CALLBACK" => Ok(SubmissionStatus::AwaitingCallback),
            "SUBMITTED" => Ok(SubmissionStatus::Submitted),
            "BUILDING_RESPONSE" => Ok(SubmissionStatus::BuildingResponse),
            "COMPLETED" => Ok(SubmissionStatus::Completed),
            "COMPLETED_WITH_ERRORS" => Ok(SubmissionStatus::CompletedWithErrors),
            "FAILED" => Ok(SubmissionStatus::Failed),
            "CANCELLED" => Ok(SubmissionStatus::Cancelled),
            "EXPIRED" => Ok(SubmissionStatus::Expired),
            "PARSE_ERROR" => Ok(SubmissionStatus::ParseError),
            "VALIDATION_ERROR" => Ok(SubmissionStatus::ValidationError),
            "ENRICHMENT_ERROR" => Ok(SubmissionStatus::EnrichmentError),
            "CONVERSION_ERROR" => Ok(SubmissionStatus::ConversionError),
            "SUBMISSION_ERROR" => Ok(SubmissionStatus::SubmissionError),
            "RESPONSE_ERROR" => Ok(SubmissionStatus::ResponseError),
            "NOTIFICATION_ERROR" => Ok(SubmissionStatus::NotificationError),
            "ATTACHMENT_ERROR" => Ok(SubmissionStatus::AttachmentError),
            other => Err(format!("unknown submission status: {other}")),
        }
    }
}

impl TryFrom<String> for SubmissionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubmissionStatus> for String {
    fn from(status: SubmissionStatus) -> Self {
        status.as_str().to_owned()
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
