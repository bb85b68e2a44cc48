use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use super::SubmissionStatus;

/// A named processing step with an inbound queue and a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Stage {
    Parse,
    Validate,
    Enrich,
    Attachments,
    Convert,
    PayerCall,
    BuildResponse,
    NotifySubscribers,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Validate => "validate",
            Stage::Enrich => "enrich",
            Stage::Attachments => "attachments",
            Stage::Convert => "convert",
            Stage::PayerCall => "payer-call",
            Stage::BuildResponse => "build-response",
            Stage::NotifySubscribers => "notify-subscribers",
        }
    }

    /// Logical inbound queue name; concrete names resolve through
    /// configuration.
    pub fn queue(&self) -> &'static str {
        self.as_str()
    }

    pub fn all() -> [Stage; 8] {
        [
            Stage::Parse,
            Stage::Validate,
            Stage::Enrich,
            Stage::Attachments,
            Stage::Convert,
            Stage::PayerCall,
            Stage::BuildResponse,
            Stage::NotifySubscribers,
        ]
    }

    /// Status recorded when a worker picks up a message for this stage.
    pub fn in_progress_status(&self) -> SubmissionStatus {
        match self {
            Stage::Parse => SubmissionStatus::Parsing,
            Stage::Validate => SubmissionStatus::Validating,
            Stage::Enrich => SubmissionStatus::Enriching,
            Stage::Convert => SubmissionStatus::Converting,
            Stage::PayerCall => SubmissionStatus::Submitting,
            // the canonical state set has no distinct in-progress status
            // for the tail stages; see DESIGN.md
            Stage::BuildResponse => SubmissionStatus::BuildingResponse,
            Stage::NotifySubscribers => SubmissionStatus::BuildingResponse,
            // side path never drives the main-path status
            Stage::Attachments => SubmissionStatus::BuildingResponse,
        }
    }

    /// Status recorded after a successful `Advance`/`FanOut`. `None` keeps
    /// the current status (tail stages and the side path).
    pub fn done_status(&self) -> Option<SubmissionStatus> {
        match self {
            Stage::Parse => Some(SubmissionStatus::Parsed),
            Stage::Validate => Some(SubmissionStatus::Validated),
            Stage::Enrich => Some(SubmissionStatus::Enriched),
            Stage::Convert => Some(SubmissionStatus::Converted),
            Stage::PayerCall => Some(SubmissionStatus::Submitted),
            Stage::BuildResponse => None,
            Stage::NotifySubscribers => None,
            Stage::Attachments => None,
        }
    }

    pub fn error_status(&self) -> SubmissionStatus {
        match self {
            Stage::Parse => SubmissionStatus::ParseError,
            Stage::Validate => SubmissionStatus::ValidationError,
            Stage::Enrich => SubmissionStatus::EnrichmentError,
            Stage::Attachments => SubmissionStatus::AttachmentError,
            Stage::Convert => SubmissionStatus::ConversionError,
            Stage::PayerCall => SubmissionStatus::SubmissionError,
            Stage::BuildResponse => SubmissionStatus::ResponseError,
            Stage::NotifySubscribers => SubmissionStatus::NotificationError,
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parse" => Ok(Stage::Parse),
            "validate" => Ok(Stage::Validate),
            "enrich" => Ok(Stage::Enrich),
            "attachments" => Ok(Stage::Attachments),
            "convert" => Ok(Stage::Convert),
            "payer-call" => Ok(Stage::PayerCall),
            "build-response" => Ok(Stage::BuildResponse),
            "notify-subscribers" => Ok(Stage::NotifySubscribers),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

impl TryFrom<String> for Stage {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.as_str().to_owned()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
