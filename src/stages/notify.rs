use crate::deps::Deps;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::StageResult;

/// Delivers the final response bundle to every subscriber and declares
/// the pipeline complete. Delivery failures are transient: the bus
/// redelivers, and subscribers deduplicate on submission id.
pub async fn handle(
    deps: &Deps,
    msg: &PipelineMessage,
    input: &[u8],
) -> Result<StageResult, PipelineError> {
    let final_bundle: serde_json::Value = serde_json::from_slice(input)?;

    if let Err(e) = deps.notifier.deliver(&msg.submission_id, &final_bundle).await {
        return Ok(StageResult::TransientFailure {
            code: "SUBSCRIBER_DELIVERY_FAILED".to_owned(),
            message: e.to_string(),
        });
    }

    let with_errors = msg.api_response_status.as_deref() == Some("error");
    Ok(StageResult::TerminalSuccess {
        artifact: None,
        with_errors,
    })
}
