use reqwest::Client;

use crate::configuration::SubscriberSettings;
use crate::domain::PipelineError;
use crate::domain::SubmissionId;

/// Delivers final response bundles to every configured subscriber
/// endpoint. Webhook signing happens at the boundary and is not part of
/// the gateway.
#[derive(Clone)]
pub struct SubscriberNotifier {
    http_client: Client,
    endpoints: Vec<String>,
}

impl SubscriberNotifier {
    pub fn new(settings: &SubscriberSettings) -> Self {
        let http_client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .expect("failed to build subscriber http client");
        Self {
            http_client,
            endpoints: settings.endpoints.clone(),
        }
    }

    /// Posts the bundle to all endpoints. A single failed endpoint fails
    /// the whole delivery as retryable; the bus will redeliver and the
    /// endpoints are expected to deduplicate on submission id.
    #[tracing::instrument(skip(self, final_bundle), fields(submission_id = %submission_id))]
    pub async fn deliver(
        &self,
        submission_id: &SubmissionId,
        final_bundle: &serde_json::Value,
    ) -> Result<(), PipelineError> {
        for endpoint in &self.endpoints {
            self.http_client
                .post(endpoint)
                .header("X-Submission-ID", submission_id.as_ref())
                .json(final_bundle)
                .send()
                .await
                .and_then(|resp| resp.error_for_status())
                .map_err(|e| {
                    PipelineError::transient(anyhow::anyhow!(
                        "subscriber delivery to {endpoint} failed: {e}"
                    ))
                })?;
        }
        Ok(())
    }
}
