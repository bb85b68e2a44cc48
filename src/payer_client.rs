use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;

use crate::configuration::PayerSettings;
use crate::domain::PipelineError;

/// HTTP client for the external payer. One instance lives in `Deps`; the
/// underlying connection pool is reused across calls.
#[derive(Clone)]
pub struct PayerClient {
    http_client: Client,
    base_url: String,
    authorization_token: Secret<String>,
}

/// Classified payer outcome. 5xx and transport failures never reach this
/// type — they surface as retryable errors instead.
#[derive(Debug)]
pub enum PayerReply {
    /// Synchronous decision; routes straight to response building.
    Decided {
        disposition: String,
        external_reference_id: Option<String>,
        body: serde_json::Value,
    },
    /// Payer will answer later through the callback channel.
    Pended {
        external_reference_id: String,
        body: serde_json::Value,
    },
    /// 4xx: a business outcome, never retried.
    Rejected {
        code: String,
        message: String,
        body: serde_json::Value,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayerResponseBody {
    status: Option<String>,
    external_reference_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
}

impl PayerClient {
    pub fn new(settings: &PayerSettings) -> Self {
        let http_client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .expect("failed to build payer http client");
        Self {
            http_client,
            base_url: settings.base_url.clone(),
            authorization_token: settings.authorization_token.clone(),
        }
    }

    #[cfg(test)]
    fn with_timeout(base_url: String, timeout: std::time::Duration) -> Self {
        Self {
            http_client: Client::builder().timeout(timeout).build().unwrap(),
            base_url,
            authorization_token: Secret::new("test-token".to_owned()),
        }
    }

    /// Submits the canonical payload to the payer endpoint for this
    /// payer's configuration and classifies the reply.
    #[tracing::instrument(skip(self, canonical))]
    pub async fn submit(
        &self,
        endpoint_path: &str,
        canonical: &serde_json::Value,
    ) -> Result<PayerReply, PipelineError> {
        let url = format!("{}{}", self.base_url, endpoint_path);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(self.authorization_token.expose_secret())
            .json(canonical)
            .send()
            .await
            .map_err(|e| PipelineError::Payer {
                code: "PAYER_UNREACHABLE".to_owned(),
                message: e.to_string(),
                retryable: true,
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PipelineError::Payer {
                code: format!("PAYER_{}", status.as_u16()),
                message: "payer returned a server error".to_owned(),
                retryable: true,
            });
        }

        let body: serde_json::Value = response.json().await.map_err(|e| PipelineError::Payer {
            code: "PAYER_BAD_REPLY".to_owned(),
            message: e.to_string(),
            retryable: true,
        })?;
        let parsed: PayerResponseBody =
            serde_json::from_value(body.clone()).unwrap_or(PayerResponseBody {
                status: None,
                external_reference_id: None,
                error_code: None,
                error_message: None,
            });

        if status.is_client_error() {
            return Ok(PayerReply::Rejected {
                code: parsed
                    .error_code
                    .unwrap_or_else(|| format!("PAYER_{}", status.as_u16())),
                message: parsed
                    .error_message
                    .unwrap_or_else(|| "payer rejected the submission".to_owned()),
                body,
            });
        }

        match parsed.status.as_deref() {
            Some("pended") => {
                let external_reference_id =
                    parsed.external_reference_id.ok_or_else(|| PipelineError::Payer {
                        code: "PAYER_BAD_REPLY".to_owned(),
                        message: "pended reply without an external reference".to_owned(),
                        retryable: false,
                    })?;
                Ok(PayerReply::Pended {
                    external_reference_id,
                    body,
                })
            }
            Some(disposition) => Ok(PayerReply::Decided {
                disposition: disposition.to_owned(),
                external_reference_id: parsed.external_reference_id,
                body,
            }),
            None => Err(PipelineError::Payer {
                code: "PAYER_BAD_REPLY".to_owned(),
                message: "payer reply carried no status".to_owned(),
                retryable: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use claims::assert_err;
    use claims::assert_ok;
    use wiremock::matchers::header_exists;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    fn canonical() -> serde_json::Value {
        serde_json::json!({ "claimId": "c-1", "format": "X12-278" })
    }

    #[tokio::test]
    async fn a_2xx_decision_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prior-auth"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "approved",
                "externalReferenceId": "payer-123",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = PayerClient::with_timeout(server.uri(), Duration::from_secs(5));
        let reply = assert_ok!(client.submit("/prior-auth", &canonical()).await);
        match reply {
            PayerReply::Decided {
                disposition,
                external_reference_id,
                ..
            } => {
                assert_eq!(disposition, "approved");
                assert_eq!(external_reference_id.as_deref(), Some("payer-123"));
            }
            other => panic!("expected a decision, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_5xx_is_a_retryable_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = PayerClient::with_timeout(server.uri(), Duration::from_secs(5));
        let err = assert_err!(client.submit("/prior-auth", &canonical()).await);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn a_4xx_is_a_business_rejection_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "errorCode": "MEMBER_NOT_COVERED",
                "errorMessage": "member not covered for requested service",
            })))
            .mount(&server)
            .await;

        let client = PayerClient::with_timeout(server.uri(), Duration::from_secs(5));
        let reply = assert_ok!(client.submit("/prior-auth", &canonical()).await);
        match reply {
            PayerReply::Rejected { code, .. } => assert_eq!(code, "MEMBER_NOT_COVERED"),
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_timeout_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = PayerClient::with_timeout(server.uri(), Duration::from_millis(100));
        let err = assert_err!(client.submit("/prior-auth", &canonical()).await);
        assert!(err.is_retryable());
    }
}
