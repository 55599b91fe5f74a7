//! Catalog / forwarder processor (§4.2): a single outbound HTTP POST per
//! job, no worker subprocess involved.

use super::{validate_data_file_fields, Processor, ProcessorOutcome};
use crate::model::{JobMessage, StatusOutcome};
use async_trait::async_trait;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

pub struct CatalogProcessor {
    input_destination: String,
    started_destination: String,
    complete_destination: String,
    error_destination: String,
    endpoint: url::Url,
    client: reqwest::Client,
}

impl CatalogProcessor {
    pub fn new(
        input_destination: impl Into<String>,
        started_destination: impl Into<String>,
        complete_destination: impl Into<String>,
        error_destination: impl Into<String>,
        endpoint: url::Url,
    ) -> Self {
        Self {
            input_destination: input_destination.into(),
            started_destination: started_destination.into(),
            complete_destination: complete_destination.into(),
            error_destination: error_destination.into(),
            endpoint,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
        }
    }
}

#[async_trait]
impl Processor for CatalogProcessor {
    fn input_destination(&self) -> &str {
        &self.input_destination
    }
    fn started_destination(&self) -> &str {
        &self.started_destination
    }
    fn complete_destination(&self) -> &str {
        &self.complete_destination
    }
    fn error_destination(&self) -> &str {
        &self.error_destination
    }

    fn validate(&self, message: &JobMessage) -> Result<(), String> {
        validate_data_file_fields(message)
    }

    async fn handle(&self, message: &JobMessage) -> Vec<ProcessorOutcome> {
        let started = ProcessorOutcome::started(self.started_destination.clone());
        let body = serde_json::Value::Object(message.as_map().clone());
        let terminal = match self.client.post(self.endpoint.clone()).json(&body).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => ProcessorOutcome {
                destination: self.complete_destination.clone(),
                outcome: StatusOutcome::Complete { information: None },
                spawned_pid: None,
            },
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                ProcessorOutcome {
                    destination: self.error_destination.clone(),
                    outcome: StatusOutcome::Error {
                        reason: format!("catalog request returned {status}: {text}"),
                    },
                    spawned_pid: None,
                }
            }
            Err(e) => ProcessorOutcome {
                destination: self.error_destination.clone(),
                outcome: StatusOutcome::Error {
                    reason: crate::error::AgentError::CatalogRequest(e.to_string()).to_string(),
                },
                spawned_pid: None,
            },
        };
        vec![started, terminal]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn processor(endpoint: url::Url) -> CatalogProcessor {
        CatalogProcessor::new(
            "/queue/CATALOG.DATA_READY",
            "/queue/CATALOG.STARTED",
            "/queue/CATALOG.COMPLETE",
            "/queue/CATALOG.ERROR",
            endpoint,
        )
    }

    #[tokio::test]
    async fn success_response_completes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/catalog"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let endpoint = url::Url::parse(&format!("{}/catalog", server.uri())).unwrap();
        let p = processor(endpoint);
        let msg = JobMessage::from_bytes(json!({"facility": "SNS"}).to_string().as_bytes()).unwrap();
        let transitions = p.handle(&msg).await;
        assert_eq!(transitions[0].destination, "/queue/CATALOG.STARTED");
        assert_eq!(transitions[1].destination, "/queue/CATALOG.COMPLETE");
    }

    #[tokio::test]
    async fn non_200_response_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/catalog"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let endpoint = url::Url::parse(&format!("{}/catalog", server.uri())).unwrap();
        let p = processor(endpoint);
        let msg = JobMessage::from_bytes(json!({"facility": "SNS"}).to_string().as_bytes()).unwrap();
        let transitions = p.handle(&msg).await;
        assert_eq!(transitions[1].destination, "/queue/CATALOG.ERROR");
        match &transitions[1].outcome {
            StatusOutcome::Error { reason } => assert!(reason.contains("500")),
            _ => panic!("expected error outcome"),
        }
    }

    #[test]
    fn validate_requires_readable_data_file() {
        let p = processor(url::Url::parse("http://localhost/catalog").unwrap());
        let msg = JobMessage::from_bytes(json!({"facility": "SNS"}).to_string().as_bytes()).unwrap();
        assert!(p.validate(&msg).is_err());
    }
}
