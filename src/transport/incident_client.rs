use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, FROM};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::relay::message::IncidentRequest;
use crate::transport::{CreateIncidentPayload, CreateIncidentResponse, IncidentApi, IncidentResult};

/// Fixed references every incident is raised against.
#[derive(Debug, Clone)]
pub struct IncidentTarget {
    pub service_id: String,
    pub escalation_policy_id: String,
    /// Sender identity for the `From` header.
    pub from_email: String,
}

#[derive(Debug, Clone)]
pub struct IncidentClient {
    http_client: Client,
    incidents_url: String,
    target: IncidentTarget,
}

impl IncidentClient {
    pub fn new(api_base_url: &str, target: IncidentTarget, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;

        Ok(Self {
            http_client,
            incidents_url: format!("{}/incidents", api_base_url.trim_end_matches('/')),
            target,
        })
    }

    fn headers(&self, access_token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(FROM, HeaderValue::from_str(&self.target.from_email)?);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", access_token))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }
}

#[async_trait]
impl IncidentApi for IncidentClient {
    async fn create(&self, request: &IncidentRequest, access_token: &str) -> IncidentResult {
        let payload = CreateIncidentPayload::high_urgency(
            request,
            &self.target.service_id,
            &self.target.escalation_policy_id,
        );

        let headers = match self.headers(access_token) {
            Ok(h) => h,
            // Unencodable token or sender address.
            Err(err) => {
                return IncidentResult::ClientError {
                    status: None,
                    details: format!("invalid request header: {err}"),
                }
            }
        };

        debug!(url = %self.incidents_url, title = %request.title(), "posting incident");

        let response = match self
            .http_client
            .post(&self.incidents_url)
            .headers(headers)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                let kind = if err.is_timeout() { "timeout" } else { "network error" };
                return IncidentResult::ServerError(format!("{kind}: {err}"));
            }
        };

        let status = response.status();
        debug!(status_code = %status.as_u16(), "incident API responded");

        if status.is_success() {
            return match response.json::<CreateIncidentResponse>().await {
                Ok(body) => IncidentResult::Created(body.incident.and_then(|i| i.id)),
                Err(err) => {
                    warn!(error = %err, "incident created but response body was unreadable");
                    IncidentResult::Created(None)
                }
            };
        }

        let body = response.text().await.unwrap_or_default();
        classify_failure(status, body)
    }
}

fn classify_failure(status: StatusCode, details: String) -> IncidentResult {
    if status == StatusCode::UNAUTHORIZED {
        return IncidentResult::Unauthorized;
    }
    if status.is_client_error() {
        if status == StatusCode::BAD_REQUEST {
            warn!(details = %details, "400 client error from incident API");
        }
        return IncidentResult::ClientError {
            status: Some(status.as_u16()),
            details,
        };
    }
    IncidentResult::ServerError(format!("status {}: {}", status.as_u16(), details))
}
