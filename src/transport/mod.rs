pub mod incident_client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::relay::message::IncidentRequest;

/// Outcome of one incident-creation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncidentResult {
    /// The service accepted the incident. The id is `None` when a 2xx body
    /// could not be read.
    Created(Option<String>),
    Unauthorized,
    /// Rejected by the service, or refused locally before sending
    /// (`status` is `None`).
    ClientError { status: Option<u16>, details: String },
    ServerError(String),
}

/// Incident-creation seam. Implementations never retry.
#[async_trait]
pub trait IncidentApi: Send + Sync {
    async fn create(&self, request: &IncidentRequest, access_token: &str) -> IncidentResult;
}

#[derive(Debug, Clone, Serialize)]
pub struct Reference {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentBody {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewIncident {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: String,
    pub service: Reference,
    pub urgency: &'static str,
    pub body: IncidentBody,
    pub escalation_policy: Reference,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateIncidentPayload {
    pub incident: NewIncident,
}

impl CreateIncidentPayload {
    pub fn high_urgency(request: &IncidentRequest, service_id: &str, escalation_policy_id: &str) -> Self {
        Self {
            incident: NewIncident {
                kind: "incident",
                title: request.title().to_string(),
                service: Reference {
                    id: service_id.to_string(),
                    kind: "service_reference",
                },
                urgency: "high",
                body: IncidentBody {
                    kind: "incident_body",
                    details: request.summary().to_string(),
                },
                escalation_policy: Reference {
                    id: escalation_policy_id.to_string(),
                    kind: "escalation_policy_reference",
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedIncident {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateIncidentResponse {
    pub incident: Option<CreatedIncident>,
}
