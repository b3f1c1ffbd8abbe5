use serde::{Deserialize, Serialize};

use crate::relay::error::{RelayError, RelayResult};

/// Queue delivery event: `{"Records":[{"body":"..."}]}`.
#[derive(Debug, Deserialize)]
struct QueueEvent {
    #[serde(rename = "Records", default)]
    records: Vec<QueueRecord>,
}

#[derive(Debug, Deserialize)]
struct QueueRecord {
    body: Option<String>,
}

/// Notification wrapper carried in the record body.
#[derive(Debug, Deserialize)]
struct NotificationBody {
    #[serde(rename = "Message")]
    message: Option<String>,
}

/// A validated approval request, ready to be raised as an incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentRequest {
    title: String,
    summary: String,
    context: String,
}

impl IncidentRequest {
    pub fn new(
        title: impl Into<String>,
        summary: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            summary: summary.into(),
            context: context.into(),
        }
    }

    /// Unwrap the three layers of the queue event and validate the request.
    ///
    /// Only the first record is read; batching is not supported.
    pub fn from_event(raw: &str) -> RelayResult<Self> {
        let event: QueueEvent = serde_json::from_str(raw)
            .map_err(|e| malformed(format!("event is not valid JSON: {e}")))?;

        let record = event
            .records
            .into_iter()
            .next()
            .ok_or_else(|| malformed("event contains no records"))?;
        let body = record
            .body
            .ok_or_else(|| malformed("record has no body"))?;

        let notification: NotificationBody = serde_json::from_str(&body)
            .map_err(|e| malformed(format!("record body is not valid JSON: {e}")))?;
        let message = notification
            .message
            .ok_or_else(|| malformed("record body has no Message field"))?;

        Self::from_message(&message)
    }

    /// Validate the innermost message, which must be a JSON object.
    pub fn from_message(message: &str) -> RelayResult<Self> {
        let mut fields: serde_json::Map<String, serde_json::Value> = serde_json::from_str(message)
            .map_err(|e| malformed(format!("Message is not a JSON object: {e}")))?;

        Ok(Self {
            title: required_string(fields.remove("title"), "title")?,
            summary: required_string(fields.remove("summary"), "summary")?,
            context: required_string(fields.remove("long_context"), "long_context")?,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn context(&self) -> &str {
        &self.context
    }
}

fn required_string(value: Option<serde_json::Value>, field: &str) -> RelayResult<String> {
    match value {
        Some(serde_json::Value::String(s)) => Ok(s),
        Some(_) => Err(malformed(format!("field `{field}` must be a string"))),
        None => Err(malformed(format!("missing field `{field}`"))),
    }
}

fn malformed(reason: impl Into<String>) -> RelayError {
    RelayError::MalformedRequest(reason.into())
}
