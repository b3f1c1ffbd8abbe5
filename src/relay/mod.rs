pub mod config;
pub mod error;
pub mod message;
pub mod orchestrator;

pub use error::{RelayError, RelayResult};
pub use message::IncidentRequest;
pub use orchestrator::{AuditStatus, HandleOutcome, RequestOrchestrator};
