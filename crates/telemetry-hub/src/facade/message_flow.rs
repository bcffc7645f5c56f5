//! Message-flow payloads reported by chat-facing services.

use serde::{Deserialize, Serialize};

/// Operation name used when a flow carries no trigger type.
pub const DEFAULT_FLOW_OPERATION: &str = "message";

/// Outcome of one inbound message as seen by the trigger engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFlow {
    pub message_id: Option<String>,
    pub channel_id: Option<String>,
    pub triggered: bool,
    pub trigger_type: Option<String>,
    pub response_generated: bool,
    pub processing_time_ms: Option<f64>,
    pub error_type: Option<String>,
}

impl MessageFlow {
    /// Operation label derived from the trigger type.
    #[must_use]
    pub fn operation(&self) -> &str {
        self.trigger_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_FLOW_OPERATION)
    }
}

/// Extra context for a tracked operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// Error category recorded on failure. Defaults to `unknown`.
    pub error_type: Option<String>,
}

impl OperationMetadata {
    pub fn with_error_type(error_type: impl Into<String>) -> Self {
        Self {
            error_type: Some(error_type.into()),
        }
    }
}
