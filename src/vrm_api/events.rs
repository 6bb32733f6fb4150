//! Notifications emitted while the integration works.
//!
//! The host decides where they go: a UI toast, a websocket, a log. Sinks are
//! fire-and-forget; a sink that drops events does not affect the operation
//! that emitted them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vrm_api::resources::Installation;

/// Outcome carried by a [`StatusEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusOutcome {
    Success,
    Failure,
}

/// Progress or result notification for the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "status")]
    pub outcome: StatusOutcome,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            outcome: StatusOutcome::Success,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outcome: StatusOutcome::Failure,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == StatusOutcome::Success
    }
}

/// Everything a sink can receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VrmEvent {
    Status(StatusEvent),
    /// Fresh installation list, e.g. for refreshing broker subscriptions
    Discovered(Vec<Installation>),
}

/// Receiver of [`VrmEvent`]s
pub trait EventSink: Send + Sync {
    fn emit(&self, event: VrmEvent);
}

impl<F> EventSink for F
where
    F: Fn(VrmEvent) + Send + Sync,
{
    fn emit(&self, event: VrmEvent) {
        self(event)
    }
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<VrmEvent> {
    fn emit(&self, event: VrmEvent) {
        if self.send(event).is_err() {
            tracing::debug!("Event receiver dropped, discarding VRM event");
        }
    }
}

impl EventSink for tokio::sync::broadcast::Sender<VrmEvent> {
    fn emit(&self, event: VrmEvent) {
        // No subscribers is not an error for a notification channel
        let _ = self.send(event);
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: VrmEvent) {}
}
