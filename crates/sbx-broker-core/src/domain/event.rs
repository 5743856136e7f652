//! Events emitted for a run and the items a stream subscriber receives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::run::{Run, RunId, RunStatus};

/// A lifecycle or log event for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Log {
        run_id: RunId,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Status {
        run_id: RunId,
        status: RunStatus,
        timestamp: DateTime<Utc>,
    },
    Ready {
        run_id: RunId,
        ingress_url: String,
        acquire_ms: u64,
        deploy_ms: Option<u64>,
        total_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Complete {
        run_id: RunId,
        duration_ms: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn log(run_id: RunId, message: &str, at: DateTime<Utc>) -> Self {
        RunEvent::Log {
            run_id,
            message: message.to_string(),
            timestamp: at,
        }
    }

    pub fn status(run_id: RunId, status: RunStatus, at: DateTime<Utc>) -> Self {
        RunEvent::Status {
            run_id,
            status,
            timestamp: at,
        }
    }

    /// Ready event built from the run's current state; `None` unless ready.
    pub fn ready_from(run: &Run, at: DateTime<Utc>) -> Option<Self> {
        if run.status != RunStatus::Ready {
            return None;
        }
        let ingress_url = run.ingress_url.clone()?;
        let acquire_ms = run.acquire_ms.unwrap_or(0);
        Some(RunEvent::Ready {
            run_id: run.run_id,
            ingress_url,
            acquire_ms,
            deploy_ms: run.deploy_ms,
            total_ms: run.total_ms.unwrap_or(acquire_ms),
            timestamp: at,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::Log { .. } => "log",
            RunEvent::Status { .. } => "status",
            RunEvent::Ready { .. } => "ready",
            RunEvent::Complete { .. } => "complete",
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::Log { run_id, .. }
            | RunEvent::Status { run_id, .. }
            | RunEvent::Ready { run_id, .. }
            | RunEvent::Complete { run_id, .. } => *run_id,
        }
    }
}

/// What a subscriber pulls from a run's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(RunEvent),
    /// Nothing arrived within the keepalive interval.
    Keepalive,
}

impl StreamItem {
    /// Event name as a server-sent-events layer would label it.
    pub fn name(&self) -> &'static str {
        match self {
            StreamItem::Event(event) => event.kind(),
            StreamItem::Keepalive => "keepalive",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StreamItem::Event(event) => {
                serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({ "type": event.kind() }))
            }
            StreamItem::Keepalive => serde_json::json!({ "type": "keepalive" }),
        }
    }

    pub fn as_event(&self) -> Option<&RunEvent> {
        match self {
            StreamItem::Event(event) => Some(event),
            StreamItem::Keepalive => None,
        }
    }
}
