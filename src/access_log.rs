//! Structured access-log entries.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::policy::{DecisionReason, RequestContext};

/// Session lifecycle marker carried by an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    SessionStart,
    SessionEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub event: SessionEvent,
    pub service: String,
    /// Absent for connections that never became a session.
    pub session_id: Option<String>,
    pub source: SocketAddr,
    /// When the connection was accepted.
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub is_authenticated: bool,
    pub is_authorized: bool,
    pub request_context: RequestContext,
    pub reason: Option<DecisionReason>,
}

/// Destination for access-log entries. Emission is fire-and-forget.
pub trait AccessLogSink: Send + Sync {
    fn emit(&self, entry: AccessLogEntry);
}

/// Writes entries as JSON on the `warden::access` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLogSink for TracingAccessLog {
    fn emit(&self, entry: AccessLogEntry) {
        match serde_json::to_string(&entry) {
            Ok(json) => info!(
                target: "warden::access",
                event = ?entry.event,
                session_id = entry.session_id.as_deref().unwrap_or(""),
                "{json}"
            ),
            Err(e) => warn!(error = %e, "Failed to serialize access log entry"),
        }
    }
}
