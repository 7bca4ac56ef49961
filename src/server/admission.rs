use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::access_log::{AccessLogEntry, AccessLogSink, SessionEvent};
use crate::metrics::SessionMetrics;
use crate::policy::{AuthResponse, DownstreamRequest, PolicyClient};
use crate::service::Service;

/// Outcome of the admission check for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Close silently. Nothing was logged.
    Unauthenticated,
    /// Close. The session-start entry has already been emitted.
    Unauthorized(AuthResponse),
    Admitted(AuthResponse),
    /// Shutdown began while the policy call was pending.
    Cancelled,
}

/// Authenticate-then-authorize check run before any protocol bytes flow.
pub struct AdmissionGate {
    policy: Arc<dyn PolicyClient>,
    access_log: Arc<dyn AccessLogSink>,
    metrics: Arc<SessionMetrics>,
}

impl AdmissionGate {
    pub fn new(
        policy: Arc<dyn PolicyClient>,
        access_log: Arc<dyn AccessLogSink>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            policy,
            access_log,
            metrics,
        }
    }

    pub async fn admit(
        &self,
        request: DownstreamRequest,
        service: &Service,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Admission {
        let source = request.source;
        let decision = tokio::select! {
            res = self.policy.authenticate_and_authorize(request) => res,
            _ = cancel.cancelled() => return Admission::Cancelled,
        };

        let auth = match decision {
            Ok(auth) if auth.is_authenticated => auth,
            Ok(_) => {
                debug!(%source, "Connection not authenticated");
                self.metrics.record_unauthenticated();
                return Admission::Unauthenticated;
            }
            Err(e) => {
                debug!(%source, error = %e, "Policy check failed");
                self.metrics.record_unauthenticated();
                return Admission::Unauthenticated;
            }
        };

        if auth.is_authorized {
            return Admission::Admitted(auth);
        }

        debug!(%source, "Connection not authorized");
        self.metrics.record_unauthorized();
        self.access_log.emit(AccessLogEntry {
            event: SessionEvent::SessionStart,
            service: service.name.clone(),
            session_id: None,
            source,
            started_at,
            timestamp: Utc::now(),
            is_authenticated: true,
            is_authorized: false,
            request_context: auth.request_context.clone(),
            reason: auth.reason.clone(),
        });
        Admission::Unauthorized(auth)
    }
}
