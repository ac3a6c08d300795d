use chrono::{DateTime, Utc};
use serde::Serialize;

pub const EVENT_APDU_RELAYED: &str = "apdu_relayed_success";
pub const EVENT_APDU_FAILED: &str = "apdu_relayed_failure";
pub const EVENT_COMPLIANCE_VIOLATION: &str = "compliance_violation";
pub const EVENT_BUSINESS_VIOLATION: &str = "business_data_violation";
pub const EVENT_SECURITY_ERROR: &str = "security_error";
pub const EVENT_PAIRING_MATCHED: &str = "pairing_matched";
pub const EVENT_PAIRING_CANCELLED: &str = "pairing_cancelled";
pub const EVENT_PAIRING_TIMEOUT: &str = "pairing_timeout";
pub const EVENT_SESSION_CREATED: &str = "session_created";
pub const EVENT_TERMINATED_BY_REQUEST: &str = "session_terminated_by_client_request";
pub const EVENT_TERMINATED_BY_DISCONNECT: &str = "session_terminated_by_client_disconnect";
pub const EVENT_TERMINATED_BY_TIMEOUT: &str = "session_terminated_by_timeout";
pub const EVENT_TERMINATED_BY_APDU_ERROR: &str = "session_terminated_by_apdu_error";
pub const EVENT_TERMINATED_BY_ADMIN: &str = "session_terminated_by_admin";
pub const EVENT_TERMINATED_BY_COMPLIANCE: &str = "session_terminated_by_compliance";
pub const EVENT_CLIENT_DISCONNECTED_BY_ADMIN: &str = "client_disconnected_by_admin";

/// One structured audit event handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub event_type: String,
    pub session_id: Option<String>,
    pub client_ids: Vec<String>,
    pub user_id: Option<String>,
    /// `success`, `failure`, `blocked`...
    pub result: String,
    pub details: sonic_rs::Value,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(event_type: &str, result: &str, at: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type.to_string(),
            session_id: None,
            client_ids: Vec::new(),
            user_id: None,
            result: result.to_string(),
            details: sonic_rs::Value::new(),
            at,
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn clients<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn details(mut self, details: sonic_rs::Value) -> Self {
        self.details = details;
        self
    }
}
