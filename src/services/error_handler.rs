use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{AppError, ErrorCategory, Result};
use crate::models::audit::{AuditRecord, EVENT_SECURITY_ERROR};
use crate::models::compliance::RiskLevel;
use crate::services::audit::AuditRecorder;

/// How loudly an error is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Where the error happened. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext<'a> {
    pub operation: &'a str,
    pub session_id: Option<&'a str>,
    pub client_id: Option<&'a str>,
    pub user_id: Option<&'a str>,
}

/// The outward-facing view of an internal error.
#[derive(Debug, Clone, Serialize)]
pub struct SecureError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub code: u32,
    /// Safe to show to clients and peers.
    pub message: String,
    /// Correlates the client-visible message with the audit record.
    pub reference: String,
}

/// Masks a PAN as `first6****last4`.
pub fn mask_pan(pan: &str) -> String {
    if pan.len() < 10 || !pan.is_ascii() {
        return "****".to_string();
    }
    format!("{}****{}", &pan[..6], &pan[pan.len() - 4..])
}

/// Translates internal errors into a bounded, non-leaky taxonomy.
pub struct SecureErrorHandler {
    detailed: bool,
    redactions: Vec<(Regex, &'static str)>,
    audit: AuditRecorder,
    clock: SharedClock,
}

impl SecureErrorHandler {
    /// Creates a new `SecureErrorHandler`.
    ///
    /// # Arguments
    ///
    /// * `detailed` - Append sanitized error detail to every client message.
    /// * `audit` - Receives one record per handled error.
    /// * `clock` - Timestamps the audit records.
    pub fn new(detailed: bool, audit: AuditRecorder, clock: SharedClock) -> Result<Self> {
        let patterns: [(&str, &'static str); 4] = [
            (r"\b\d{13,19}\b", "[REDACTED_PAN]"),
            (
                r"(?i)\b(token|secret|password|passwd|api[_-]?key|authorization)\b\s*[=:]\s*\S+",
                "$1=[REDACTED]",
            ),
            (r"(?i)\b(bearer)\s+[A-Za-z0-9._~+/=-]+", "$1 [REDACTED]"),
            (r"\b[0-9A-Fa-f]{32,}\b", "[REDACTED_HEX]"),
        ];

        let redactions = patterns
            .into_iter()
            .map(|(pattern, replacement)| {
                Regex::new(pattern)
                    .map(|re| (re, replacement))
                    .map_err(|e| AppError::Internal(format!("Invalid redaction pattern: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            detailed,
            redactions,
            audit,
            clock,
        })
    }

    /// Removes card numbers, credentials and long hex secrets from `text`.
    pub fn sanitize(&self, text: &str) -> String {
        self.redactions
            .iter()
            .fold(text.to_string(), |acc, (re, replacement)| {
                re.replace_all(&acc, *replacement).into_owned()
            })
    }

    /// Categorizes, sanitizes, audits and, when severe, alerts on `error`.
    ///
    /// # Arguments
    ///
    /// * `error` - The internal error.
    /// * `ctx` - Where it happened.
    ///
    /// # Returns
    ///
    /// The outward-facing `SecureError`.
    pub fn handle(&self, error: &AppError, ctx: &ErrorContext<'_>) -> SecureError {
        let category = categorize(error);
        let severity = severity(error, category);
        let detail = self.sanitize(&error.to_string());
        let reference = Uuid::new_v4().simple().to_string();

        let mut message = public_message(error, category).to_string();
        let shows_detail = matches!(
            category,
            ErrorCategory::Validation | ErrorCategory::Conflict | ErrorCategory::Compliance
        );
        if self.detailed || shows_detail {
            message = format!("{}: {}", message, self.detail_for_client(error));
        }

        let severity_name = format!("{:?}", severity).to_lowercase();
        let mut record = AuditRecord::new(EVENT_SECURITY_ERROR, category.as_str(), self.clock.now())
            .details(sonic_rs::json!({
                "operation": ctx.operation,
                "severity": severity_name.as_str(),
                "detail": detail.as_str(),
                "reference": reference.as_str(),
            }));
        if let Some(session_id) = ctx.session_id {
            record = record.session(session_id);
        }
        if let Some(client_id) = ctx.client_id {
            record = record.clients([client_id]);
        }
        if let Some(user_id) = ctx.user_id {
            record = record.user(user_id);
        }
        self.audit.record(record);

        match severity {
            ErrorSeverity::Critical => {
                tracing::error!(
                    target: "alert",
                    operation = ctx.operation,
                    category = category.as_str(),
                    reference = %reference,
                    "🚨 Critical error: {}",
                    detail
                );
            }
            ErrorSeverity::Error => {
                tracing::error!(operation = ctx.operation, category = category.as_str(), "❌ {}", detail);
                if category == ErrorCategory::Internal {
                    tracing::error!(
                        target: "alert",
                        operation = ctx.operation,
                        reference = %reference,
                        "🚨 Unrecovered internal error"
                    );
                }
            }
            ErrorSeverity::Warning => {
                tracing::warn!(operation = ctx.operation, category = category.as_str(), "⚠️ {}", detail);
            }
            ErrorSeverity::Info => {
                tracing::info!(operation = ctx.operation, category = category.as_str(), "{}", detail);
            }
            ErrorSeverity::Debug => {
                tracing::debug!(operation = ctx.operation, category = category.as_str(), "{}", detail);
            }
        }

        SecureError {
            category,
            severity,
            code: error.code(),
            message,
            reference,
        }
    }

    /// The variant's own payload, sanitized, without the display prefix.
    fn detail_for_client(&self, error: &AppError) -> String {
        let raw = match error {
            AppError::Validation(m)
            | AppError::Conflict(m)
            | AppError::NotFound(m)
            | AppError::Expired(m) => m.clone(),
            AppError::Compliance { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        self.sanitize(&raw)
    }
}

/// Typed variants keep their category; untyped failures are categorized by message content.
pub fn categorize(error: &AppError) -> ErrorCategory {
    match error.category() {
        ErrorCategory::Internal => categorize_message(&error.to_string()),
        typed => typed,
    }
}

/// Substring categorization of a free-form error message.
pub fn categorize_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["authentication", "token"]) {
        ErrorCategory::Authentication
    } else if has(&["permission", "unauthorized", "forbidden"]) {
        ErrorCategory::Permission
    } else if has(&["connection", "network", "timed out", "timeout", "unreachable", "redis"]) {
        ErrorCategory::Network
    } else if has(&["invalid", "malformed", "validation", "not found"]) {
        ErrorCategory::Validation
    } else if has(&["busy", "conflict", "already"]) {
        ErrorCategory::Conflict
    } else {
        ErrorCategory::Internal
    }
}

fn severity(error: &AppError, category: ErrorCategory) -> ErrorSeverity {
    match (error, category) {
        (AppError::Compliance { risk_level, .. }, _) => match risk_level {
            RiskLevel::Critical => ErrorSeverity::Critical,
            RiskLevel::High => ErrorSeverity::Error,
            RiskLevel::Medium => ErrorSeverity::Warning,
            RiskLevel::Low => ErrorSeverity::Info,
        },
        (_, ErrorCategory::Authentication | ErrorCategory::Permission) => ErrorSeverity::Warning,
        (_, ErrorCategory::Network | ErrorCategory::Crypto | ErrorCategory::Internal) => {
            ErrorSeverity::Error
        }
        (_, ErrorCategory::Validation | ErrorCategory::Conflict) => ErrorSeverity::Info,
        (_, ErrorCategory::Compliance) => ErrorSeverity::Warning,
    }
}

fn public_message(error: &AppError, category: ErrorCategory) -> &'static str {
    if let AppError::NotFound(_) = error {
        return "Resource not found";
    }
    match category {
        ErrorCategory::Authentication => "Authentication failed",
        ErrorCategory::Permission => "Operation not permitted",
        ErrorCategory::Network => "Service temporarily unavailable",
        ErrorCategory::Validation => "Invalid request",
        ErrorCategory::Conflict => "Request conflicts with current state",
        ErrorCategory::Internal => "Internal server error",
        ErrorCategory::Compliance => "Rejected by compliance policy",
        ErrorCategory::Crypto => "Secure channel error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::services::audit::MemoryAuditSink;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn handler(sink: &MemoryAuditSink) -> SecureErrorHandler {
        let audit = AuditRecorder::spawn(Arc::new(sink.clone()), 16, CancellationToken::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()));
        SecureErrorHandler::new(false, audit, clock).unwrap()
    }

    #[test]
    fn categories_follow_message_keywords() {
        assert_eq!(categorize_message("token expired"), ErrorCategory::Authentication);
        assert_eq!(categorize_message("Unauthorized access"), ErrorCategory::Permission);
        assert_eq!(categorize_message("connection reset by peer"), ErrorCategory::Network);
        assert_eq!(categorize_message("malformed frame"), ErrorCategory::Validation);
        assert_eq!(categorize_message("device busy"), ErrorCategory::Conflict);
        assert_eq!(categorize_message("something odd"), ErrorCategory::Internal);
    }

    #[test]
    fn pans_are_masked() {
        assert_eq!(mask_pan("4761739001010010"), "476173****0010");
        assert_eq!(mask_pan("123"), "****");
    }

    #[tokio::test]
    async fn secrets_never_reach_the_client_message() {
        let sink = MemoryAuditSink::new();
        let handler = handler(&sink);

        let err = AppError::Validation("card 4761739001010010 with token=abc123 rejected".into());
        let out = handler.handle(&err, &ErrorContext { operation: "relay", ..Default::default() });

        assert_eq!(out.category, ErrorCategory::Validation);
        assert!(!out.message.contains("4761739001010010"));
        assert!(!out.message.contains("abc123"));
        assert!(out.message.contains("[REDACTED_PAN]"));

        handler.audit.flush().await;
        assert_eq!(sink.event_types().await, vec![EVENT_SECURITY_ERROR]);
    }

    #[tokio::test]
    async fn audit_records_use_the_injected_clock() {
        let sink = MemoryAuditSink::new();
        let handler = handler(&sink);
        handler.handle(&AppError::Network("peer reset".into()), &ErrorContext::default());

        handler.audit.flush().await;
        let records = sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].at, Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn internal_detail_is_hidden() {
        let sink = MemoryAuditSink::new();
        let handler = handler(&sink);
        let out = handler.handle(
            &AppError::Internal("lua script failed at line 7".into()),
            &ErrorContext::default(),
        );
        assert_eq!(out.message, "Internal server error");
        assert_eq!(out.severity, ErrorSeverity::Error);
    }

    #[tokio::test]
    async fn critical_compliance_is_critical() {
        let sink = MemoryAuditSink::new();
        let handler = handler(&sink);
        let out = handler.handle(
            &AppError::Compliance {
                reason: "Blacklisted card number".into(),
                risk_level: RiskLevel::Critical,
                rule_id: "PAN_COMPLIANCE".into(),
            },
            &ErrorContext::default(),
        );
        assert_eq!(out.category, ErrorCategory::Compliance);
        assert_eq!(out.severity, ErrorSeverity::Critical);
        assert!(out.message.contains("Blacklisted card number"));
    }
}
