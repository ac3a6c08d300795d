use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Timelike, Utc};
use regex::Regex;
use tokio::sync::Mutex;

use crate::clock::SharedClock;
use crate::config::ComplianceConfig;
use crate::error::{AppError, Result};
use crate::models::audit::{AuditRecord, EVENT_BUSINESS_VIOLATION, EVENT_COMPLIANCE_VIOLATION};
use crate::models::compliance::*;
use crate::models::envelope::{ApduDataClass, BusinessData, CommandClass};
use crate::services::audit::AuditRecorder;
use crate::services::error_handler::mask_pan;

const SUSPICIOUS_SEQUENCES: [&str; 2] = [
    "SELECT.*WRITE.*SELECT",
    "AUTHENTICATE.*WRITE.*AUTHENTICATE",
];

/// Result of a single rule before it is folded into a `ComplianceResult`.
enum RuleOutcome {
    Pass,
    Warn(String),
    Fail(ComplianceResult),
}

#[derive(Default)]
struct EngineState {
    violations: HashMap<String, u32>,
    blocked_until: HashMap<String, DateTime<Utc>>,
    history: HashMap<String, VecDeque<CommandClass>>,
}

impl EngineState {
    /// Lifts an expired block as a side effect.
    fn is_blocked(&mut self, user_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.blocked_until.get(user_id).copied() {
            Some(until) if now < until => Some(until),
            Some(_) => {
                self.blocked_until.remove(user_id);
                tracing::info!(user_id, "🔓 User block expired");
                None
            }
            None => None,
        }
    }
}

/// Evaluates relayed data against the rule set and tracks violations per user.
pub struct ComplianceAuditEngine {
    config: ComplianceConfig,
    rules: Vec<ComplianceRule>,
    sequences: Vec<Regex>,
    state: Mutex<EngineState>,
    audit: AuditRecorder,
    clock: SharedClock,
}

impl ComplianceAuditEngine {
    /// Creates a new `ComplianceAuditEngine` with the default rule set.
    ///
    /// # Arguments
    ///
    /// * `config` - Thresholds and lists.
    /// * `audit` - Receives one record per violation.
    /// * `clock` - Drives block windows and the time-of-day rule.
    pub fn new(config: ComplianceConfig, audit: AuditRecorder, clock: SharedClock) -> Result<Self> {
        let rules = default_rules(&config);
        let sequences = SUSPICIOUS_SEQUENCES
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| AppError::Internal(format!("Invalid sequence pattern: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            rules = rules.len(),
            enabled = rules.iter().filter(|r| r.enabled).count(),
            "✅ Compliance rules loaded"
        );

        Ok(Self {
            config,
            rules,
            sequences,
            state: Mutex::new(EngineState::default()),
            audit,
            clock,
        })
    }

    pub fn rules(&self) -> &[ComplianceRule] {
        &self.rules
    }

    /// Evaluates the envelope's audit-visible fields.
    ///
    /// A blocked user short-circuits everything. Otherwise enabled rules run in
    /// order and the first failure is returned; warnings are collected.
    pub async fn audit_apdu_data(&self, envelope: &ApduDataClass) -> ComplianceResult {
        let now = self.clock.now();
        let user_id = envelope.metadata.user_id.as_str();
        let mut state = self.state.lock().await;

        if let Some(until) = state.is_blocked(user_id, now) {
            return ComplianceResult::fail(
                RULE_USER_BLOCKED,
                format!("User is blocked until {}", until.to_rfc3339()),
                RiskLevel::High,
                &["BLOCK"],
            );
        }

        let violations = state.violations.get(user_id).copied().unwrap_or(0);
        // responses never enter the history, so they cannot complete a sequence
        let history = match envelope.auditable.command_class {
            CommandClass::Response => String::new(),
            _ => state
                .history
                .get(&envelope.metadata.session_id)
                .map(|h| h.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(","))
                .unwrap_or_default(),
        };
        drop(state);

        let mut warnings = Vec::new();
        for rule in self.rules.iter().filter(|r| r.enabled) {
            let outcome = match rule.id {
                RULE_HIGH_RISK_COMMAND => self.check_high_risk_command(rule, envelope),
                RULE_TRANSACTION_AMOUNT_LIMIT => self.check_transaction_amount(rule, envelope),
                RULE_TIME_RESTRICTION => self.check_time_restriction(rule, now),
                RULE_FREQUENCY_LIMIT => self.check_frequency(rule, violations),
                RULE_SUSPICIOUS_PATTERN => self.check_sequence(rule, &history),
                _ => RuleOutcome::Pass,
            };
            if rule.id == RULE_SUSPICIOUS_PATTERN && !matches!(outcome, RuleOutcome::Pass) {
                // a reported sequence starts over, later frames are judged on their own
                self.forget_session(&envelope.metadata.session_id).await;
            }
            match apply_action(rule, outcome) {
                RuleOutcome::Pass => {}
                RuleOutcome::Warn(w) => warnings.push(w),
                RuleOutcome::Fail(result) => return result.with_warnings(warnings),
            }
        }

        ComplianceResult::pass().with_warnings(warnings)
    }

    /// Deep checks on decrypted business fields. The first failing check wins.
    pub async fn audit_business_data(&self, data: &BusinessData, user_id: &str) -> ComplianceResult {
        let mut warnings = Vec::new();
        let checks = [
            self.check_pan(data),
            self.check_amount(data),
            self.check_merchant(data),
            check_sensitive_data(data),
        ];

        for outcome in checks {
            match outcome {
                RuleOutcome::Pass => {}
                RuleOutcome::Warn(w) => {
                    tracing::warn!(user_id, "⚠️ {}", w);
                    warnings.push(w);
                }
                RuleOutcome::Fail(result) => return result.with_warnings(warnings),
            }
        }

        ComplianceResult::pass().with_warnings(warnings)
    }

    /// Counts a violation and escalates by risk level.
    ///
    /// CRITICAL blocks the user for the critical window. HIGH blocks for the high
    /// window once the user has reached the configured violation count.
    pub async fn handle_violation(&self, envelope: &ApduDataClass, result: &ComplianceResult, user_id: &str) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let count = {
            let c = state.violations.entry(user_id.to_string()).or_insert(0);
            *c += 1;
            *c
        };

        let block_for = match result.risk_level {
            RiskLevel::Critical => Some(self.config.critical_block_duration),
            RiskLevel::High if count >= self.config.high_risk_block_after => {
                Some(self.config.high_block_duration)
            }
            _ => None,
        };
        let blocked_until = block_for.map(|d| {
            let until = now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::hours(24));
            let entry = state.blocked_until.entry(user_id.to_string()).or_insert(until);
            if *entry < until {
                *entry = until;
            }
            *entry
        });
        drop(state);

        let rule_id = result.rule_id.as_deref().unwrap_or("-");
        match result.risk_level {
            RiskLevel::Critical => tracing::error!(
                target: "alert",
                user_id,
                session_id = %envelope.metadata.session_id,
                rule_id,
                risk_score = envelope.auditable.risk_score,
                command = %envelope.auditable.command_class,
                "🚨 Critical compliance violation: {}",
                result.reason
            ),
            RiskLevel::High => tracing::warn!(
                target: "alert",
                user_id,
                session_id = %envelope.metadata.session_id,
                rule_id,
                violations = count,
                "⚠️ High risk compliance violation: {}",
                result.reason
            ),
            RiskLevel::Medium => tracing::warn!(
                user_id,
                rule_id,
                "⚠️ Compliance warning: {}",
                result.reason
            ),
            RiskLevel::Low => tracing::debug!(user_id, rule_id, "Compliance note: {}", result.reason),
        }
        if let Some(until) = blocked_until {
            tracing::warn!(user_id, until = %until.to_rfc3339(), "⛔ User blocked");
        }

        let event = if is_business_rule(rule_id) {
            EVENT_BUSINESS_VIOLATION
        } else {
            EVENT_COMPLIANCE_VIOLATION
        };
        self.audit.record(
            AuditRecord::new(event, "blocked", now)
                .session(envelope.metadata.session_id.clone())
                .clients([envelope.metadata.client_id.clone()])
                .user(user_id)
                .details(sonic_rs::json!({
                    "rule_id": rule_id,
                    "reason": result.reason.as_str(),
                    "risk_level": result.risk_level.as_str(),
                    "actions": result.actions.clone(),
                    "violation_count": count,
                    "command_class": envelope.auditable.command_class.as_str(),
                    "command_type": envelope.auditable.command_type.as_str(),
                    "sequence": envelope.metadata.sequence,
                    "blocked_until": blocked_until.map(|t| t.to_rfc3339()),
                })),
        );
    }

    /// Appends a command class to the session's history.
    pub async fn record_command(&self, session_id: &str, class: CommandClass) {
        if class == CommandClass::Response {
            return;
        }
        let mut state = self.state.lock().await;
        let history = state.history.entry(session_id.to_string()).or_default();
        history.push_back(class);
        while history.len() > self.config.history_len {
            history.pop_front();
        }
    }

    /// Drops the session's command history.
    pub async fn forget_session(&self, session_id: &str) {
        self.state.lock().await.history.remove(session_id);
    }

    pub async fn violation_count(&self, user_id: &str) -> u32 {
        self.state.lock().await.violations.get(user_id).copied().unwrap_or(0)
    }

    /// Whether the user is blocked right now. Lifts an expired block.
    pub async fn is_user_blocked(&self, user_id: &str) -> bool {
        let now = self.clock.now();
        self.state.lock().await.is_blocked(user_id, now).is_some()
    }

    fn check_high_risk_command(&self, rule: &ComplianceRule, envelope: &ApduDataClass) -> RuleOutcome {
        let data = &envelope.auditable;
        if let Some(op) = &data.critical_operation {
            return RuleOutcome::Fail(ComplianceResult::fail(
                rule.id,
                format!("Critical card command detected: {}", op),
                rule.risk_level,
                &["BLOCK", "ALERT_ADMIN"],
            ));
        }
        if matches!(
            data.command_class,
            CommandClass::Write | CommandClass::InternalAuthenticate
        ) {
            tracing::warn!(
                user_id = %envelope.metadata.user_id,
                session_id = %envelope.metadata.session_id,
                command = %data.command_class,
                "⚠️ High risk command relayed"
            );
        }
        RuleOutcome::Pass
    }

    fn check_transaction_amount(&self, rule: &ComplianceRule, envelope: &ApduDataClass) -> RuleOutcome {
        match envelope.auditable.amount {
            Some(amount) if amount > self.config.max_transaction_amount => {
                RuleOutcome::Fail(ComplianceResult::fail(
                    rule.id,
                    format!(
                        "Transaction amount {} exceeds limit {}",
                        amount, self.config.max_transaction_amount
                    ),
                    rule.risk_level,
                    &["BLOCK", "REQUIRE_APPROVAL"],
                ))
            }
            _ => RuleOutcome::Pass,
        }
    }

    fn check_time_restriction(&self, rule: &ComplianceRule, now: DateTime<Utc>) -> RuleOutcome {
        let Some((start, end)) = self.config.time_restriction else {
            return RuleOutcome::Pass;
        };
        let hour = now.hour();
        let allowed = if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        };
        if allowed {
            RuleOutcome::Pass
        } else {
            RuleOutcome::Fail(ComplianceResult::fail(
                rule.id,
                format!("Transactions are not allowed at {:02}:00 UTC", hour),
                rule.risk_level,
                &["BLOCK"],
            ))
        }
    }

    fn check_frequency(&self, rule: &ComplianceRule, violations: u32) -> RuleOutcome {
        if violations >= self.config.frequency_block_threshold {
            RuleOutcome::Fail(ComplianceResult::fail(
                rule.id,
                format!("Too many violations ({})", violations),
                rule.risk_level,
                &["BLOCK", "REQUIRE_MANUAL_REVIEW"],
            ))
        } else if violations >= self.config.frequency_warn_threshold {
            RuleOutcome::Warn(format!("User has {} violations on record", violations))
        } else {
            RuleOutcome::Pass
        }
    }

    fn check_sequence(&self, rule: &ComplianceRule, history: &str) -> RuleOutcome {
        for pattern in &self.sequences {
            if pattern.is_match(history) {
                return RuleOutcome::Fail(ComplianceResult::fail(
                    rule.id,
                    format!("Suspicious command sequence: {}", pattern.as_str()),
                    rule.risk_level,
                    &["BLOCK", "INVESTIGATE"],
                ));
            }
        }
        RuleOutcome::Pass
    }

    fn check_pan(&self, data: &BusinessData) -> RuleOutcome {
        let Some(pan) = data.pan.as_deref() else {
            return RuleOutcome::Pass;
        };
        if !(13..=19).contains(&pan.len()) || !pan.bytes().all(|b| b.is_ascii_digit()) {
            return RuleOutcome::Fail(ComplianceResult::fail(
                RULE_PAN,
                "Invalid card number format",
                RiskLevel::High,
                &["BLOCK", "INVESTIGATE"],
            ));
        }
        if self.config.pan_blacklist.iter().any(|b| b == pan) {
            return RuleOutcome::Fail(ComplianceResult::fail(
                RULE_PAN,
                format!("Blacklisted card number {}", mask_pan(pan)),
                RiskLevel::Critical,
                &["BLOCK", "ALERT_ADMIN", "LOG_SECURITY"],
            ));
        }
        RuleOutcome::Pass
    }

    fn check_amount(&self, data: &BusinessData) -> RuleOutcome {
        match data.amount {
            Some(amount) if amount > self.config.max_transaction_amount => {
                RuleOutcome::Fail(ComplianceResult::fail(
                    RULE_AMOUNT,
                    format!(
                        "Transaction amount {} exceeds limit {}",
                        amount, self.config.max_transaction_amount
                    ),
                    RiskLevel::High,
                    &["BLOCK", "REQUIRE_APPROVAL"],
                ))
            }
            Some(amount) if amount > 0 && amount < self.config.small_amount_floor => {
                RuleOutcome::Warn(format!("Anomalous small transaction: {}", amount))
            }
            _ => RuleOutcome::Pass,
        }
    }

    fn check_merchant(&self, data: &BusinessData) -> RuleOutcome {
        let Some(category) = data.merchant_category.as_deref() else {
            return RuleOutcome::Pass;
        };
        let upper = category.to_ascii_uppercase();
        match self
            .config
            .blocked_merchant_categories
            .iter()
            .find(|blocked| upper.contains(blocked.as_str()))
        {
            Some(_) => RuleOutcome::Fail(ComplianceResult::fail(
                RULE_MERCHANT,
                format!("High risk merchant category: {}", category),
                RiskLevel::High,
                &["BLOCK", "ALERT_ADMIN"],
            )),
            None => RuleOutcome::Pass,
        }
    }
}

fn check_sensitive_data(data: &BusinessData) -> RuleOutcome {
    let digits_between = |v: &str, min: usize, max: usize| {
        (min..=max).contains(&v.len()) && v.bytes().all(|b| b.is_ascii_digit())
    };

    if let Some(cvv) = data.cvv.as_deref() {
        if !digits_between(cvv, 3, 4) {
            return RuleOutcome::Fail(ComplianceResult::fail(
                RULE_SENSITIVE_DATA,
                "Invalid CVV format",
                RiskLevel::High,
                &["BLOCK", "ALERT"],
            ));
        }
    }
    if let Some(pin) = data.pin.as_deref() {
        if !digits_between(pin, 4, 6) {
            return RuleOutcome::Fail(ComplianceResult::fail(
                RULE_SENSITIVE_DATA,
                "Invalid PIN format",
                RiskLevel::High,
                &["BLOCK", "ALERT"],
            ));
        }
    }
    RuleOutcome::Pass
}

/// Downgrades a failure when the rule is configured to warn or log only.
fn apply_action(rule: &ComplianceRule, outcome: RuleOutcome) -> RuleOutcome {
    match (rule.action, outcome) {
        (RuleAction::Block, outcome) => outcome,
        (RuleAction::Warn, RuleOutcome::Fail(result)) => RuleOutcome::Warn(result.reason),
        (RuleAction::Log, RuleOutcome::Fail(result)) => {
            tracing::info!(rule_id = rule.id, "Compliance rule hit (log only): {}", result.reason);
            RuleOutcome::Pass
        }
        (_, outcome) => outcome,
    }
}

fn is_business_rule(rule_id: &str) -> bool {
    matches!(rule_id, RULE_PAN | RULE_AMOUNT | RULE_MERCHANT | RULE_SENSITIVE_DATA)
}

/// The envelope rule set, in evaluation order.
fn default_rules(config: &ComplianceConfig) -> Vec<ComplianceRule> {
    vec![
        ComplianceRule {
            id: RULE_HIGH_RISK_COMMAND,
            description: "Blocks commands that alter card keys or lifecycle",
            patterns: Vec::new(),
            risk_level: RiskLevel::Critical,
            action: RuleAction::Block,
            enabled: true,
        },
        ComplianceRule {
            id: RULE_TRANSACTION_AMOUNT_LIMIT,
            description: "Rejects amounts above the transaction ceiling",
            patterns: Vec::new(),
            risk_level: RiskLevel::High,
            action: RuleAction::Block,
            enabled: true,
        },
        ComplianceRule {
            id: RULE_TIME_RESTRICTION,
            description: "Restricts transactions to an allowed UTC hour window",
            patterns: Vec::new(),
            risk_level: RiskLevel::Medium,
            action: RuleAction::Block,
            enabled: config.time_restriction.is_some(),
        },
        ComplianceRule {
            id: RULE_FREQUENCY_LIMIT,
            description: "Blocks users with an excessive violation history",
            patterns: Vec::new(),
            risk_level: RiskLevel::High,
            action: RuleAction::Block,
            enabled: true,
        },
        ComplianceRule {
            id: RULE_SUSPICIOUS_PATTERN,
            description: "Detects suspicious command sequences within a session",
            patterns: SUSPICIOUS_SEQUENCES.iter().map(|p| p.to_string()).collect(),
            risk_level: RiskLevel::High,
            action: RuleAction::Block,
            enabled: config.suspicious_sequence_enabled,
        },
    ]
}
