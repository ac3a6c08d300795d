use serde::{Deserialize, Serialize};

/// Risk attached to a compliance outcome, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

/// What a rule does when it hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Block,
    Warn,
    Log,
}

pub const RULE_USER_BLOCKED: &str = "USER_BLOCKED";
pub const RULE_HIGH_RISK_COMMAND: &str = "HIGH_RISK_COMMAND";
pub const RULE_TRANSACTION_AMOUNT_LIMIT: &str = "TRANSACTION_AMOUNT_LIMIT";
pub const RULE_TIME_RESTRICTION: &str = "TIME_RESTRICTION";
pub const RULE_FREQUENCY_LIMIT: &str = "FREQUENCY_LIMIT";
pub const RULE_SUSPICIOUS_PATTERN: &str = "SUSPICIOUS_PATTERN";
pub const RULE_PAN: &str = "PAN_COMPLIANCE";
pub const RULE_AMOUNT: &str = "AMOUNT_COMPLIANCE";
pub const RULE_MERCHANT: &str = "MERCHANT_COMPLIANCE";
pub const RULE_SENSITIVE_DATA: &str = "SENSITIVE_DATA_COMPLIANCE";

/// A named envelope-level check.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceRule {
    pub id: &'static str,
    pub description: &'static str,
    /// Regular expressions the rule matches against, when it is pattern based.
    pub patterns: Vec<String>,
    pub risk_level: RiskLevel,
    pub action: RuleAction,
    pub enabled: bool,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceResult {
    pub compliant: bool,
    pub reason: String,
    pub risk_level: RiskLevel,
    pub actions: Vec<String>,
    /// Rule that produced a failing result.
    pub rule_id: Option<String>,
    /// Non-blocking findings collected along the way.
    pub warnings: Vec<String>,
}

impl ComplianceResult {
    pub fn pass() -> Self {
        Self {
            compliant: true,
            reason: String::new(),
            risk_level: RiskLevel::Low,
            actions: Vec::new(),
            rule_id: None,
            warnings: Vec::new(),
        }
    }

    pub fn fail(
        rule_id: &str,
        reason: impl Into<String>,
        risk_level: RiskLevel,
        actions: &[&str],
    ) -> Self {
        Self {
            compliant: false,
            reason: reason.into(),
            risk_level,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            rule_id: Some(rule_id.to_string()),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}
