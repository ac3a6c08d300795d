use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::models::client::DeviceInfo;
use crate::models::session::ApduDirection;

/// Coarse classification of an APDU by instruction byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandClass {
    Select,
    Read,
    Write,
    GetChallenge,
    InternalAuthenticate,
    /// A card response (status word plus optional body).
    Response,
    Unknown,
}

impl CommandClass {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandClass::Select => "SELECT",
            CommandClass::Read => "READ",
            CommandClass::Write => "WRITE",
            CommandClass::GetChallenge => "GET_CHALLENGE",
            CommandClass::InternalAuthenticate => "INTERNAL_AUTHENTICATE",
            CommandClass::Response => "RESPONSE",
            CommandClass::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part of a relayed APDU the server may read in the clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditableData {
    pub command_class: CommandClass,
    /// `CLA:00,INS:A4,P1:04,P2:00` for commands, `SW:9000` for responses.
    pub command_type: String,
    pub application_id: Option<String>,
    pub transaction_type: String,
    /// Minor currency units.
    pub amount: Option<u64>,
    pub currency: Option<String>,
    pub merchant_category: Option<String>,
    /// Set when the instruction alters card keys or lifecycle.
    pub critical_operation: Option<String>,
    pub risk_score: u8,
    pub timestamp: DateTime<Utc>,
}

/// Business payload sealed under the audit key. All fields base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedBusinessData {
    pub ciphertext: String,
    pub nonce: String,
    pub tag: String,
    pub key_id: String,
}

/// Routing and integrity metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApduMetadata {
    pub session_id: String,
    pub sequence: u64,
    pub direction: ApduDirection,
    pub created_at: DateTime<Utc>,
    pub client_id: String,
    pub user_id: String,
    pub device_fingerprint: String,
    /// HMAC-SHA256 over the envelope, keyed with the session MAC key. Hex.
    pub checksum: String,
}

/// The wire envelope for one relayed APDU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApduDataClass {
    pub auditable: AuditableData,
    pub encrypted: EncryptedBusinessData,
    pub metadata: ApduMetadata,
}

/// Decrypted business fields. Wiped on drop.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct BusinessData {
    /// The raw APDU, uppercase hex.
    pub raw_apdu: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cvv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
}

impl fmt::Debug for BusinessData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusinessData")
            .field("raw_apdu_len", &(self.raw_apdu.len() / 2))
            .field("pan", &self.pan.as_ref().map(|_| "[REDACTED]"))
            .field("amount", &self.amount)
            .field("currency", &self.currency)
            .field("merchant_category", &self.merchant_category)
            .field("cvv", &self.cvv.as_ref().map(|_| "***"))
            .field("pin", &self.pin.as_ref().map(|_| "****"))
            .finish()
    }
}

/// Per-frame context supplied by the hub when sealing an APDU.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub client_id: String,
    pub direction: ApduDirection,
    pub sequence: u64,
    pub device_info: DeviceInfo,
}
