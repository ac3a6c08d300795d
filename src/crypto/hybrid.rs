//! Audit-decryptable envelope around every relayed APDU.
//!
//! The business payload is sealed under the server's audit key rather than a
//! session key, so the relay can always open it for compliance inspection.
//! The session MAC key authenticates the envelope metadata.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::apdu;
use crate::clock::SharedClock;
use crate::crypto::aes::{self, SecureKey, Sealed, NONCE_SIZE, TAG_SIZE};
use crate::crypto::session_keys::{KeyExchangeManager, SessionKeys};
use crate::error::{AppError, Result};
use crate::models::client::DeviceInfo;
use crate::models::compliance::{ComplianceResult, RULE_USER_BLOCKED};
use crate::models::envelope::*;
use crate::services::compliance::ComplianceAuditEngine;

type HmacSha256 = Hmac<Sha256>;

/// Key id recorded on envelopes sealed under the audit key.
pub const AUDIT_KEY_ID: &str = "audit-v1";

/// Seals, opens and polices relayed APDUs.
pub struct HybridEncryptionManager {
    audit_key: SecureKey,
    keys: Arc<KeyExchangeManager>,
    compliance: Arc<ComplianceAuditEngine>,
    clock: SharedClock,
}

impl HybridEncryptionManager {
    /// Creates a new `HybridEncryptionManager`.
    ///
    /// # Arguments
    ///
    /// * `audit_master_key` - The 32-byte server audit key.
    /// * `keys` - Source of per-session MAC keys.
    /// * `compliance` - Evaluates every envelope in both directions.
    /// * `clock` - Timestamps envelopes.
    pub fn new(
        audit_master_key: &[u8],
        keys: Arc<KeyExchangeManager>,
        compliance: Arc<ComplianceAuditEngine>,
        clock: SharedClock,
    ) -> Result<Self> {
        Ok(Self {
            audit_key: SecureKey::from_slice(audit_master_key)?,
            keys,
            compliance,
            clock,
        })
    }

    /// Classifies, seals and audits a raw APDU.
    ///
    /// # Arguments
    ///
    /// * `session_id` - The session the frame belongs to.
    /// * `raw_apdu` - The frame bytes.
    /// * `frame` - Sender, direction and sequence of the frame.
    /// * `user_id` - The owning user.
    ///
    /// # Returns
    ///
    /// The envelope, or a compliance error when the envelope is rejected.
    pub async fn encrypt_apdu_for_transmission(
        &self,
        session_id: &str,
        raw_apdu: &[u8],
        frame: &FrameContext,
        user_id: &str,
    ) -> Result<ApduDataClass> {
        let analysis = apdu::analyze(raw_apdu, frame.direction)?;
        let keys = self.keys.get_session_keys(session_id).await?;
        let now = self.clock.now();

        let business = BusinessData {
            raw_apdu: hex::encode_upper(raw_apdu),
            pan: analysis.pan.clone(),
            amount: analysis.amount,
            currency: analysis.currency.clone(),
            merchant_category: analysis.merchant_category.clone(),
            cvv: None,
            pin: analysis.pin.clone(),
        };
        let plaintext = Zeroizing::new(sonic_rs::to_vec(&business)?);
        let sealed = aes::encrypt(
            self.audit_key.as_bytes(),
            &plaintext,
            associated_data(session_id, frame.sequence).as_bytes(),
        )?;

        let auditable = AuditableData {
            command_class: analysis.class(),
            command_type: analysis.command_type.clone(),
            application_id: analysis.application_id.clone(),
            transaction_type: analysis.transaction_type.clone(),
            amount: analysis.amount,
            currency: analysis.currency.clone(),
            merchant_category: analysis.merchant_category.clone(),
            critical_operation: analysis.critical_operation.clone(),
            risk_score: analysis.risk_score,
            timestamp: now,
        };
        let encrypted = EncryptedBusinessData {
            ciphertext: BASE64.encode(&sealed.ciphertext),
            nonce: BASE64.encode(sealed.nonce),
            tag: BASE64.encode(sealed.tag),
            key_id: AUDIT_KEY_ID.to_string(),
        };
        let mut metadata = ApduMetadata {
            session_id: session_id.to_string(),
            sequence: frame.sequence,
            direction: frame.direction,
            created_at: now,
            client_id: frame.client_id.clone(),
            user_id: user_id.to_string(),
            device_fingerprint: device_fingerprint(&frame.device_info),
            checksum: String::new(),
        };
        metadata.checksum = hex::encode(envelope_mac(&keys, &auditable, &encrypted, &metadata)?);

        let envelope = ApduDataClass {
            auditable,
            encrypted,
            metadata,
        };

        self.compliance
            .record_command(session_id, envelope.auditable.command_class)
            .await;
        let result = self.compliance.audit_apdu_data(&envelope).await;
        self.enforce(&envelope, result, user_id).await?;

        tracing::debug!(
            session_id,
            sequence = frame.sequence,
            command = %envelope.auditable.command_class,
            risk_score = envelope.auditable.risk_score,
            "🔒 APDU sealed for transmission"
        );
        Ok(envelope)
    }

    /// Verifies, opens and deep-audits an envelope.
    ///
    /// # Arguments
    ///
    /// * `session_id` - The session the envelope must belong to.
    /// * `envelope` - The sealed frame.
    /// * `user_id` - The owning user.
    ///
    /// # Returns
    ///
    /// The original APDU bytes. Never returned for a non-compliant frame.
    pub async fn decrypt_apdu_from_transmission(
        &self,
        session_id: &str,
        envelope: &ApduDataClass,
        user_id: &str,
    ) -> Result<Vec<u8>> {
        if envelope.metadata.session_id != session_id {
            return Err(AppError::Validation(
                "Envelope does not belong to this session".to_string(),
            ));
        }

        let result = self.compliance.audit_apdu_data(envelope).await;
        self.enforce(envelope, result, user_id).await?;

        let keys = self.keys.get_session_keys(session_id).await?;
        let expected = envelope_mac(&keys, &envelope.auditable, &envelope.encrypted, &envelope.metadata)?;
        let presented = hex::decode(&envelope.metadata.checksum)
            .map_err(|_| AppError::Crypto("Envelope checksum is not hex".to_string()))?;
        if !bool::from(expected.as_slice().ct_eq(presented.as_slice())) {
            return Err(AppError::Crypto("Envelope checksum mismatch".to_string()));
        }

        if envelope.encrypted.key_id != AUDIT_KEY_ID {
            return Err(AppError::Crypto(format!(
                "Unknown audit key id {}",
                envelope.encrypted.key_id
            )));
        }
        let sealed = decode_sealed(&envelope.encrypted)?;
        let plaintext = Zeroizing::new(aes::decrypt(
            self.audit_key.as_bytes(),
            &sealed,
            associated_data(session_id, envelope.metadata.sequence).as_bytes(),
        )?);
        let business: BusinessData = sonic_rs::from_slice(&plaintext)
            .map_err(|e| AppError::Crypto(format!("Business payload is corrupt: {}", e)))?;

        let result = self.compliance.audit_business_data(&business, user_id).await;
        self.enforce(envelope, result, user_id).await?;

        hex::decode(&business.raw_apdu)
            .map_err(|e| AppError::Crypto(format!("Business payload is corrupt: {}", e)))
    }

    /// Handles a non-compliant result and turns it into an error.
    async fn enforce(&self, envelope: &ApduDataClass, result: ComplianceResult, user_id: &str) -> Result<()> {
        if result.compliant {
            for warning in &result.warnings {
                tracing::warn!(
                    session_id = %envelope.metadata.session_id,
                    user_id,
                    "⚠️ Compliance warning: {}",
                    warning
                );
            }
            return Ok(());
        }

        let rule_id = result.rule_id.clone().unwrap_or_default();
        // already blocked, counting again would extend the block
        if rule_id != RULE_USER_BLOCKED {
            self.compliance.handle_violation(envelope, &result, user_id).await;
        }
        Err(AppError::Compliance {
            reason: result.reason,
            risk_level: result.risk_level,
            rule_id,
        })
    }
}

fn associated_data(session_id: &str, sequence: u64) -> String {
    format!("{}:{}", session_id, sequence)
}

/// SHA-256 of the sorted device metadata, hex. Empty metadata hashes to a fixed value.
pub fn device_fingerprint(device_info: &DeviceInfo) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in device_info {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

fn envelope_mac(
    keys: &SessionKeys,
    auditable: &AuditableData,
    encrypted: &EncryptedBusinessData,
    metadata: &ApduMetadata,
) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(&keys.mac_key)
        .map_err(|e| AppError::Crypto(format!("Invalid MAC key: {}", e)))?;
    let fields: [&[u8]; 12] = [
        metadata.session_id.as_bytes(),
        &metadata.sequence.to_be_bytes(),
        metadata.direction.as_str().as_bytes(),
        metadata.client_id.as_bytes(),
        metadata.user_id.as_bytes(),
        metadata.device_fingerprint.as_bytes(),
        auditable.command_type.as_bytes(),
        auditable.command_class.as_str().as_bytes(),
        &auditable.amount.unwrap_or(u64::MAX).to_be_bytes(),
        encrypted.ciphertext.as_bytes(),
        encrypted.nonce.as_bytes(),
        encrypted.tag.as_bytes(),
    ];
    for field in fields {
        mac.update(&(field.len() as u32).to_be_bytes());
        mac.update(field);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn decode_sealed(encrypted: &EncryptedBusinessData) -> Result<Sealed> {
    let decode = |field: &str, name: &str| {
        BASE64
            .decode(field)
            .map_err(|_| AppError::Crypto(format!("Envelope {} is not base64", name)))
    };
    let nonce: [u8; NONCE_SIZE] = decode(&encrypted.nonce, "nonce")?
        .try_into()
        .map_err(|_| AppError::Crypto("Envelope nonce has wrong length".to_string()))?;
    let tag: [u8; TAG_SIZE] = decode(&encrypted.tag, "tag")?
        .try_into()
        .map_err(|_| AppError::Crypto("Envelope tag has wrong length".to_string()))?;
    Ok(Sealed {
        ciphertext: decode(&encrypted.ciphertext, "ciphertext")?,
        nonce,
        tag,
    })
}
