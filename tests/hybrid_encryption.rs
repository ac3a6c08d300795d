mod common;

use apdu_relay::crypto::hybrid::{device_fingerprint, HybridEncryptionManager, AUDIT_KEY_ID};
use apdu_relay::error::AppError;
use apdu_relay::models::client::DeviceInfo;
use apdu_relay::models::envelope::{ApduDataClass, FrameContext};
use apdu_relay::models::session::ApduDirection;
use common::TestContext;

const SESSION: &str = "pair_hybrid";
const SELECT_VISA: &str = "00A4040007A000000003101000";
const PAN_RESPONSE: &str = "5A0847617390010100109000";

async fn seal(ctx: &TestContext, hex_apdu: &str, direction: ApduDirection, sequence: u64) -> ApduDataClass {
    ctx.state.keys.generate_session_keys(SESSION).await.unwrap();
    let frame = FrameContext {
        client_id: "client_a".to_string(),
        direction,
        sequence,
        device_info: common::device("pixel-8"),
    };
    ctx.state
        .hybrid
        .encrypt_apdu_for_transmission(SESSION, &hex::decode(hex_apdu).unwrap(), &frame, "alice")
        .await
        .unwrap()
}

#[tokio::test]
async fn sealed_frames_open_to_the_original_bytes() {
    let ctx = TestContext::new();
    let envelope = seal(&ctx, SELECT_VISA, ApduDirection::Command, 1).await;

    assert_eq!(envelope.encrypted.key_id, AUDIT_KEY_ID);
    assert_eq!(envelope.auditable.command_type, "CLA:00,INS:A4,P1:04,P2:00");
    assert_eq!(envelope.auditable.application_id.as_deref(), Some("AID_A0000000"));
    assert_eq!(envelope.metadata.sequence, 1);
    assert_eq!(envelope.metadata.checksum.len(), 64);

    let opened = ctx
        .state
        .hybrid
        .decrypt_apdu_from_transmission(SESSION, &envelope, "alice")
        .await
        .unwrap();
    assert_eq!(hex::encode_upper(opened), SELECT_VISA);
}

#[tokio::test]
async fn card_numbers_never_appear_in_the_clear() {
    let ctx = TestContext::new();
    let envelope = seal(&ctx, PAN_RESPONSE, ApduDirection::Response, 2).await;

    assert_eq!(envelope.auditable.command_type, "SW:9000");
    let wire = sonic_rs::to_string(&envelope).unwrap();
    assert!(!wire.contains("4761739001010010"));

    let opened = ctx
        .state
        .hybrid
        .decrypt_apdu_from_transmission(SESSION, &envelope, "alice")
        .await
        .unwrap();
    assert_eq!(hex::encode_upper(opened), PAN_RESPONSE);
}

#[tokio::test]
async fn tampered_metadata_fails_the_checksum() {
    let ctx = TestContext::new();
    let envelope = seal(&ctx, SELECT_VISA, ApduDirection::Command, 1).await;

    let mut tampered = envelope.clone();
    tampered.auditable.command_type = "CLA:00,INS:B2,P1:01,P2:0C".to_string();
    let err = ctx
        .state
        .hybrid
        .decrypt_apdu_from_transmission(SESSION, &tampered, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Crypto(_)));

    let mut replayed = envelope.clone();
    replayed.metadata.sequence = 9;
    let err = ctx
        .state
        .hybrid
        .decrypt_apdu_from_transmission(SESSION, &replayed, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Crypto(_)));

    let mut garbled = envelope;
    garbled.metadata.checksum = "zz".to_string();
    let err = ctx
        .state
        .hybrid
        .decrypt_apdu_from_transmission(SESSION, &garbled, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Crypto(_)));
}

#[tokio::test]
async fn envelopes_are_bound_to_their_session() {
    let ctx = TestContext::new();
    let envelope = seal(&ctx, SELECT_VISA, ApduDirection::Command, 1).await;

    let err = ctx
        .state
        .hybrid
        .decrypt_apdu_from_transmission("pair_other", &envelope, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn unknown_audit_key_ids_are_rejected() {
    let ctx = TestContext::new();
    let mut envelope = seal(&ctx, SELECT_VISA, ApduDirection::Command, 1).await;
    envelope.encrypted.key_id = "audit-v2".to_string();

    let err = ctx
        .state
        .hybrid
        .decrypt_apdu_from_transmission(SESSION, &envelope, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Crypto(_)));
}

#[tokio::test]
async fn another_audit_key_cannot_open_the_payload() {
    let ctx = TestContext::new();
    let envelope = seal(&ctx, SELECT_VISA, ApduDirection::Command, 1).await;

    let stranger = HybridEncryptionManager::new(
        &[9u8; 32],
        ctx.state.keys.clone(),
        ctx.state.compliance.clone(),
        ctx.state.clock.clone(),
    )
    .unwrap();
    let err = stranger
        .decrypt_apdu_from_transmission(SESSION, &envelope, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Crypto(_)));
}

#[tokio::test]
async fn audit_keys_must_be_32_bytes() {
    let ctx = TestContext::new();
    let short = HybridEncryptionManager::new(
        &[1u8; 16],
        ctx.state.keys.clone(),
        ctx.state.compliance.clone(),
        ctx.state.clock.clone(),
    );
    assert!(short.is_err());
}

#[tokio::test]
async fn revoked_keys_stop_both_directions() {
    let ctx = TestContext::new();
    let envelope = seal(&ctx, SELECT_VISA, ApduDirection::Command, 1).await;
    assert!(ctx.state.keys.revoke_session_keys(SESSION).await);

    let err = ctx
        .state
        .hybrid
        .decrypt_apdu_from_transmission(SESSION, &envelope, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let frame = FrameContext {
        client_id: "client_a".to_string(),
        direction: ApduDirection::Command,
        sequence: 2,
        device_info: DeviceInfo::new(),
    };
    let err = ctx
        .state
        .hybrid
        .encrypt_apdu_for_transmission(SESSION, &hex::decode(SELECT_VISA).unwrap(), &frame, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[test]
fn device_fingerprints_depend_on_the_device() {
    let a = device_fingerprint(&common::device("pixel-8"));
    let b = device_fingerprint(&common::device("galaxy-s24"));
    assert_ne!(a, b);
    assert_eq!(a, device_fingerprint(&common::device("pixel-8")));
    assert_eq!(a.len(), 64);
    assert_eq!(
        device_fingerprint(&DeviceInfo::new()),
        device_fingerprint(&DeviceInfo::new())
    );
}
