mod common;

use apdu_relay::config::Config;
use apdu_relay::error::AppError;
use apdu_relay::models::compliance::*;
use apdu_relay::models::envelope::{ApduDataClass, BusinessData, CommandClass, FrameContext};
use apdu_relay::models::session::ApduDirection;
use chrono::{Duration, TimeZone, Utc};
use common::{TestContext, AUDIT_KEY};

const SELECT_PPSE: &str = "00A404000E325041592E5359532E444446303100";

fn frame(direction: ApduDirection, sequence: u64) -> FrameContext {
    FrameContext {
        client_id: "client_pos".to_string(),
        direction,
        sequence,
        device_info: common::device("pixel-8"),
    }
}

async fn seal(ctx: &TestContext, session_id: &str, hex_apdu: &str, sequence: u64) -> apdu_relay::error::Result<ApduDataClass> {
    ctx.state.keys.generate_session_keys(session_id).await?;
    let raw = hex::decode(hex_apdu).unwrap();
    ctx.state
        .hybrid
        .encrypt_apdu_for_transmission(session_id, &raw, &frame(ApduDirection::Command, sequence), "alice")
        .await
}

fn rule_of(err: AppError) -> (String, RiskLevel) {
    match err {
        AppError::Compliance { rule_id, risk_level, .. } => (rule_id, risk_level),
        other => panic!("expected a compliance error, got {:?}", other),
    }
}

#[tokio::test]
async fn amount_ceiling_is_inclusive() {
    let ctx = TestContext::new();

    let at_limit = seal(&ctx, "pair_amount", "80A80000099F0206000005000000", 1)
        .await
        .unwrap();
    assert_eq!(at_limit.auditable.amount, Some(5_000_000));
    assert_eq!(at_limit.auditable.transaction_type, "PURCHASE");

    let err = seal(&ctx, "pair_amount", "80A80000099F0206000005000001", 2)
        .await
        .unwrap_err();
    assert_eq!(
        rule_of(err),
        (RULE_TRANSACTION_AMOUNT_LIMIT.to_string(), RiskLevel::High)
    );
    assert_eq!(ctx.state.compliance.violation_count("alice").await, 1);
    assert!(!ctx.state.compliance.is_user_blocked("alice").await);
}

#[tokio::test]
async fn critical_card_commands_block_the_user() {
    let ctx = TestContext::new();

    let err = seal(&ctx, "pair_putkey", "80D8000000", 1).await.unwrap_err();
    assert_eq!(rule_of(err), (RULE_HIGH_RISK_COMMAND.to_string(), RiskLevel::Critical));
    assert!(ctx.state.compliance.is_user_blocked("alice").await);

    // every later frame is refused without counting again
    let err = seal(&ctx, "pair_other", SELECT_PPSE, 1).await.unwrap_err();
    assert_eq!(rule_of(err).0, RULE_USER_BLOCKED);
    assert_eq!(ctx.state.compliance.violation_count("alice").await, 1);

    ctx.clock.advance(Duration::hours(2) + Duration::seconds(1));
    assert!(ctx.state.compliance.is_user_blocked("alice").await);
    ctx.clock.advance(Duration::hours(22));
    assert!(!ctx.state.compliance.is_user_blocked("alice").await);
}

#[tokio::test]
async fn repeated_high_violations_block_for_two_hours() {
    let ctx = TestContext::new();
    let envelope = seal(&ctx, "pair_high", SELECT_PPSE, 1).await.unwrap();
    let high = ComplianceResult::fail(RULE_AMOUNT, "too much", RiskLevel::High, &["BLOCK"]);

    for _ in 0..2 {
        ctx.state.compliance.handle_violation(&envelope, &high, "alice").await;
    }
    assert!(!ctx.state.compliance.is_user_blocked("alice").await);

    ctx.state.compliance.handle_violation(&envelope, &high, "alice").await;
    assert!(ctx.state.compliance.is_user_blocked("alice").await);

    let blocked = ctx.state.compliance.audit_apdu_data(&envelope).await;
    assert!(!blocked.compliant);
    assert_eq!(blocked.rule_id.as_deref(), Some(RULE_USER_BLOCKED));
    assert!(blocked.actions.contains(&"BLOCK".to_string()));

    ctx.clock.advance(Duration::hours(2) + Duration::seconds(1));
    assert!(!ctx.state.compliance.is_user_blocked("alice").await);
    assert!(ctx.state.compliance.audit_apdu_data(&envelope).await.compliant);

    let events = ctx.event_types().await;
    assert_eq!(
        events.iter().filter(|e| *e == "business_data_violation").count(),
        3
    );
}

#[tokio::test]
async fn violation_history_warns_then_blocks() {
    let ctx = TestContext::new();
    let envelope = seal(&ctx, "pair_freq", SELECT_PPSE, 1).await.unwrap();
    let medium = ComplianceResult::fail(RULE_TIME_RESTRICTION, "late", RiskLevel::Medium, &["BLOCK"]);

    for _ in 0..20 {
        ctx.state.compliance.handle_violation(&envelope, &medium, "alice").await;
    }
    let warned = ctx.state.compliance.audit_apdu_data(&envelope).await;
    assert!(warned.compliant);
    assert_eq!(warned.warnings.len(), 1);

    for _ in 20..50 {
        ctx.state.compliance.handle_violation(&envelope, &medium, "alice").await;
    }
    let refused = ctx.state.compliance.audit_apdu_data(&envelope).await;
    assert!(!refused.compliant);
    assert_eq!(refused.rule_id.as_deref(), Some(RULE_FREQUENCY_LIMIT));
    assert_eq!(refused.risk_level, RiskLevel::High);

    // medium findings alone never block
    assert!(!ctx.state.compliance.is_user_blocked("alice").await);
}

#[tokio::test]
async fn select_write_select_is_suspicious() {
    let ctx = TestContext::new();

    seal(&ctx, "pair_seq", SELECT_PPSE, 1).await.unwrap();
    let write = seal(&ctx, "pair_seq", "00D6000002AABB", 2).await.unwrap();
    assert_eq!(write.auditable.command_class.as_str(), "WRITE");

    let err = seal(&ctx, "pair_seq", SELECT_PPSE, 3).await.unwrap_err();
    assert_eq!(rule_of(err), (RULE_SUSPICIOUS_PATTERN.to_string(), RiskLevel::High));

    // history is per session
    assert!(seal(&ctx, "pair_fresh", SELECT_PPSE, 1).await.is_ok());
}

#[tokio::test]
async fn a_reported_sequence_is_not_reported_again() {
    let ctx = TestContext::new();

    seal(&ctx, "pair_once", SELECT_PPSE, 1).await.unwrap();
    seal(&ctx, "pair_once", "00D6000002AABB", 2).await.unwrap();
    seal(&ctx, "pair_once", SELECT_PPSE, 3).await.unwrap_err();

    // the history starts over after a hit
    assert!(seal(&ctx, "pair_once", "00B2010C00", 4).await.is_ok());
    assert!(seal(&ctx, "pair_once", SELECT_PPSE, 5).await.is_ok());
    assert_eq!(ctx.state.compliance.violation_count("alice").await, 1);
}

#[tokio::test]
async fn responses_do_not_complete_a_sequence() {
    let ctx = TestContext::new();
    ctx.state.keys.generate_session_keys("pair_resp").await.unwrap();
    for class in [CommandClass::Select, CommandClass::Write, CommandClass::Select] {
        ctx.state.compliance.record_command("pair_resp", class).await;
    }

    let raw = hex::decode("9000").unwrap();
    let response = ctx
        .state
        .hybrid
        .encrypt_apdu_for_transmission("pair_resp", &raw, &frame(ApduDirection::Response, 4), "alice")
        .await
        .unwrap();
    assert!(ctx.state.compliance.audit_apdu_data(&response).await.compliant);
    assert_eq!(ctx.state.compliance.violation_count("alice").await, 0);
}

#[tokio::test]
async fn forgetting_a_session_clears_its_history() {
    let ctx = TestContext::new();

    seal(&ctx, "pair_forget", SELECT_PPSE, 1).await.unwrap();
    seal(&ctx, "pair_forget", "00D6000002AABB", 2).await.unwrap();
    ctx.state.compliance.forget_session("pair_forget").await;

    assert!(seal(&ctx, "pair_forget", SELECT_PPSE, 3).await.is_ok());
}

#[tokio::test]
async fn time_window_restricts_relaying() {
    let mut config = Config::with_audit_key(AUDIT_KEY);
    config.compliance.time_restriction = Some((8, 18));
    let ctx = TestContext::with_config(config);

    assert!(ctx
        .state
        .compliance
        .rules()
        .iter()
        .any(|r| r.id == RULE_TIME_RESTRICTION && r.enabled));
    assert!(seal(&ctx, "pair_time", SELECT_PPSE, 1).await.is_ok());

    ctx.clock.set(Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap());
    let err = seal(&ctx, "pair_time", SELECT_PPSE, 2).await.unwrap_err();
    assert_eq!(rule_of(err), (RULE_TIME_RESTRICTION.to_string(), RiskLevel::Medium));
}

#[tokio::test]
async fn time_rule_is_off_by_default() {
    let ctx = TestContext::new();
    assert!(ctx
        .state
        .compliance
        .rules()
        .iter()
        .any(|r| r.id == RULE_TIME_RESTRICTION && !r.enabled));

    ctx.clock.set(Utc.with_ymd_and_hms(2026, 1, 15, 3, 0, 0).unwrap());
    assert!(seal(&ctx, "pair_night", SELECT_PPSE, 1).await.is_ok());
}

#[tokio::test]
async fn cvv_must_be_three_or_four_digits() {
    let ctx = TestContext::new();

    for (cvv, ok) in [("12", false), ("12345", false), ("12a", false), ("123", true), ("1234", true)] {
        let mut data = BusinessData::default();
        data.cvv = Some(cvv.to_string());
        let result = ctx.state.compliance.audit_business_data(&data, "alice").await;
        assert_eq!(result.compliant, ok, "cvv {}", cvv);
        if !ok {
            assert_eq!(result.rule_id.as_deref(), Some(RULE_SENSITIVE_DATA));
            assert_eq!(result.risk_level, RiskLevel::High);
        }
    }
}

#[tokio::test]
async fn pan_checks() {
    let ctx = TestContext::new();

    let mut data = BusinessData::default();
    data.pan = Some("4111111111111111".to_string());
    let blacklisted = ctx.state.compliance.audit_business_data(&data, "alice").await;
    assert!(!blacklisted.compliant);
    assert_eq!(blacklisted.rule_id.as_deref(), Some(RULE_PAN));
    assert_eq!(blacklisted.risk_level, RiskLevel::Critical);
    assert!(!blacklisted.reason.contains("4111111111111111"));

    let mut data = BusinessData::default();
    data.pan = Some("41111".to_string());
    let malformed = ctx.state.compliance.audit_business_data(&data, "alice").await;
    assert_eq!(malformed.risk_level, RiskLevel::High);

    let mut data = BusinessData::default();
    data.pan = Some("4761739001010010".to_string());
    assert!(ctx.state.compliance.audit_business_data(&data, "alice").await.compliant);
}

#[tokio::test]
async fn merchant_and_small_amount_checks() {
    let ctx = TestContext::new();

    let mut data = BusinessData::default();
    data.merchant_category = Some("GAMBLING".to_string());
    let result = ctx.state.compliance.audit_business_data(&data, "alice").await;
    assert_eq!(result.rule_id.as_deref(), Some(RULE_MERCHANT));

    let mut data = BusinessData::default();
    data.amount = Some(5);
    let result = ctx.state.compliance.audit_business_data(&data, "alice").await;
    assert!(result.compliant);
    assert_eq!(result.warnings.len(), 1);

    let mut data = BusinessData::default();
    data.amount = Some(5_000_001);
    let result = ctx.state.compliance.audit_business_data(&data, "alice").await;
    assert_eq!(result.rule_id.as_deref(), Some(RULE_AMOUNT));
}
