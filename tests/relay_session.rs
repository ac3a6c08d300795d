mod common;

use apdu_relay::error::AppError;
use apdu_relay::models::client::DeviceInfo;
use apdu_relay::models::compliance::{
    RiskLevel, RULE_HIGH_RISK_COMMAND, RULE_PAN, RULE_SUSPICIOUS_PATTERN,
};
use apdu_relay::models::protocol::ServerMessage;
use apdu_relay::models::session::SessionState;
use apdu_relay::services::hub::AdminTermination;
use common::{drain, next, TestContext};

const SELECT_PPSE: &str = "00A4040008A000000003000000";

fn bytes(hex_apdu: &str) -> Vec<u8> {
    hex::decode(hex_apdu).unwrap()
}

#[tokio::test]
async fn pairing_opens_a_session_for_both_sides() {
    let ctx = TestContext::new();
    let mut c1 = ctx.connect("alice", "c1").await;
    let mut c2 = ctx.connect("alice", "c2").await;

    let first = ctx
        .state
        .hub
        .request_pairing("c1", "card-end", DeviceInfo::new(), false)
        .await
        .unwrap();
    assert!(!first.matched);

    let second = ctx
        .state
        .hub
        .request_pairing("c2", "pos-end", DeviceInfo::new(), false)
        .await
        .unwrap();
    assert!(second.matched);
    assert_eq!(second.peer_client_id.as_deref(), Some("c1"));
    let session_id = second.pair_id.clone().unwrap();

    match next(&mut c1).await {
        ServerMessage::SessionEstablished {
            session_id: id,
            peer_client_id,
            ..
        } => {
            assert_eq!(id, session_id);
            assert_eq!(peer_client_id, "c2");
        }
        other => panic!("unexpected {:?}", other),
    }
    match next(&mut c1).await {
        ServerMessage::PairingResult(result) => {
            assert!(result.matched);
            assert_eq!(result.peer_client_id.as_deref(), Some("c2"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(next(&mut c2).await, ServerMessage::SessionEstablished { .. }));

    let session = ctx.state.hub.get_session_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Created);
    let client = ctx.state.hub.find_client_by_id("c1").await.unwrap().unwrap();
    assert_eq!(client.session_id.as_deref(), Some(session_id.as_str()));
    assert!(ctx.state.keys.get_session_keys(&session_id).await.is_ok());

    assert!(ctx.event_types().await.contains(&"session_created".to_string()));
}

#[tokio::test]
async fn select_command_reaches_the_card_unchanged() {
    let ctx = TestContext::new();
    let (mut c1, mut c2, session_id) = ctx.paired("alice", "c1", "c2").await;

    let sequence = ctx
        .state
        .hub
        .relay_apdu(&session_id, "c2", &bytes(SELECT_PPSE))
        .await
        .unwrap();
    assert_eq!(sequence, 1);

    match next(&mut c1).await {
        ServerMessage::ApduToCard {
            session_id: id,
            sequence,
            apdu,
        } => {
            assert_eq!(id, session_id);
            assert_eq!(sequence, 1);
            assert_eq!(apdu, SELECT_PPSE);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(drain(&mut c2).is_empty());

    let sequence = ctx
        .state
        .hub
        .relay_apdu(&session_id, "c1", &bytes("6F0E8407A0000000031010A5039F38009000"))
        .await
        .unwrap();
    assert_eq!(sequence, 2);
    match next(&mut c2).await {
        ServerMessage::ApduFromCard { apdu, .. } => {
            assert_eq!(apdu, "6F0E8407A0000000031010A5039F38009000")
        }
        other => panic!("unexpected {:?}", other),
    }

    let session = ctx.state.hub.get_session_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert_eq!(session.upstream_count, 1);
    assert_eq!(session.downstream_count, 1);

    let relayed = ctx
        .event_types()
        .await
        .into_iter()
        .filter(|e| e == "apdu_relayed_success")
        .count();
    assert_eq!(relayed, 2);
}

#[tokio::test]
async fn outsiders_cannot_relay_into_a_session() {
    let ctx = TestContext::new();
    let (_c1, _c2, session_id) = ctx.paired("alice", "c1", "c2").await;
    let _c3 = ctx.connect("alice", "c3").await;

    let err = ctx
        .state
        .hub
        .relay_apdu(&session_id, "c3", &bytes(SELECT_PPSE))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    let err = ctx
        .state
        .hub
        .relay_apdu("pair_missing", "c2", &bytes(SELECT_PPSE))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn short_frames_are_rejected_and_not_delivered() {
    let ctx = TestContext::new();
    let (mut c1, _c2, session_id) = ctx.paired("alice", "c1", "c2").await;

    let err = ctx
        .state
        .hub
        .relay_apdu(&session_id, "c2", &bytes("00A4"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(drain(&mut c1).is_empty());

    let session = ctx.state.hub.get_session_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Created);
    assert!(session.flagged.is_some());
}

#[tokio::test]
async fn ending_a_session_notifies_both_and_happens_once() {
    let ctx = TestContext::new();
    let (mut c1, mut c2, session_id) = ctx.paired("alice", "c1", "c2").await;

    ctx.state.hub.end_session(&session_id, "c2").await.unwrap();
    for conn in [&mut c1, &mut c2] {
        match next(conn).await {
            ServerMessage::SessionTerminated { reason, .. } => assert_eq!(reason, "client_request"),
            other => panic!("unexpected {:?}", other),
        }
    }

    // a second request is a no-op
    ctx.state.hub.end_session(&session_id, "c1").await.unwrap();
    assert!(drain(&mut c1).is_empty());

    let err = ctx
        .state
        .hub
        .relay_apdu(&session_id, "c2", &bytes(SELECT_PPSE))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    assert!(ctx.state.keys.get_session_keys(&session_id).await.is_err());
    let client = ctx.state.hub.find_client_by_id("c1").await.unwrap().unwrap();
    assert_eq!(client.session_id, None);
    assert_eq!(client.role, None);

    let terminations = ctx
        .event_types()
        .await
        .into_iter()
        .filter(|e| e.starts_with("session_terminated"))
        .count();
    assert_eq!(terminations, 1);
}

#[tokio::test]
async fn participant_disconnect_terminates_the_session() {
    let ctx = TestContext::new();
    let (mut c1, c2, session_id) = ctx.paired("alice", "c1", "c2").await;
    drop(c2);

    let removed = ctx.state.hub.unregister_client("c2").await.unwrap();
    assert!(removed.is_some());

    assert!(matches!(next(&mut c1).await, ServerMessage::PeerDisconnected { .. }));
    match next(&mut c1).await {
        ServerMessage::SessionTerminated { reason, .. } => assert_eq!(reason, "client_disconnect"),
        other => panic!("unexpected {:?}", other),
    }

    let session = ctx.state.hub.get_session_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Terminated);
    assert!(ctx.state.hub.find_client_by_id("c2").await.unwrap().is_none());
    assert!(ctx
        .event_types()
        .await
        .contains(&"session_terminated_by_client_disconnect".to_string()));
}

#[tokio::test]
async fn admin_termination_is_idempotent_until_purged() {
    let ctx = TestContext::new();
    let (mut c1, _c2, session_id) = ctx.paired("alice", "c1", "c2").await;

    let first = ctx
        .state
        .hub
        .terminate_session_by_admin(&session_id, "fraud review", "ops")
        .await
        .unwrap();
    assert_eq!(first, AdminTermination::Terminated);
    match next(&mut c1).await {
        ServerMessage::SessionTerminated { reason, .. } => assert_eq!(reason, "fraud review"),
        other => panic!("unexpected {:?}", other),
    }

    let second = ctx
        .state
        .hub
        .terminate_session_by_admin(&session_id, "again", "ops")
        .await
        .unwrap();
    assert_eq!(second, AdminTermination::AlreadyTerminated);
    assert!(drain(&mut c1).is_empty());

    let session = ctx.state.hub.get_session_by_id(&session_id).await.unwrap().unwrap();
    let termination = session.termination.unwrap();
    assert_eq!(termination.reason, "fraud review");
    assert_eq!(termination.actor, "ops");

    ctx.clock.advance(chrono::Duration::seconds(31));
    assert_eq!(ctx.state.hub.sweep_inactive().await.unwrap(), 1);

    let err = ctx
        .state
        .hub
        .terminate_session_by_admin(&session_id, "late", "ops")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn idle_sessions_are_swept() {
    let ctx = TestContext::new();
    let (mut c1, mut c2, session_id) = ctx.paired("alice", "c1", "c2").await;

    ctx.clock.advance(chrono::Duration::seconds(299));
    assert_eq!(ctx.state.hub.sweep_inactive().await.unwrap(), 0);

    ctx.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(ctx.state.hub.sweep_inactive().await.unwrap(), 1);

    for conn in [&mut c1, &mut c2] {
        match next(conn).await {
            ServerMessage::SessionTerminated { reason, .. } => assert_eq!(reason, "inactive_timeout"),
            other => panic!("unexpected {:?}", other),
        }
    }
    let session = ctx.state.hub.get_session_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(session.termination.unwrap().actor, "system");
}

#[tokio::test]
async fn critical_command_is_dropped_and_ends_the_session() {
    let ctx = TestContext::new();
    let (mut c1, mut c2, session_id) = ctx.paired("alice", "c1", "c2").await;

    // PUT KEY
    let err = ctx
        .state
        .hub
        .relay_apdu(&session_id, "c2", &bytes("80D8000000"))
        .await
        .unwrap_err();
    match err {
        AppError::Compliance {
            risk_level,
            rule_id,
            ..
        } => {
            assert_eq!(risk_level, RiskLevel::Critical);
            assert_eq!(rule_id, RULE_HIGH_RISK_COMMAND);
        }
        other => panic!("unexpected {:?}", other),
    }

    // the card only hears about the termination
    match next(&mut c1).await {
        ServerMessage::SessionTerminated { reason, .. } => assert_eq!(reason, "compliance_violation"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(next(&mut c2).await, ServerMessage::SessionTerminated { .. }));
    assert!(ctx.state.compliance.is_user_blocked("alice").await);

    let events = ctx.event_types().await;
    assert!(events.contains(&"apdu_relayed_failure".to_string()));
    assert!(events.contains(&"compliance_violation".to_string()));
    assert!(events.contains(&"session_terminated_by_compliance".to_string()));
    assert!(!events.contains(&"apdu_relayed_success".to_string()));
}

#[tokio::test]
async fn traffic_after_a_suspicious_sequence_still_flows() {
    let ctx = TestContext::new();
    let (mut c1, mut c2, session_id) = ctx.paired("alice", "c1", "c2").await;

    for apdu in [SELECT_PPSE, "00D6000002AABB"] {
        ctx.state.hub.relay_apdu(&session_id, "c2", &bytes(apdu)).await.unwrap();
    }
    drain(&mut c1);

    let err = ctx
        .state
        .hub
        .relay_apdu(&session_id, "c2", &bytes(SELECT_PPSE))
        .await
        .unwrap_err();
    match err {
        AppError::Compliance {
            risk_level,
            rule_id,
            ..
        } => {
            assert_eq!(risk_level, RiskLevel::High);
            assert_eq!(rule_id, RULE_SUSPICIOUS_PATTERN);
        }
        other => panic!("unexpected {:?}", other),
    }
    drain(&mut c1);
    drain(&mut c2);

    // READ RECORD
    ctx.state
        .hub
        .relay_apdu(&session_id, "c2", &bytes("00B2010C00"))
        .await
        .unwrap();
    match next(&mut c1).await {
        ServerMessage::ApduToCard { apdu, .. } => assert_eq!(apdu, "00B2010C00"),
        other => panic!("unexpected {:?}", other),
    }

    ctx.state.hub.relay_apdu(&session_id, "c1", &bytes("9000")).await.unwrap();
    match next(&mut c2).await {
        ServerMessage::ApduFromCard { apdu, .. } => assert_eq!(apdu, "9000"),
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(ctx.state.compliance.violation_count("alice").await, 1);
    assert!(!ctx.state.compliance.is_user_blocked("alice").await);
    let session = ctx.state.hub.get_session_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Active);
}

#[tokio::test]
async fn blacklisted_card_in_a_response_is_never_forwarded() {
    let ctx = TestContext::new();
    let (_c1, mut c2, session_id) = ctx.paired("alice", "c1", "c2").await;

    let err = ctx
        .state
        .hub
        .relay_apdu(&session_id, "c1", &bytes("5A0841111111111111119000"))
        .await
        .unwrap_err();
    match err {
        AppError::Compliance {
            risk_level,
            rule_id,
            reason,
        } => {
            assert_eq!(risk_level, RiskLevel::Critical);
            assert_eq!(rule_id, RULE_PAN);
            assert!(!reason.contains("4111111111111111"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let pushed = drain(&mut c2);
    assert!(pushed
        .iter()
        .all(|m| !matches!(m, ServerMessage::ApduFromCard { .. })));
    assert!(ctx
        .event_types()
        .await
        .contains(&"business_data_violation".to_string()));
}

#[tokio::test]
async fn duplicate_client_ids_are_refused() {
    let ctx = TestContext::new();
    let _c1 = ctx.connect("alice", "c1").await;

    let err = ctx
        .state
        .hub
        .register_client("alice", Some("c1".to_string()), None, None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn admin_disconnect_closes_the_connection() {
    let ctx = TestContext::new();
    let (mut c1, c2, session_id) = ctx.paired("alice", "c1", "c2").await;

    ctx.state
        .hub
        .disconnect_client_by_id("c2", "policy")
        .await
        .unwrap();

    assert!(c2.closed.is_cancelled());
    match next(&mut c1).await {
        ServerMessage::SessionTerminated { reason, .. } => assert_eq!(reason, "policy"),
        other => panic!("unexpected {:?}", other),
    }
    let session = ctx.state.hub.get_session_by_id(&session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Terminated);

    let clients = ctx.state.hub.get_all_clients().await.unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].client_id, "c1");
    assert!(ctx
        .event_types()
        .await
        .contains(&"client_disconnected_by_admin".to_string()));
}
