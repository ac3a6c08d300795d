#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use apdu_relay::clock::{ManualClock, SharedClock};
use apdu_relay::config::Config;
use apdu_relay::models::client::DeviceInfo;
use apdu_relay::models::protocol::ServerMessage;
use apdu_relay::repositories::memory_pairing::MemoryPairingStore;
use apdu_relay::services::audit::MemoryAuditSink;
use apdu_relay::services::hub::Connection;
use apdu_relay::services::notifier::MemoryNotifier;
use apdu_relay::state::{AppState, Backends};
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

pub const AUDIT_KEY: [u8; 32] = [7u8; 32];

// Shared test context
pub struct TestContext {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub audit: MemoryAuditSink,
    pub notifier: MemoryNotifier,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(Config::with_audit_key(AUDIT_KEY))
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
        ));
        let shared: SharedClock = clock.clone();
        let audit = MemoryAuditSink::new();
        let notifier = MemoryNotifier::new();

        let state = AppState::with_backends(
            &config,
            Backends {
                store: Arc::new(MemoryPairingStore::new(shared.clone())),
                notifier: Arc::new(notifier.clone()),
                audit_sink: Arc::new(audit.clone()),
                clock: shared,
            },
            CancellationToken::new(),
        )
        .unwrap();

        Self {
            state,
            clock,
            audit,
            notifier,
        }
    }

    /// Registers a connection and consumes its `connected` greeting.
    pub async fn connect(&self, user_id: &str, client_id: &str) -> Connection {
        let mut conn = self
            .state
            .hub
            .register_client(user_id, Some(client_id.to_string()), None, None)
            .await
            .unwrap();
        match next(&mut conn).await {
            ServerMessage::Connected { client_id: id } => assert_eq!(id, client_id),
            other => panic!("expected connected, got {:?}", other),
        }
        conn
    }

    /// Connects a card-end and a POS-end of `user_id` and pairs them.
    ///
    /// Returns both connections with their queues drained, and the session id.
    pub async fn paired(&self, user_id: &str, card: &str, pos: &str) -> (Connection, Connection, String) {
        let mut card_conn = self.connect(user_id, card).await;
        let mut pos_conn = self.connect(user_id, pos).await;

        let waiting = self
            .state
            .hub
            .request_pairing(card, "card-end", DeviceInfo::new(), false)
            .await
            .unwrap();
        assert!(!waiting.matched);

        let matched = self
            .state
            .hub
            .request_pairing(pos, "pos-end", DeviceInfo::new(), false)
            .await
            .unwrap();
        assert!(matched.matched);
        let session_id = matched.pair_id.clone().unwrap();

        drain(&mut card_conn);
        drain(&mut pos_conn);
        (card_conn, pos_conn, session_id)
    }

    pub async fn event_types(&self) -> Vec<String> {
        self.state.audit.flush().await;
        self.audit.event_types().await
    }
}

pub async fn next(conn: &mut Connection) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), conn.receiver.recv())
        .await
        .expect("timed out waiting for a server message")
        .expect("connection queue closed")
}

pub fn drain(conn: &mut Connection) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = conn.receiver.try_recv() {
        messages.push(message);
    }
    messages
}

pub fn device(model: &str) -> DeviceInfo {
    let mut info = DeviceInfo::new();
    info.insert("model".to_string(), model.to_string());
    info.insert("os".to_string(), "android-14".to_string());
    info
}
