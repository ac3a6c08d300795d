use serde::{Deserialize, Serialize};

use crate::models::client::{DeviceInfo, Role};
use crate::models::pairing::{MatchResult, PairingStatusReport, UserPairingOverview};

/// Numeric error codes carried in `error` frames.
pub mod codes {
    pub const BAD_REQUEST: u32 = 40001;
    pub const AUTH_FAILED: u32 = 40102;
    pub const PERMISSION_DENIED: u32 = 40301;
    pub const NOT_FOUND: u32 = 40401;
    pub const CONFLICT: u32 = 40901;
    pub const COMPLIANCE_REJECTED: u32 = 42201;
    pub const INTERNAL_ERROR: u32 = 50001;
    pub const SERVICE_UNAVAILABLE: u32 = 50301;
}

/// Frames a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RequestPairing {
        role: String,
        #[serde(default)]
        device_info: DeviceInfo,
        #[serde(default)]
        force: bool,
    },
    CancelPairing {
        role: Role,
    },
    PairingStatus {
        #[serde(default)]
        role: Option<Role>,
    },
    Apdu {
        session_id: String,
        /// Hex encoded APDU bytes.
        apdu: String,
    },
    EndSession {
        session_id: String,
    },
    Heartbeat,
}

/// Frames the server pushes to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        client_id: String,
    },
    PairingResult(MatchResult),
    PairingStatus(PairingStatusReport),
    PairingOverview(UserPairingOverview),
    SessionEstablished {
        session_id: String,
        peer_client_id: String,
        peer_role: Role,
    },
    SessionFailed {
        reason: String,
    },
    /// A command travelling toward the card.
    ApduToCard {
        session_id: String,
        sequence: u64,
        apdu: String,
    },
    /// A response travelling toward the POS.
    ApduFromCard {
        session_id: String,
        sequence: u64,
        apdu: String,
    },
    RelayAck {
        session_id: String,
        sequence: u64,
    },
    SessionTerminated {
        session_id: String,
        reason: String,
    },
    PeerDisconnected {
        session_id: String,
    },
    Error {
        code: u32,
        message: String,
    },
    HeartbeatResponse {
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_tagged_by_type() {
        let msg: ClientMessage = sonic_rs::from_str(
            r#"{"type":"apdu","session_id":"pair_1","apdu":"00A40400"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Apdu { ref apdu, .. } if apdu == "00A40400"));

        let msg: ClientMessage =
            sonic_rs::from_str(r#"{"type":"request_pairing","role":"card-end"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::RequestPairing { force: false, .. }));

        assert!(sonic_rs::from_str::<ClientMessage>(r#"{"type":"launch"}"#).is_err());
    }

    #[test]
    fn server_messages_carry_snake_case_tag() {
        let json = sonic_rs::to_string(&ServerMessage::SessionTerminated {
            session_id: "pair_1".into(),
            reason: "inactive_timeout".into(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"session_terminated""#));
    }
}
