use std::time::Duration;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::client::{DeviceInfo, Role};

/// Where a user's pairing request for one role stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Idle,
    Waiting,
    Matched,
    Timeout,
    Error,
}

/// An inbound request to enter the pairing pool.
#[derive(Debug, Clone, Validate, Deserialize)]
pub struct PairingRequest {
    #[garde(length(min = 1, max = 128))]
    pub user_id: String,
    #[garde(length(min = 1, max = 128))]
    pub client_id: String,
    #[garde(length(min = 1, max = 16))]
    pub role: String,
    #[garde(skip)]
    #[serde(default)]
    pub device_info: DeviceInfo,
    /// Replace an existing waiting entry for the same user and role.
    #[garde(skip)]
    #[serde(default)]
    pub force: bool,
}

/// An item in a role's waiting queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingEntry {
    pub client_id: String,
    pub user_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub device_info: DeviceInfo,
    pub status: PairingStatus,
}

/// The immutable record written when two entries pair up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub pair_id: String,
    pub user_id: String,
    pub card_end_client: String,
    pub pos_end_client: String,
    /// Milliseconds since the unix epoch.
    pub matched_at_ms: i64,
}

impl MatchRecord {
    pub fn client_for(&self, role: Role) -> &str {
        match role {
            Role::CardEnd => &self.card_end_client,
            Role::PosEnd => &self.pos_end_client,
        }
    }
}

/// Outcome of a join or match attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Pair identifier, reused as the session id.
    pub pair_id: Option<String>,
    pub peer_client_id: Option<String>,
    pub peer_role: Option<Role>,
    pub queue_position: u64,
    #[serde(rename = "estimated_wait_secs", serialize_with = "as_secs")]
    pub estimated_wait: Duration,
}

impl MatchResult {
    /// A successful match seen from `role`.
    pub fn matched(record: &MatchRecord, role: Role) -> Self {
        let peer_role = role.opposite();
        Self {
            matched: true,
            pair_id: Some(record.pair_id.clone()),
            peer_client_id: Some(record.client_for(peer_role).to_string()),
            peer_role: Some(peer_role),
            queue_position: 0,
            estimated_wait: Duration::ZERO,
        }
    }

    /// Still waiting behind `queue_position` opposite-role entries.
    pub fn waiting(queue_position: u64, per_pair_wait: Duration) -> Self {
        Self {
            matched: false,
            pair_id: None,
            peer_client_id: None,
            peer_role: None,
            queue_position,
            estimated_wait: estimate_wait(queue_position, per_pair_wait),
        }
    }
}

/// Expected wait, linear in queue depth.
pub fn estimate_wait(queue_position: u64, per_pair_wait: Duration) -> Duration {
    per_pair_wait.saturating_mul(u32::try_from(queue_position).unwrap_or(u32::MAX))
}

/// Status of one user's request for one role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingStatusReport {
    pub user_id: String,
    pub role: Role,
    pub status: PairingStatus,
    pub client_id: Option<String>,
    pub queue_position: Option<u64>,
    #[serde(rename = "estimated_wait_secs", serialize_with = "opt_as_secs")]
    pub estimated_wait: Option<Duration>,
    pub pair_id: Option<String>,
    pub peer_client_id: Option<String>,
}

impl PairingStatusReport {
    pub fn idle(user_id: &str, role: Role) -> Self {
        Self {
            user_id: user_id.to_string(),
            role,
            status: PairingStatus::Idle,
            client_id: None,
            queue_position: None,
            estimated_wait: None,
            pair_id: None,
            peer_client_id: None,
        }
    }
}

/// Both roles of one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPairingOverview {
    pub user_id: String,
    pub card_end: PairingStatusReport,
    pub pos_end: PairingStatusReport,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

fn opt_as_secs<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}
