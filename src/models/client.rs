use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Free-form device metadata reported by a client (model, os, app version...).
pub type DeviceInfo = BTreeMap<String, String>;

/// The side of the relay a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Holds or emulates the card.
    CardEnd,
    /// Reads the card (point of sale / reader).
    PosEnd,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::CardEnd, Role::PosEnd];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::CardEnd => "card-end",
            Role::PosEnd => "pos-end",
        }
    }

    /// The role a peer must have to pair with this one.
    pub fn opposite(self) -> Role {
        match self {
            Role::CardEnd => Role::PosEnd,
            Role::PosEnd => Role::CardEnd,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card-end" => Ok(Role::CardEnd),
            "pos-end" => Ok(Role::PosEnd),
            other => Err(AppError::Validation(format!(
                "Invalid role '{}', expected card-end or pos-end",
                other
            ))),
        }
    }
}

/// Identity accessors shared by live clients and session participants.
pub trait ClientInfo {
    fn client_id(&self) -> &str;
    fn user_id(&self) -> &str;
    fn role(&self) -> Option<Role>;
}

/// A live connection, owned by the hub.
#[derive(Debug, Clone, Serialize)]
pub struct Client {
    pub client_id: String,
    pub user_id: String,
    pub display_name: String,
    pub role: Option<Role>,
    pub online: bool,
    pub remote_addr: Option<String>,
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub device_info: DeviceInfo,
    pub connected_at: DateTime<Utc>,
}

impl Client {
    /// Creates a new online `Client` with no role yet.
    pub fn new(
        client_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        remote_addr: Option<String>,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            role: None,
            online: true,
            remote_addr,
            session_id: None,
            device_info: DeviceInfo::new(),
            connected_at,
        }
    }
}

impl ClientInfo for Client {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn role(&self) -> Option<Role> {
        self.role
    }
}

/// One side of a session. The variant is the role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "kebab-case")]
pub enum Participant {
    CardEnd { client_id: String, user_id: String },
    PosEnd { client_id: String, user_id: String },
}

impl Participant {
    pub fn new(role: Role, client_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let (client_id, user_id) = (client_id.into(), user_id.into());
        match role {
            Role::CardEnd => Participant::CardEnd { client_id, user_id },
            Role::PosEnd => Participant::PosEnd { client_id, user_id },
        }
    }

    pub fn participant_role(&self) -> Role {
        match self {
            Participant::CardEnd { .. } => Role::CardEnd,
            Participant::PosEnd { .. } => Role::PosEnd,
        }
    }
}

impl ClientInfo for Participant {
    fn client_id(&self) -> &str {
        match self {
            Participant::CardEnd { client_id, .. } | Participant::PosEnd { client_id, .. } => {
                client_id
            }
        }
    }

    fn user_id(&self) -> &str {
        match self {
            Participant::CardEnd { user_id, .. } | Participant::PosEnd { user_id, .. } => user_id,
        }
    }

    fn role(&self) -> Option<Role> {
        Some(self.participant_role())
    }
}
