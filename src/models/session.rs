use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::client::{ClientInfo, Participant, Role};

/// Lifecycle of a relay session. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Terminated,
}

/// Which way a frame travels inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApduDirection {
    /// POS-end to card-end.
    Command,
    /// Card-end to POS-end.
    Response,
}

impl ApduDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ApduDirection::Command => "command",
            ApduDirection::Response => "response",
        }
    }
}

/// Who ended a session, why and when.
#[derive(Debug, Clone, Serialize)]
pub struct Termination {
    pub reason: String,
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// A paired relay channel between one card-end and one POS-end client.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub card_end: Participant,
    pub pos_end: Participant,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Commands relayed toward the card.
    pub upstream_count: u64,
    /// Responses relayed toward the POS.
    pub downstream_count: u64,
    /// Set when a frame was dropped for compliance or crypto reasons.
    pub flagged: Option<String>,
    pub termination: Option<Termination>,
    #[serde(skip)]
    next_sequence: u64,
}

impl Session {
    /// Creates a new `Session` in the `Created` state.
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        card_end_client: impl Into<String>,
        pos_end_client: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            session_id: session_id.into(),
            card_end: Participant::new(Role::CardEnd, card_end_client, user_id.clone()),
            pos_end: Participant::new(Role::PosEnd, pos_end_client, user_id.clone()),
            user_id,
            state: SessionState::Created,
            created_at: now,
            last_activity: now,
            upstream_count: 0,
            downstream_count: 0,
            flagged: None,
            termination: None,
            next_sequence: 0,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    pub fn participant(&self, client_id: &str) -> Option<&Participant> {
        [&self.card_end, &self.pos_end]
            .into_iter()
            .find(|p| p.client_id() == client_id)
    }

    /// The other side of `client_id`, if it takes part in this session.
    pub fn peer_of(&self, client_id: &str) -> Option<&Participant> {
        if self.card_end.client_id() == client_id {
            Some(&self.pos_end)
        } else if self.pos_end.client_id() == client_id {
            Some(&self.card_end)
        } else {
            None
        }
    }

    /// Direction of a frame sent by `client_id`.
    pub fn direction_from(&self, client_id: &str) -> Option<ApduDirection> {
        self.participant(client_id)
            .map(|p| match p.participant_role() {
                Role::PosEnd => ApduDirection::Command,
                Role::CardEnd => ApduDirection::Response,
            })
    }

    /// Allocates the next frame sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Counts a delivered frame and moves `Created` to `Active`.
    pub fn record_relay(&mut self, direction: ApduDirection, now: DateTime<Utc>) {
        match direction {
            ApduDirection::Command => self.upstream_count += 1,
            ApduDirection::Response => self.downstream_count += 1,
        }
        self.last_activity = now;
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
    }

    pub fn flag(&mut self, reason: impl Into<String>) {
        self.flagged = Some(reason.into());
    }

    /// Terminates the session. Returns `false` if it already was.
    pub fn terminate(
        &mut self,
        reason: impl Into<String>,
        actor: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.state = SessionState::Terminated;
        self.termination = Some(Termination {
            reason: reason.into(),
            actor: actor.into(),
            at: now,
        });
        true
    }
}
