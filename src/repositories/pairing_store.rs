use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::client::Role;
use crate::models::pairing::{MatchRecord, PairingEntry};

/// Ordered waiting set of a role, score = join time in milliseconds.
pub fn pool_key(role: Role) -> String {
    format!("pairing:pool:{}", role)
}

/// Entry payloads of a role, client id → entry JSON.
pub fn entries_key(role: Role) -> String {
    format!("pairing:entries:{}", role)
}

/// Per-user pairing state: `{role}` → client id, `{role}:status`, `{role}:pair`.
pub fn state_key(user_id: &str) -> String {
    format!("pairing:state:{}", user_id)
}

pub const TIMEOUT_PREFIX: &str = "pairing:timeout:";

/// Expiry marker of one waiting entry.
pub fn timeout_key(user_id: &str, role: Role) -> String {
    format!("{}{}:{}", TIMEOUT_PREFIX, user_id, role)
}

pub const MATCHED_PREFIX: &str = "pairing:matched:";

/// Immutable match record.
pub fn matched_key(pair_id: &str) -> String {
    format!("{}{}", MATCHED_PREFIX, pair_id)
}

/// Extra lifetime of per-user state beyond the entry it describes.
pub const STATE_MARGIN: Duration = Duration::from_secs(60);

/// Lease serialising one user's join and match.
pub fn lock_key(user_id: &str) -> String {
    format!("pairing:lock:{}", user_id)
}

/// What happened to a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// `force` evicted this client's waiting entry for the same user and role.
    Replaced(String),
}

/// Result of a match attempt for a waiting entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMatch {
    Matched(MatchRecord),
    /// No same-user peer yet. Carries the number of live opposite-role entries.
    Waiting(u64),
    /// The entry is gone (cancelled, replaced or expired).
    NotWaiting,
}

/// Stored state of one user's request for one role.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreStatus {
    Idle,
    Waiting {
        entry: PairingEntry,
        /// Live opposite-role entries.
        opposite_waiting: u64,
    },
    Matched(MatchRecord),
    TimedOut {
        client_id: String,
    },
}

/// Coordination store behind the pairing pool.
///
/// Every multi-step mutation is atomic: an entry is never waiting without its
/// expiry marker and per-user state, and a match removes both entries at once.
#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Enqueues `entry`, records the per-user state and arms its expiry marker.
    ///
    /// Fails with `Conflict` when another client of the same user is already
    /// waiting for the role and `force` is not set.
    async fn join(&self, entry: &PairingEntry, timeout: Duration, force: bool) -> Result<JoinOutcome>;

    /// Scans the opposite role's queue in join order for a same-user peer.
    async fn try_match(
        &self,
        user_id: &str,
        role: Role,
        client_id: &str,
        pair_id: &str,
        record_ttl: Duration,
    ) -> Result<StoreMatch>;

    /// Removes the user's waiting entry for `role`.
    ///
    /// With `only_client` set, nothing happens unless the entry belongs to that
    /// client. Returns the removed client id.
    async fn cancel(&self, user_id: &str, role: Role, only_client: Option<&str>) -> Result<Option<String>>;

    async fn status(&self, user_id: &str, role: Role) -> Result<StoreStatus>;

    /// Drops entries whose expiry marker is gone and returns them.
    async fn sweep(&self) -> Result<Vec<PairingEntry>>;

    /// Takes the lease `key` for `holder`. Returns `false` when someone else holds it.
    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Releases the lease if `holder` still owns it.
    async fn release_lease(&self, key: &str, holder: &str) -> Result<()>;
}
