use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::SharedClock;
use crate::error::{AppError, Result};
use crate::models::client::Role;
use crate::models::pairing::{MatchRecord, PairingEntry, PairingStatus};
use crate::repositories::pairing_store::{
    JoinOutcome, PairingStore, StoreMatch, StoreStatus, STATE_MARGIN,
};

struct Waiting {
    entry: PairingEntry,
    expires_at: DateTime<Utc>,
}

struct RoleState {
    client_id: String,
    status: PairingStatus,
    pair_id: Option<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    /// Per role, in join order.
    queues: HashMap<Role, Vec<Waiting>>,
    states: HashMap<(String, Role), RoleState>,
    matches: HashMap<String, (MatchRecord, DateTime<Utc>)>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
}

impl Inner {
    fn queue(&mut self, role: Role) -> &mut Vec<Waiting> {
        self.queues.entry(role).or_default()
    }

    fn live_count(&self, role: Role, now: DateTime<Utc>) -> u64 {
        self.queues
            .get(&role)
            .map(|q| q.iter().filter(|w| w.expires_at > now).count() as u64)
            .unwrap_or(0)
    }

    fn state(&self, user_id: &str, role: Role, now: DateTime<Utc>) -> Option<&RoleState> {
        self.states
            .get(&(user_id.to_string(), role))
            .filter(|s| s.expires_at > now)
    }
}

/// Single-process pairing store. All mutations happen under one lock.
pub struct MemoryPairingStore {
    inner: Mutex<Inner>,
    clock: SharedClock,
}

impl MemoryPairingStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }
}

fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl PairingStore for MemoryPairingStore {
    async fn join(&self, entry: &PairingEntry, timeout: Duration, force: bool) -> Result<JoinOutcome> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let queue = inner.queue(entry.role);

        let existing = queue
            .iter()
            .position(|w| w.entry.user_id == entry.user_id && w.expires_at > now);

        let mut outcome = JoinOutcome::Joined;
        if let Some(idx) = existing {
            let holder = queue[idx].entry.client_id.clone();
            if holder != entry.client_id {
                if !force {
                    return Err(AppError::Conflict(format!(
                        "User {} is already pairing as {}",
                        entry.user_id, entry.role
                    )));
                }
                outcome = JoinOutcome::Replaced(holder);
            }
            queue.remove(idx);
        }
        // stale entries of this user would otherwise be matched after expiry
        queue.retain(|w| w.entry.user_id != entry.user_id);

        queue.push(Waiting {
            entry: entry.clone(),
            expires_at: now + span(timeout),
        });
        inner.states.insert(
            (entry.user_id.clone(), entry.role),
            RoleState {
                client_id: entry.client_id.clone(),
                status: PairingStatus::Waiting,
                pair_id: None,
                expires_at: now + span(timeout) + span(STATE_MARGIN),
            },
        );
        Ok(outcome)
    }

    async fn try_match(
        &self,
        user_id: &str,
        role: Role,
        client_id: &str,
        pair_id: &str,
        record_ttl: Duration,
    ) -> Result<StoreMatch> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        if let Some(state) = inner.state(user_id, role, now) {
            if state.status == PairingStatus::Matched && state.client_id == client_id {
                let record = state
                    .pair_id
                    .as_ref()
                    .and_then(|p| inner.matches.get(p))
                    .filter(|(_, expires_at)| *expires_at > now)
                    .map(|(record, _)| record.clone());
                if let Some(record) = record {
                    return Ok(StoreMatch::Matched(record));
                }
            }
        }

        let own = inner
            .queue(role)
            .iter()
            .position(|w| w.entry.client_id == client_id && w.expires_at > now);
        let Some(own) = own else {
            return Ok(StoreMatch::NotWaiting);
        };

        let peer = inner
            .queue(role.opposite())
            .iter()
            .position(|w| w.entry.user_id == user_id && w.expires_at > now);
        let Some(peer) = peer else {
            return Ok(StoreMatch::Waiting(inner.live_count(role.opposite(), now)));
        };

        let peer = inner.queue(role.opposite()).remove(peer);
        inner.queue(role).remove(own);

        let (card_end_client, pos_end_client) = match role {
            Role::CardEnd => (client_id.to_string(), peer.entry.client_id.clone()),
            Role::PosEnd => (peer.entry.client_id.clone(), client_id.to_string()),
        };
        let record = MatchRecord {
            pair_id: pair_id.to_string(),
            user_id: user_id.to_string(),
            card_end_client,
            pos_end_client,
            matched_at_ms: now.timestamp_millis(),
        };
        let expires_at = now + span(record_ttl);
        inner
            .matches
            .insert(pair_id.to_string(), (record.clone(), expires_at));
        for r in Role::ALL {
            inner.states.insert(
                (user_id.to_string(), r),
                RoleState {
                    client_id: record.client_for(r).to_string(),
                    status: PairingStatus::Matched,
                    pair_id: Some(pair_id.to_string()),
                    expires_at,
                },
            );
        }
        Ok(StoreMatch::Matched(record))
    }

    async fn cancel(&self, user_id: &str, role: Role, only_client: Option<&str>) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let key = (user_id.to_string(), role);

        let Some(state) = inner.states.get(&key) else {
            return Ok(None);
        };
        if only_client.is_some_and(|c| c != state.client_id) {
            return Ok(None);
        }
        let client_id = state.client_id.clone();
        let was_waiting = state.status == PairingStatus::Waiting && state.expires_at > now;
        inner.states.remove(&key);

        let queue = inner.queue(role);
        let before = queue.len();
        queue.retain(|w| w.entry.client_id != client_id);
        let removed = queue.len() < before;

        Ok((was_waiting && removed).then_some(client_id))
    }

    async fn status(&self, user_id: &str, role: Role) -> Result<StoreStatus> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        let Some(state) = inner.state(user_id, role, now) else {
            return Ok(StoreStatus::Idle);
        };

        let status = match state.status {
            PairingStatus::Waiting => {
                let waiting = inner
                    .queues
                    .get(&role)
                    .and_then(|q| q.iter().find(|w| w.entry.client_id == state.client_id));
                match waiting {
                    Some(w) if w.expires_at > now => StoreStatus::Waiting {
                        entry: w.entry.clone(),
                        opposite_waiting: inner.live_count(role.opposite(), now),
                    },
                    _ => StoreStatus::TimedOut {
                        client_id: state.client_id.clone(),
                    },
                }
            }
            PairingStatus::Matched => state
                .pair_id
                .as_ref()
                .and_then(|p| inner.matches.get(p))
                .filter(|(_, expires_at)| *expires_at > now)
                .map(|(record, _)| StoreStatus::Matched(record.clone()))
                .unwrap_or(StoreStatus::Idle),
            PairingStatus::Timeout => StoreStatus::TimedOut {
                client_id: state.client_id.clone(),
            },
            PairingStatus::Idle | PairingStatus::Error => StoreStatus::Idle,
        };
        Ok(status)
    }

    async fn sweep(&self) -> Result<Vec<PairingEntry>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();

        for role in Role::ALL {
            let queue = inner.queue(role);
            let mut i = 0;
            while i < queue.len() {
                if queue[i].expires_at <= now {
                    expired.push(queue.remove(i).entry);
                } else {
                    i += 1;
                }
            }
        }

        for entry in &expired {
            if let Some(state) = inner.states.get_mut(&(entry.user_id.clone(), entry.role)) {
                if state.client_id == entry.client_id && state.status == PairingStatus::Waiting {
                    state.status = PairingStatus::Timeout;
                    state.expires_at = now + span(STATE_MARGIN);
                }
            }
        }

        inner.matches.retain(|_, (_, expires_at)| *expires_at > now);
        inner.states.retain(|_, s| s.expires_at > now);
        inner.leases.retain(|_, (_, expires_at)| *expires_at > now);

        Ok(expired)
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        if let Some((current, expires_at)) = inner.leases.get(key) {
            if *expires_at > now && current != holder {
                return Ok(false);
            }
        }
        inner
            .leases
            .insert(key.to_string(), (holder.to_string(), now + span(ttl)));
        Ok(true)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.leases.get(key).is_some_and(|(current, _)| current == holder) {
            inner.leases.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::models::client::DeviceInfo;
    use std::sync::Arc;

    fn entry(user: &str, client: &str, role: Role, at: DateTime<Utc>) -> PairingEntry {
        PairingEntry {
            client_id: client.into(),
            user_id: user.into(),
            role,
            joined_at: at,
            device_info: DeviceInfo::new(),
            status: PairingStatus::Waiting,
        }
    }

    #[tokio::test]
    async fn expired_leases_can_be_taken_over() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryPairingStore::new(clock.clone());
        let ttl = Duration::from_secs(10);

        assert!(store.acquire_lease("lock", "a", ttl).await.unwrap());
        assert!(!store.acquire_lease("lock", "b", ttl).await.unwrap());
        clock.advance(chrono::Duration::seconds(11));
        assert!(store.acquire_lease("lock", "b", ttl).await.unwrap());

        // a's release must not drop b's lease
        store.release_lease("lock", "a").await.unwrap();
        assert!(!store.acquire_lease("lock", "c", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_marks_timed_out_entries() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryPairingStore::new(clock.clone());
        let now = clock.now();

        store
            .join(&entry("alice", "c1", Role::CardEnd, now), Duration::from_secs(180), false)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(181));

        let expired = store.sweep().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(
            store.status("alice", Role::CardEnd).await.unwrap(),
            StoreStatus::TimedOut { client_id: "c1".into() }
        );
    }
}
