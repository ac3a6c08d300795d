use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::PairingConfig;
use crate::error::{AppError, Result};
use crate::models::audit::{
    AuditRecord, EVENT_PAIRING_CANCELLED, EVENT_PAIRING_MATCHED, EVENT_PAIRING_TIMEOUT,
};
use crate::models::client::Role;
use crate::models::pairing::*;
use crate::repositories::pairing_store::{
    lock_key, JoinOutcome, PairingStore, StoreMatch, StoreStatus,
};
use crate::services::audit::AuditRecorder;
use crate::services::notifier::{
    session_topic, NotificationStatus, PairingNotification, PairingNotifier,
};
use crate::validation::pairing::validate_pairing_request;

/// What a join did.
#[derive(Debug, Clone)]
pub struct PairingOutcome {
    pub role: Role,
    pub result: MatchResult,
    /// Client whose waiting entry a forced join evicted.
    pub replaced: Option<String>,
}

/// Matchmaking between card-end and POS-end connections of the same user.
pub struct PairingPool {
    store: Arc<dyn PairingStore>,
    notifier: Arc<dyn PairingNotifier>,
    audit: AuditRecorder,
    config: PairingConfig,
    clock: SharedClock,
}

impl PairingPool {
    /// Creates a new `PairingPool`.
    ///
    /// # Arguments
    ///
    /// * `store` - The coordination store holding queues and per-user state.
    /// * `notifier` - Out-of-band pairing signalling.
    /// * `audit` - Receives pairing audit records.
    /// * `config` - Timeouts and retry tuning.
    /// * `clock` - Join timestamps.
    pub fn new(
        store: Arc<dyn PairingStore>,
        notifier: Arc<dyn PairingNotifier>,
        audit: AuditRecorder,
        config: PairingConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            notifier,
            audit,
            config,
            clock,
        }
    }

    /// Enqueues a client and immediately tries to match it.
    ///
    /// # Arguments
    ///
    /// * `request` - Who joins, for which role, with `force` to replace an
    ///   existing waiting entry of the same user and role.
    ///
    /// # Returns
    ///
    /// The match result. Invalid requests fail without touching the store.
    pub async fn join(&self, request: &PairingRequest) -> Result<PairingOutcome> {
        let role = validate_pairing_request(request)?;

        let lease = lock_key(&request.user_id);
        let holder = format!("{}:{}", request.client_id, Uuid::new_v4().simple());
        self.acquire_lease(&lease, &holder).await?;

        let outcome = self.join_leased(request, role).await;

        if let Err(e) = self
            .bounded("release_lease", self.store.release_lease(&lease, &holder))
            .await
        {
            // the lease TTL frees it anyway
            tracing::warn!(user_id = %request.user_id, "⚠️ Failed to release pairing lease: {}", e);
        }
        outcome
    }

    async fn join_leased(&self, request: &PairingRequest, role: Role) -> Result<PairingOutcome> {
        let entry = PairingEntry {
            client_id: request.client_id.clone(),
            user_id: request.user_id.clone(),
            role,
            joined_at: self.clock.now(),
            device_info: request.device_info.clone(),
            status: PairingStatus::Waiting,
        };

        let joined = self
            .bounded("join", self.store.join(&entry, self.config.timeout, request.force))
            .await?;

        let replaced = match joined {
            JoinOutcome::Joined => None,
            JoinOutcome::Replaced(previous) => {
                tracing::info!(
                    user_id = %request.user_id,
                    role = %role,
                    previous = %previous,
                    client_id = %request.client_id,
                    "🔁 Waiting entry replaced by forced join"
                );
                self.announce_cancelled(&request.user_id, role, &previous, "replaced")
                    .await;
                Some(previous)
            }
        };

        tracing::info!(
            user_id = %request.user_id,
            role = %role,
            client_id = %request.client_id,
            "⏳ Client joined pairing pool"
        );

        let result = self
            .find_peer_and_match(&request.user_id, role, &request.client_id)
            .await?;

        Ok(PairingOutcome {
            role,
            result,
            replaced,
        })
    }

    /// Looks for a same-user peer of the opposite role, oldest first.
    ///
    /// # Arguments
    ///
    /// * `user_id` - Owner of the waiting entry.
    /// * `role` - Role of the waiting entry.
    /// * `client_id` - The waiting client.
    ///
    /// # Returns
    ///
    /// `matched` with the pair id and peer, or the queue position and expected wait.
    pub async fn find_peer_and_match(
        &self,
        user_id: &str,
        role: Role,
        client_id: &str,
    ) -> Result<MatchResult> {
        let pair_id = format!("pair_{}", Uuid::new_v4().simple());
        let found = self
            .bounded(
                "match",
                self.store
                    .try_match(user_id, role, client_id, &pair_id, self.config.match_record_ttl),
            )
            .await?;

        match found {
            StoreMatch::Matched(record) => {
                // a replayed match returns the record created earlier
                if record.pair_id == pair_id {
                    self.announce_match(&record).await;
                }
                Ok(MatchResult::matched(&record, role))
            }
            StoreMatch::Waiting(queue_position) => {
                Ok(MatchResult::waiting(queue_position, self.config.per_pair_wait))
            }
            StoreMatch::NotWaiting => Err(AppError::NotFound(format!(
                "No waiting pairing request for client {}",
                client_id
            ))),
        }
    }

    /// Removes the user's waiting entry for `role`. Idempotent.
    ///
    /// # Returns
    ///
    /// Whether an entry was removed.
    pub async fn cancel_pairing(&self, user_id: &str, role: Role) -> Result<bool> {
        let removed = self
            .bounded("cancel", self.store.cancel(user_id, role, None))
            .await?;
        match removed {
            Some(client_id) => {
                self.announce_cancelled(user_id, role, &client_id, "cancelled")
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Leaves the pool for one role, or for both when `role` is `None`.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub async fn leave_pairing_pool(&self, user_id: &str, role: Option<Role>) -> Result<usize> {
        let roles = match role {
            Some(role) => vec![role],
            None => Role::ALL.to_vec(),
        };
        let mut removed = 0;
        for role in roles {
            if self.cancel_pairing(user_id, role).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Cancels the waiting entry only if it still belongs to `client_id`.
    pub async fn release_client(&self, user_id: &str, role: Role, client_id: &str) -> Result<bool> {
        let removed = self
            .bounded("release", self.store.cancel(user_id, role, Some(client_id)))
            .await?;
        if removed.is_some() {
            self.announce_cancelled(user_id, role, client_id, "disconnected")
                .await;
        }
        Ok(removed.is_some())
    }

    /// Status of one user's request for one role.
    ///
    /// Store reads are retried with backoff on transient failures.
    pub async fn get_user_pairing_status(&self, user_id: &str, role: Role) -> Result<PairingStatusReport> {
        let attempts = self.config.status_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.bounded("status", self.store.status(user_id, role)).await {
                Ok(status) => return Ok(self.report(user_id, role, status)),
                Err(e) if is_transient(&e) && attempt < attempts => {
                    tracing::warn!(
                        user_id,
                        role = %role,
                        attempt,
                        "⚠️ Pairing status read failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(100 << (attempt - 1))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Status of both roles of a user. A role whose status cannot be read reports `error`.
    pub async fn get_pairing_status(&self, user_id: &str) -> UserPairingOverview {
        let mut reports = Vec::with_capacity(2);
        for role in Role::ALL {
            let report = match self.get_user_pairing_status(user_id, role).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(user_id, role = %role, "❌ Pairing status unavailable: {}", e);
                    PairingStatusReport {
                        status: PairingStatus::Error,
                        ..PairingStatusReport::idle(user_id, role)
                    }
                }
            };
            reports.push(report);
        }
        let pos_end = reports.pop().unwrap_or_else(|| PairingStatusReport::idle(user_id, Role::PosEnd));
        let card_end = reports.pop().unwrap_or_else(|| PairingStatusReport::idle(user_id, Role::CardEnd));
        UserPairingOverview {
            user_id: user_id.to_string(),
            card_end,
            pos_end,
        }
    }

    /// Expires waiting entries past the pairing timeout.
    ///
    /// # Returns
    ///
    /// The expired entries, each already notified as `timeout`.
    pub async fn sweep_expired(&self) -> Result<Vec<PairingEntry>> {
        let expired = self.bounded("sweep", self.store.sweep()).await?;
        for entry in &expired {
            tracing::info!(
                user_id = %entry.user_id,
                role = %entry.role,
                client_id = %entry.client_id,
                "⌛ Pairing request timed out"
            );
            self.notify(PairingNotification {
                target_client_id: entry.client_id.clone(),
                status: NotificationStatus::Timeout,
                user_id: entry.user_id.clone(),
                role: entry.role,
                peer_client_id: None,
                peer_role: None,
                session_id: None,
                session_topic: None,
                timestamp: self.clock.now().timestamp(),
            })
            .await;
            self.audit.record(
                AuditRecord::new(EVENT_PAIRING_TIMEOUT, "timeout", self.clock.now())
                    .clients([entry.client_id.as_str()])
                    .user(entry.user_id.as_str())
                    .details(sonic_rs::json!({ "role": entry.role.as_str() })),
            );
        }
        Ok(expired)
    }

    fn report(&self, user_id: &str, role: Role, status: StoreStatus) -> PairingStatusReport {
        let idle = PairingStatusReport::idle(user_id, role);
        match status {
            StoreStatus::Idle => idle,
            StoreStatus::Waiting {
                entry,
                opposite_waiting,
            } => PairingStatusReport {
                status: PairingStatus::Waiting,
                client_id: Some(entry.client_id),
                queue_position: Some(opposite_waiting),
                estimated_wait: Some(estimate_wait(opposite_waiting, self.config.per_pair_wait)),
                ..idle
            },
            StoreStatus::Matched(record) => PairingStatusReport {
                status: PairingStatus::Matched,
                client_id: Some(record.client_for(role).to_string()),
                peer_client_id: Some(record.client_for(role.opposite()).to_string()),
                pair_id: Some(record.pair_id),
                ..idle
            },
            StoreStatus::TimedOut { client_id } => PairingStatusReport {
                status: PairingStatus::Timeout,
                client_id: Some(client_id),
                ..idle
            },
        }
    }

    async fn acquire_lease(&self, key: &str, holder: &str) -> Result<()> {
        let attempts = self.config.lease_attempts.max(1);
        for attempt in 1..=attempts {
            let acquired = self
                .bounded(
                    "acquire_lease",
                    self.store.acquire_lease(key, holder, self.config.lease_ttl),
                )
                .await?;
            if acquired {
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
        }
        Err(AppError::Conflict(
            "Another pairing request for this user is in progress".to_string(),
        ))
    }

    async fn announce_match(&self, record: &MatchRecord) {
        let topic = session_topic(&record.pair_id);
        tracing::info!(
            pair_id = %record.pair_id,
            user_id = %record.user_id,
            card_end = %record.card_end_client,
            pos_end = %record.pos_end_client,
            "🤝 Pairing matched"
        );

        for role in Role::ALL {
            let peer_role = role.opposite();
            self.notify(PairingNotification {
                target_client_id: record.client_for(role).to_string(),
                status: NotificationStatus::Success,
                user_id: record.user_id.clone(),
                role,
                peer_client_id: Some(record.client_for(peer_role).to_string()),
                peer_role: Some(peer_role),
                session_id: Some(record.pair_id.clone()),
                session_topic: Some(topic.clone()),
                timestamp: record.matched_at_ms / 1000,
            })
            .await;
        }
        if let Err(e) = self
            .bounded(
                "publish_topic",
                self.notifier.publish_session_topic(&record.pair_id, &topic),
            )
            .await
        {
            tracing::warn!(pair_id = %record.pair_id, "⚠️ Failed to announce session topic: {}", e);
        }

        self.audit.record(
            AuditRecord::new(EVENT_PAIRING_MATCHED, "success", self.clock.now())
                .session(record.pair_id.as_str())
                .clients([record.card_end_client.as_str(), record.pos_end_client.as_str()])
                .user(record.user_id.as_str())
                .details(sonic_rs::json!({ "topic": topic.as_str() })),
        );
    }

    async fn announce_cancelled(&self, user_id: &str, role: Role, client_id: &str, why: &str) {
        tracing::info!(user_id, role = %role, client_id, why, "🚫 Pairing request cancelled");
        self.notify(PairingNotification {
            target_client_id: client_id.to_string(),
            status: NotificationStatus::Cancelled,
            user_id: user_id.to_string(),
            role,
            peer_client_id: None,
            peer_role: None,
            session_id: None,
            session_topic: None,
            timestamp: self.clock.now().timestamp(),
        })
        .await;
        self.audit.record(
            AuditRecord::new(EVENT_PAIRING_CANCELLED, why, self.clock.now())
                .clients([client_id])
                .user(user_id)
                .details(sonic_rs::json!({ "role": role.as_str() })),
        );
    }

    async fn notify(&self, notification: PairingNotification) {
        if let Err(e) = self
            .bounded("notify", self.notifier.publish_pairing_result(&notification))
            .await
        {
            tracing::warn!(
                target_client_id = %notification.target_client_id,
                "⚠️ Failed to publish pairing notification: {}",
                e
            );
        }
    }

    /// Bounds one store or notifier round-trip by the configured timeout.
    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.store_timeout, fut)
            .await
            .map_err(|_| AppError::Network(format!("Pairing {} timed out", op)))?
    }
}

fn is_transient(error: &AppError) -> bool {
    matches!(error, AppError::Network(_) | AppError::Redis(_))
}
