use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::client::Role;

/// Outcome a pairing notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Success,
    Cancelled,
    Timeout,
}

/// Out-of-band pairing message for one client.
#[derive(Debug, Clone, Serialize)]
pub struct PairingNotification {
    pub target_client_id: String,
    pub status: NotificationStatus,
    pub user_id: String,
    pub role: Role,
    pub peer_client_id: Option<String>,
    pub peer_role: Option<Role>,
    pub session_id: Option<String>,
    pub session_topic: Option<String>,
    pub timestamp: i64,
}

/// Channel a client listens on for its pairing results.
pub fn notify_channel(client_id: &str) -> String {
    format!("pairing:notify:{}", client_id)
}

/// Topic carrying a session's out-of-band data.
pub fn session_topic(session_id: &str) -> String {
    format!("relay/session/{}/data", session_id)
}

/// Channel announcing newly opened session topics.
pub const SESSION_ANNOUNCE_CHANNEL: &str = "relay:sessions";

/// Messaging collaborator for pairing signalling.
#[async_trait]
pub trait PairingNotifier: Send + Sync {
    async fn publish_pairing_result(&self, notification: &PairingNotification) -> Result<()>;

    async fn publish_session_topic(&self, session_id: &str, topic: &str) -> Result<()>;
}

/// Publishes notifications with Redis `PUBLISH`.
#[derive(Clone)]
pub struct RedisNotifier {
    redis: ConnectionManager,
}

impl RedisNotifier {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl PairingNotifier for RedisNotifier {
    async fn publish_pairing_result(&self, notification: &PairingNotification) -> Result<()> {
        let payload = sonic_rs::to_string(notification)?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(notify_channel(&notification.target_client_id))
            .arg(payload)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    async fn publish_session_topic(&self, session_id: &str, topic: &str) -> Result<()> {
        let payload = sonic_rs::to_string(&sonic_rs::json!({
            "session_id": session_id,
            "topic": topic,
        }))?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(SESSION_ANNOUNCE_CHANNEL)
            .arg(payload)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(())
    }
}

/// Logs notifications instead of publishing them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl PairingNotifier for LogNotifier {
    async fn publish_pairing_result(&self, notification: &PairingNotification) -> Result<()> {
        tracing::debug!(
            target_client_id = %notification.target_client_id,
            status = ?notification.status,
            session_id = notification.session_id.as_deref().unwrap_or("-"),
            "📣 Pairing notification"
        );
        Ok(())
    }

    async fn publish_session_topic(&self, session_id: &str, topic: &str) -> Result<()> {
        tracing::debug!(session_id, topic, "📣 Session topic announced");
        Ok(())
    }
}

/// Keeps notifications in memory for inspection.
#[derive(Debug, Default, Clone)]
pub struct MemoryNotifier {
    notifications: Arc<Mutex<Vec<PairingNotification>>>,
    topics: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifications(&self) -> Vec<PairingNotification> {
        self.notifications.lock().await.clone()
    }

    pub async fn topics(&self) -> Vec<(String, String)> {
        self.topics.lock().await.clone()
    }
}

#[async_trait]
impl PairingNotifier for MemoryNotifier {
    async fn publish_pairing_result(&self, notification: &PairingNotification) -> Result<()> {
        self.notifications.lock().await.push(notification.clone());
        Ok(())
    }

    async fn publish_session_topic(&self, session_id: &str, topic: &str) -> Result<()> {
        self.topics
            .lock()
            .await
            .push((session_id.to_string(), topic.to_string()));
        Ok(())
    }
}
