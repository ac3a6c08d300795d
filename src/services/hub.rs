//! The connection hub: a single actor owning every live client and session.
//!
//! All mutations of the client and session maps happen on the actor task.
//! Connection tasks talk to it through [`HubHandle`], and run the slow parts
//! of a relay (encryption, compliance, pairing store round-trips) on their
//! own task so one connection never stalls the others.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::HubConfig;
use crate::crypto::hybrid::HybridEncryptionManager;
use crate::crypto::session_keys::KeyExchangeManager;
use crate::error::{AppError, Result};
use crate::models::audit::*;
use crate::models::client::{Client, ClientInfo, DeviceInfo, Role};
use crate::models::compliance::RiskLevel;
use crate::models::envelope::FrameContext;
use crate::models::pairing::{
    MatchRecord, MatchResult, PairingRequest, PairingStatus, PairingStatusReport,
};
use crate::models::protocol::ServerMessage;
use crate::models::session::{ApduDirection, Session};
use crate::services::audit::AuditRecorder;
use crate::services::compliance::ComplianceAuditEngine;
use crate::services::pairing::PairingPool;
use crate::validation::pairing::{validate_identifier, validate_pairing_request};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    ClientRequest,
    ClientDisconnect,
    InactiveTimeout,
    PeerUnreachable,
    Admin,
    ComplianceViolation,
}

impl TerminationCause {
    pub fn reason(self) -> &'static str {
        match self {
            TerminationCause::ClientRequest => "client_request",
            TerminationCause::ClientDisconnect => "client_disconnect",
            TerminationCause::InactiveTimeout => "inactive_timeout",
            TerminationCause::PeerUnreachable => "peer_unreachable",
            TerminationCause::Admin => "admin",
            TerminationCause::ComplianceViolation => "compliance_violation",
        }
    }

    fn audit_event(self) -> &'static str {
        match self {
            TerminationCause::ClientRequest => EVENT_TERMINATED_BY_REQUEST,
            TerminationCause::ClientDisconnect => EVENT_TERMINATED_BY_DISCONNECT,
            TerminationCause::InactiveTimeout => EVENT_TERMINATED_BY_TIMEOUT,
            TerminationCause::PeerUnreachable => EVENT_TERMINATED_BY_APDU_ERROR,
            TerminationCause::Admin => EVENT_TERMINATED_BY_ADMIN,
            TerminationCause::ComplianceViolation => EVENT_TERMINATED_BY_COMPLIANCE,
        }
    }
}

/// Result of an administrative termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminTermination {
    Terminated,
    /// The session had already ended. Nothing changed.
    AlreadyTerminated,
}

/// A registered connection as seen by its transport task.
pub struct Connection {
    pub client: Client,
    /// Queue toward the socket writer. Direct replies go here too.
    pub sender: mpsc::Sender<ServerMessage>,
    pub receiver: mpsc::Receiver<ServerMessage>,
    /// Cancelled when the hub force-closes the connection or shuts down.
    pub closed: CancellationToken,
}

/// Everything a connection task needs to process one frame off the actor.
#[derive(Debug, Clone)]
pub struct RelayTicket {
    pub session_id: String,
    pub user_id: String,
    pub from_client_id: String,
    pub direction: ApduDirection,
    pub sequence: u64,
    pub device_info: DeviceInfo,
}

type Reply<T> = oneshot::Sender<T>;

enum HubCommand {
    Register {
        client: Client,
        reply: Reply<Result<Connection>>,
    },
    Unregister {
        client_id: String,
        reply: Reply<Option<Client>>,
    },
    AssignRole {
        client_id: String,
        role: Role,
        device_info: DeviceInfo,
        reply: Reply<Result<Option<Role>>>,
    },
    PairingEnded {
        client_id: String,
        role: Role,
        message: Option<ServerMessage>,
    },
    Paired {
        record: MatchRecord,
        requester: String,
        reply: Reply<Result<()>>,
    },
    PrepareRelay {
        session_id: String,
        from_client_id: String,
        reply: Reply<Result<RelayTicket>>,
    },
    CompleteRelay {
        ticket: RelayTicket,
        apdu: Vec<u8>,
        reply: Reply<Result<()>>,
    },
    RelayFailed {
        ticket: RelayTicket,
        reason: String,
        terminate: bool,
        reply: Reply<()>,
    },
    EndSession {
        session_id: String,
        client_id: String,
        reply: Reply<Result<()>>,
    },
    TerminateByAdmin {
        session_id: String,
        reason: String,
        actor: String,
        reply: Reply<Result<AdminTermination>>,
    },
    DisconnectClient {
        client_id: String,
        reason: String,
        reply: Reply<Result<Client>>,
    },
    Clients {
        reply: Reply<Vec<Client>>,
    },
    Sessions {
        reply: Reply<Vec<Session>>,
    },
    FindClient {
        client_id: String,
        reply: Reply<Option<Client>>,
    },
    GetSession {
        session_id: String,
        reply: Reply<Option<Session>>,
    },
    Sweep {
        reply: Reply<usize>,
    },
}

struct ClientSlot {
    client: Client,
    outbound: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
}

/// The actor state. Only ever touched by the actor task.
pub struct ConnectionHub {
    clients: HashMap<String, ClientSlot>,
    sessions: HashMap<String, Session>,
    keys: Arc<KeyExchangeManager>,
    compliance: Arc<ComplianceAuditEngine>,
    audit: AuditRecorder,
    config: HubConfig,
    clock: SharedClock,
    shutdown_token: CancellationToken,
}

/// Services the hub and its handle are wired to.
pub struct HubServices {
    pub pairing: Arc<PairingPool>,
    pub hybrid: Arc<HybridEncryptionManager>,
    pub keys: Arc<KeyExchangeManager>,
    pub compliance: Arc<ComplianceAuditEngine>,
    pub audit: AuditRecorder,
    pub clock: SharedClock,
}

impl ConnectionHub {
    /// Spawns the hub actor.
    ///
    /// # Arguments
    ///
    /// * `config` - Queue depths and session timeouts.
    /// * `services` - Pairing, crypto, compliance and audit collaborators.
    /// * `shutdown_token` - Stops the actor and closes every connection.
    ///
    /// # Returns
    ///
    /// The handle used by connection tasks and administrative callers.
    pub fn spawn(config: HubConfig, services: HubServices, shutdown_token: CancellationToken) -> HubHandle {
        let (tx, rx) = mpsc::channel(config.command_queue.max(1));

        let hub = ConnectionHub {
            clients: HashMap::new(),
            sessions: HashMap::new(),
            keys: services.keys.clone(),
            compliance: services.compliance,
            audit: services.audit,
            config,
            clock: services.clock.clone(),
            shutdown_token,
        };
        tokio::spawn(hub.run(rx));

        HubHandle {
            tx,
            pairing: services.pairing,
            hybrid: services.hybrid,
            keys: services.keys,
            clock: services.clock,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        tracing::info!("✅ Connection hub started");
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!(
                        clients = self.clients.len(),
                        sessions = self.sessions.len(),
                        "🛑 Shutdown signal received, stopping connection hub"
                    );
                    break;
                }
            }
        }
        for slot in self.clients.values() {
            slot.closed.cancel();
        }
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { client, reply } => {
                let _ = reply.send(self.register(client));
            }
            HubCommand::Unregister { client_id, reply } => {
                let _ = reply.send(self.unregister(&client_id).await);
            }
            HubCommand::AssignRole {
                client_id,
                role,
                device_info,
                reply,
            } => {
                let _ = reply.send(self.assign_role(&client_id, role, device_info));
            }
            HubCommand::PairingEnded {
                client_id,
                role,
                message,
            } => self.pairing_ended(&client_id, role, message),
            HubCommand::Paired {
                record,
                requester,
                reply,
            } => {
                let _ = reply.send(self.open_session(record, &requester));
            }
            HubCommand::PrepareRelay {
                session_id,
                from_client_id,
                reply,
            } => {
                let _ = reply.send(self.prepare_relay(&session_id, &from_client_id));
            }
            HubCommand::CompleteRelay {
                ticket,
                apdu,
                reply,
            } => {
                let _ = reply.send(self.complete_relay(ticket, apdu).await);
            }
            HubCommand::RelayFailed {
                ticket,
                reason,
                terminate,
                reply,
            } => {
                self.relay_failed(&ticket, &reason, terminate).await;
                let _ = reply.send(());
            }
            HubCommand::EndSession {
                session_id,
                client_id,
                reply,
            } => {
                let _ = reply.send(self.end_session(&session_id, &client_id).await);
            }
            HubCommand::TerminateByAdmin {
                session_id,
                reason,
                actor,
                reply,
            } => {
                let _ = reply.send(self.terminate_by_admin(&session_id, &reason, &actor).await);
            }
            HubCommand::DisconnectClient {
                client_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.disconnect_client(&client_id, &reason).await);
            }
            HubCommand::Clients { reply } => {
                let mut clients: Vec<Client> =
                    self.clients.values().map(|s| s.client.clone()).collect();
                clients.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
                let _ = reply.send(clients);
            }
            HubCommand::Sessions { reply } => {
                let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
                sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                let _ = reply.send(sessions);
            }
            HubCommand::FindClient { client_id, reply } => {
                let _ = reply.send(self.clients.get(&client_id).map(|s| s.client.clone()));
            }
            HubCommand::GetSession { session_id, reply } => {
                let _ = reply.send(self.sessions.get(&session_id).cloned());
            }
            HubCommand::Sweep { reply } => {
                let _ = reply.send(self.sweep().await);
            }
        }
    }

    fn register(&mut self, client: Client) -> Result<Connection> {
        if self.clients.contains_key(&client.client_id) {
            return Err(AppError::Conflict(format!(
                "Client {} is already connected",
                client.client_id
            )));
        }

        let (sender, receiver) = mpsc::channel(self.config.outbound_queue.max(1));
        let closed = self.shutdown_token.child_token();
        let _ = sender.try_send(ServerMessage::Connected {
            client_id: client.client_id.clone(),
        });

        tracing::info!(
            client_id = %client.client_id,
            user_id = %client.user_id,
            remote_addr = client.remote_addr.as_deref().unwrap_or("-"),
            "🔌 Client registered"
        );
        self.clients.insert(
            client.client_id.clone(),
            ClientSlot {
                client: client.clone(),
                outbound: sender.clone(),
                closed: closed.clone(),
            },
        );

        Ok(Connection {
            client,
            sender,
            receiver,
            closed,
        })
    }

    async fn unregister(&mut self, client_id: &str) -> Option<Client> {
        let slot = self.clients.remove(client_id)?;
        if let Some(session_id) = slot.client.session_id.clone() {
            self.terminate(&session_id, TerminationCause::ClientDisconnect, None, client_id)
                .await;
        }
        tracing::info!(client_id, user_id = %slot.client.user_id, "👋 Client unregistered");
        Some(slot.client)
    }

    fn assign_role(&mut self, client_id: &str, role: Role, device_info: DeviceInfo) -> Result<Option<Role>> {
        let slot = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| AppError::NotFound(format!("Client {} is not connected", client_id)))?;
        if slot.client.session_id.is_some() {
            return Err(AppError::Conflict(format!(
                "Client {} is already in a session",
                client_id
            )));
        }
        let previous = slot.client.role.replace(role);
        slot.client.device_info = device_info;
        Ok(previous.filter(|p| *p != role))
    }

    fn pairing_ended(&mut self, client_id: &str, role: Role, message: Option<ServerMessage>) {
        let Some(slot) = self.clients.get_mut(client_id) else {
            return;
        };
        if slot.client.session_id.is_none() && slot.client.role == Some(role) {
            slot.client.role = None;
        }
        if let Some(message) = message {
            let _ = slot.outbound.try_send(message);
        }
    }

    fn open_session(&mut self, record: MatchRecord, requester: &str) -> Result<()> {
        if self.sessions.contains_key(&record.pair_id) {
            return Ok(());
        }

        let mut missing = Vec::new();
        for role in Role::ALL {
            let client_id = record.client_for(role);
            let ready = self.clients.get(client_id).is_some_and(|s| {
                s.client.user_id == record.user_id
                    && s.client.role == Some(role)
                    && s.client.session_id.is_none()
            });
            if !ready {
                missing.push(client_id.to_string());
            }
        }
        if !missing.is_empty() {
            for role in Role::ALL {
                if let Some(slot) = self.clients.get(record.client_for(role)) {
                    let _ = slot.outbound.try_send(ServerMessage::SessionFailed {
                        reason: "peer_unavailable".to_string(),
                    });
                }
            }
            tracing::warn!(
                pair_id = %record.pair_id,
                missing = %missing.join(","),
                "⚠️ Match could not become a session"
            );
            return Err(AppError::Conflict(format!(
                "Peer {} is no longer available",
                missing.join(",")
            )));
        }

        let now = self.clock.now();
        let session = Session::new(
            record.pair_id.as_str(),
            record.user_id.as_str(),
            record.card_end_client.as_str(),
            record.pos_end_client.as_str(),
            now,
        );

        for role in Role::ALL {
            let peer_role = role.opposite();
            if let Some(slot) = self.clients.get_mut(record.client_for(role)) {
                slot.client.session_id = Some(record.pair_id.clone());
                let _ = slot.outbound.try_send(ServerMessage::SessionEstablished {
                    session_id: record.pair_id.clone(),
                    peer_client_id: record.client_for(peer_role).to_string(),
                    peer_role,
                });
            }
        }
        // the requester gets its own pairing result as a direct reply
        for role in Role::ALL {
            let client_id = record.client_for(role);
            if client_id == requester {
                continue;
            }
            if let Some(slot) = self.clients.get(client_id) {
                let _ = slot
                    .outbound
                    .try_send(ServerMessage::PairingResult(MatchResult::matched(&record, role)));
            }
        }

        self.audit.record(
            AuditRecord::new(EVENT_SESSION_CREATED, "success", now)
                .session(record.pair_id.as_str())
                .clients([record.card_end_client.as_str(), record.pos_end_client.as_str()])
                .user(record.user_id.as_str()),
        );
        tracing::info!(
            session_id = %record.pair_id,
            card_end = %record.card_end_client,
            pos_end = %record.pos_end_client,
            "🔗 Session established"
        );
        self.sessions.insert(record.pair_id.clone(), session);
        Ok(())
    }

    fn prepare_relay(&mut self, session_id: &str, from_client_id: &str) -> Result<RelayTicket> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))?;
        if session.is_terminated() {
            return Err(AppError::Conflict(format!("Session {} is terminated", session_id)));
        }
        let direction = session.direction_from(from_client_id).ok_or_else(|| {
            AppError::PermissionDenied(format!(
                "Client {} is not a participant of session {}",
                from_client_id, session_id
            ))
        })?;
        let sequence = session.next_sequence();
        let user_id = session.user_id.clone();

        let device_info = self
            .clients
            .get(from_client_id)
            .map(|s| s.client.device_info.clone())
            .unwrap_or_default();

        Ok(RelayTicket {
            session_id: session_id.to_string(),
            user_id,
            from_client_id: from_client_id.to_string(),
            direction,
            sequence,
            device_info,
        })
    }

    async fn complete_relay(&mut self, ticket: RelayTicket, apdu: Vec<u8>) -> Result<()> {
        let now = self.clock.now();
        let peer_client_id = {
            let session = self
                .sessions
                .get(&ticket.session_id)
                .ok_or_else(|| AppError::NotFound(format!("Session {} not found", ticket.session_id)))?;
            if session.is_terminated() {
                return Err(AppError::Conflict(format!(
                    "Session {} is terminated",
                    ticket.session_id
                )));
            }
            session
                .peer_of(&ticket.from_client_id)
                .map(|p| p.client_id().to_string())
                .ok_or_else(|| AppError::PermissionDenied("Sender left the session".to_string()))?
        };

        let apdu_hex = hex::encode_upper(&apdu);
        let message = match ticket.direction {
            ApduDirection::Command => ServerMessage::ApduToCard {
                session_id: ticket.session_id.clone(),
                sequence: ticket.sequence,
                apdu: apdu_hex,
            },
            ApduDirection::Response => ServerMessage::ApduFromCard {
                session_id: ticket.session_id.clone(),
                sequence: ticket.sequence,
                apdu: apdu_hex,
            },
        };

        let delivered = self
            .clients
            .get(&peer_client_id)
            .map(|slot| slot.outbound.try_send(message).is_ok())
            .unwrap_or(false);
        if !delivered {
            tracing::warn!(
                session_id = %ticket.session_id,
                peer = %peer_client_id,
                "⚠️ Peer unreachable, dropping frame"
            );
            self.terminate(
                &ticket.session_id,
                TerminationCause::PeerUnreachable,
                None,
                "system",
            )
            .await;
            return Err(AppError::Network(format!("Peer {} is unreachable", peer_client_id)));
        }

        if let Some(session) = self.sessions.get_mut(&ticket.session_id) {
            session.record_relay(ticket.direction, now);
        }
        self.audit.record(
            AuditRecord::new(EVENT_APDU_RELAYED, "success", now)
                .session(ticket.session_id.as_str())
                .clients([ticket.from_client_id.as_str(), peer_client_id.as_str()])
                .user(ticket.user_id.as_str())
                .details(sonic_rs::json!({
                    "sequence": ticket.sequence,
                    "direction": ticket.direction.as_str(),
                    "length": apdu.len(),
                })),
        );
        Ok(())
    }

    async fn relay_failed(&mut self, ticket: &RelayTicket, reason: &str, terminate: bool) {
        let now = self.clock.now();
        if let Some(session) = self.sessions.get_mut(&ticket.session_id) {
            session.flag(reason);
        }
        self.audit.record(
            AuditRecord::new(EVENT_APDU_FAILED, "failure", now)
                .session(ticket.session_id.as_str())
                .clients([ticket.from_client_id.as_str()])
                .user(ticket.user_id.as_str())
                .details(sonic_rs::json!({
                    "sequence": ticket.sequence,
                    "direction": ticket.direction.as_str(),
                    "reason": reason,
                })),
        );
        if terminate {
            self.terminate(
                &ticket.session_id,
                TerminationCause::ComplianceViolation,
                None,
                "compliance",
            )
            .await;
        }
    }

    async fn end_session(&mut self, session_id: &str, client_id: &str) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))?;
        if session.participant(client_id).is_none() {
            return Err(AppError::PermissionDenied(format!(
                "Client {} is not a participant of session {}",
                client_id, session_id
            )));
        }
        self.terminate(session_id, TerminationCause::ClientRequest, None, client_id)
            .await;
        Ok(())
    }

    async fn terminate_by_admin(&mut self, session_id: &str, reason: &str, actor: &str) -> Result<AdminTermination> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))?;
        if session.is_terminated() {
            return Ok(AdminTermination::AlreadyTerminated);
        }
        self.terminate(session_id, TerminationCause::Admin, Some(reason), actor)
            .await;
        Ok(AdminTermination::Terminated)
    }

    async fn disconnect_client(&mut self, client_id: &str, reason: &str) -> Result<Client> {
        let slot = self
            .clients
            .remove(client_id)
            .ok_or_else(|| AppError::NotFound(format!("Client {} is not connected", client_id)))?;

        if let Some(session_id) = slot.client.session_id.clone() {
            self.terminate(&session_id, TerminationCause::Admin, Some(reason), "admin")
                .await;
        }
        let _ = slot.outbound.try_send(ServerMessage::SessionFailed {
            reason: format!("disconnected_by_admin: {}", reason),
        });
        slot.closed.cancel();

        self.audit.record(
            AuditRecord::new(EVENT_CLIENT_DISCONNECTED_BY_ADMIN, "success", self.clock.now())
                .clients([client_id])
                .user(slot.client.user_id.as_str())
                .details(sonic_rs::json!({ "reason": reason })),
        );
        tracing::warn!(client_id, reason, "⛔ Client disconnected by admin");
        Ok(slot.client)
    }

    /// Terminates a session once and tells both participants.
    async fn terminate(
        &mut self,
        session_id: &str,
        cause: TerminationCause,
        reason: Option<&str>,
        actor: &str,
    ) -> bool {
        let now = self.clock.now();
        let reason = reason.unwrap_or(cause.reason());
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if !session.terminate(reason, actor, now) {
            return false;
        }
        let participants = [
            session.card_end.client_id().to_string(),
            session.pos_end.client_id().to_string(),
        ];
        let user_id = session.user_id.clone();

        for client_id in &participants {
            let Some(slot) = self.clients.get_mut(client_id) else {
                continue;
            };
            if slot.client.session_id.as_deref() == Some(session_id) {
                slot.client.session_id = None;
                slot.client.role = None;
            }
            if cause == TerminationCause::ClientDisconnect && client_id != actor {
                let _ = slot.outbound.try_send(ServerMessage::PeerDisconnected {
                    session_id: session_id.to_string(),
                });
            }
            let _ = slot.outbound.try_send(ServerMessage::SessionTerminated {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            });
        }

        self.keys.revoke_session_keys(session_id).await;
        self.compliance.forget_session(session_id).await;

        self.audit.record(
            AuditRecord::new(cause.audit_event(), "terminated", now)
                .session(session_id)
                .clients(participants.iter().map(String::as_str))
                .user(user_id.as_str())
                .details(sonic_rs::json!({ "reason": reason, "actor": actor })),
        );
        tracing::info!(session_id, reason, actor, "🔚 Session terminated");
        true
    }

    /// Ends idle sessions and drops terminated ones past the grace period.
    async fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        let inactive = chrono::Duration::from_std(self.config.inactive_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let grace = chrono::Duration::from_std(self.config.grace_period)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let idle: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.is_terminated() && now - s.last_activity >= inactive)
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in &idle {
            self.terminate(session_id, TerminationCause::InactiveTimeout, None, "system")
                .await;
        }

        let before = self.sessions.len();
        self.sessions.retain(|_, s| match &s.termination {
            Some(t) => now - t.at < grace,
            None => true,
        });
        let purged = before - self.sessions.len();

        if !idle.is_empty() || purged > 0 {
            tracing::info!(
                terminated = idle.len(),
                purged,
                remaining = self.sessions.len(),
                "🧹 Session sweep completed"
            );
        }
        idle.len() + purged
    }
}

/// Cloneable front of the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    pairing: Arc<PairingPool>,
    hybrid: Arc<HybridEncryptionManager>,
    keys: Arc<KeyExchangeManager>,
    clock: SharedClock,
}

impl HubHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> HubCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| AppError::Internal("Connection hub stopped".to_string()))?;
        response
            .await
            .map_err(|_| AppError::Internal("Connection hub dropped the request".to_string()))
    }

    /// Registers a live connection.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The authenticated owner.
    /// * `client_id` - Requested id; generated when absent.
    /// * `display_name` - Shown to operators; defaults to the client id.
    /// * `remote_addr` - Peer address of the transport.
    ///
    /// # Returns
    ///
    /// The connection's queues and close token.
    pub async fn register_client(
        &self,
        user_id: &str,
        client_id: Option<String>,
        display_name: Option<String>,
        remote_addr: Option<String>,
    ) -> Result<Connection> {
        validate_identifier("user_id", user_id)?;
        let client_id = client_id.unwrap_or_else(|| format!("client_{}", Uuid::new_v4().simple()));
        validate_identifier("client_id", &client_id)?;
        let display_name = display_name.unwrap_or_else(|| client_id.clone());

        let client = Client::new(client_id, user_id, display_name, remote_addr, self.clock.now());
        self.call(|reply| HubCommand::Register { client, reply })
            .await?
    }

    /// Removes a closed connection, ending its session and releasing its waiting entry.
    pub async fn unregister_client(&self, client_id: &str) -> Result<Option<Client>> {
        let removed = self
            .call(|reply| HubCommand::Unregister {
                client_id: client_id.to_string(),
                reply,
            })
            .await?;
        if let Some(client) = &removed {
            self.release_waiting(client).await;
        }
        Ok(removed)
    }

    /// Assigns the client's role and enters it into the pairing pool.
    ///
    /// On a match the session is created before this returns.
    ///
    /// # Arguments
    ///
    /// * `client_id` - The requesting connection.
    /// * `role` - `card-end` or `pos-end`.
    /// * `device_info` - Device metadata, fingerprinted into every envelope.
    /// * `force` - Replace another waiting client of the same user and role.
    pub async fn request_pairing(
        &self,
        client_id: &str,
        role: &str,
        device_info: DeviceInfo,
        force: bool,
    ) -> Result<MatchResult> {
        let client = self.require_client(client_id).await?;
        let request = PairingRequest {
            user_id: client.user_id.clone(),
            client_id: client_id.to_string(),
            role: role.to_string(),
            device_info: device_info.clone(),
            force,
        };
        let role = validate_pairing_request(&request)?;

        let previous = self
            .call(|reply| HubCommand::AssignRole {
                client_id: client_id.to_string(),
                role,
                device_info,
                reply,
            })
            .await??;
        if let Some(previous) = previous {
            if let Err(e) = self.pairing.release_client(&client.user_id, previous, client_id).await {
                tracing::warn!(client_id, "⚠️ Failed to release previous role: {}", e);
            }
        }

        let outcome = match self.pairing.join(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.pairing_ended(client_id, role, None).await?;
                return Err(e);
            }
        };

        if let Some(replaced) = &outcome.replaced {
            let mut report = PairingStatusReport::idle(&client.user_id, role);
            report.client_id = Some(replaced.clone());
            self.pairing_ended(replaced, role, Some(ServerMessage::PairingStatus(report)))
                .await?;
        }

        if outcome.result.matched {
            self.open_session(&client.user_id, role, client_id, &outcome.result)
                .await?;
        }
        Ok(outcome.result)
    }

    async fn open_session(&self, user_id: &str, role: Role, client_id: &str, result: &MatchResult) -> Result<()> {
        let (Some(pair_id), Some(peer)) = (result.pair_id.clone(), result.peer_client_id.clone())
        else {
            return Err(AppError::Internal("Match result without pair".to_string()));
        };
        let (card_end_client, pos_end_client) = match role {
            Role::CardEnd => (client_id.to_string(), peer),
            Role::PosEnd => (peer, client_id.to_string()),
        };
        let record = MatchRecord {
            pair_id: pair_id.clone(),
            user_id: user_id.to_string(),
            card_end_client,
            pos_end_client,
            matched_at_ms: self.clock.now().timestamp_millis(),
        };

        self.keys.generate_session_keys(&pair_id).await?;
        let opened = self
            .call(|reply| HubCommand::Paired {
                record,
                requester: client_id.to_string(),
                reply,
            })
            .await
            .and_then(|r| r);
        if let Err(e) = opened {
            self.keys.revoke_session_keys(&pair_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Cancels the client's waiting entry for `role`.
    pub async fn cancel_pairing(&self, client_id: &str, role: Role) -> Result<bool> {
        let client = self.require_client(client_id).await?;
        let removed = self.pairing.release_client(&client.user_id, role, client_id).await?;
        self.pairing_ended(client_id, role, None).await?;
        Ok(removed)
    }

    /// Pairing status of the client's user, for one role or both.
    pub async fn pairing_status(&self, client_id: &str, role: Option<Role>) -> Result<ServerMessage> {
        let client = self.require_client(client_id).await?;
        match role {
            Some(role) => Ok(ServerMessage::PairingStatus(
                self.pairing
                    .get_user_pairing_status(&client.user_id, role)
                    .await?,
            )),
            None => Ok(ServerMessage::PairingOverview(
                self.pairing.get_pairing_status(&client.user_id).await,
            )),
        }
    }

    /// Tells clients whose waiting entries expired.
    pub async fn pairing_timed_out(&self, entries: &[crate::models::pairing::PairingEntry]) -> Result<()> {
        for entry in entries {
            let report = PairingStatusReport {
                status: PairingStatus::Timeout,
                client_id: Some(entry.client_id.clone()),
                ..PairingStatusReport::idle(&entry.user_id, entry.role)
            };
            self.pairing_ended(&entry.client_id, entry.role, Some(ServerMessage::PairingStatus(report)))
                .await?;
        }
        Ok(())
    }

    /// Relays one APDU from a participant to its peer.
    ///
    /// The frame is sealed, audited, opened and deep-audited before delivery.
    /// A rejected frame is never delivered; the session is flagged, and a
    /// critical compliance violation ends it.
    ///
    /// # Arguments
    ///
    /// * `session_id` - The session the frame belongs to.
    /// * `from_client_id` - The sending participant.
    /// * `raw_apdu` - The frame bytes.
    ///
    /// # Returns
    ///
    /// The frame's sequence number within the session.
    pub async fn relay_apdu(&self, session_id: &str, from_client_id: &str, raw_apdu: &[u8]) -> Result<u64> {
        let ticket = self
            .call(|reply| HubCommand::PrepareRelay {
                session_id: session_id.to_string(),
                from_client_id: from_client_id.to_string(),
                reply,
            })
            .await??;

        let frame = FrameContext {
            client_id: ticket.from_client_id.clone(),
            direction: ticket.direction,
            sequence: ticket.sequence,
            device_info: ticket.device_info.clone(),
        };
        let processed = async {
            let envelope = self
                .hybrid
                .encrypt_apdu_for_transmission(&ticket.session_id, raw_apdu, &frame, &ticket.user_id)
                .await?;
            self.hybrid
                .decrypt_apdu_from_transmission(&ticket.session_id, &envelope, &ticket.user_id)
                .await
        }
        .await;

        let sequence = ticket.sequence;
        match processed {
            Ok(apdu) => {
                self.call(|reply| HubCommand::CompleteRelay {
                    ticket,
                    apdu,
                    reply,
                })
                .await??;
                Ok(sequence)
            }
            Err(e) => {
                let terminate = matches!(
                    e,
                    AppError::Compliance {
                        risk_level: RiskLevel::Critical,
                        ..
                    }
                );
                let reason = match &e {
                    AppError::Compliance { rule_id, .. } => format!("compliance:{}", rule_id),
                    other => other.category().as_str().to_string(),
                };
                self.call(|reply| HubCommand::RelayFailed {
                    ticket,
                    reason,
                    terminate,
                    reply,
                })
                .await?;
                Err(e)
            }
        }
    }

    /// Ends a session at a participant's request.
    pub async fn end_session(&self, session_id: &str, client_id: &str) -> Result<()> {
        self.call(|reply| HubCommand::EndSession {
            session_id: session_id.to_string(),
            client_id: client_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn get_all_clients(&self) -> Result<Vec<Client>> {
        self.call(|reply| HubCommand::Clients { reply }).await
    }

    pub async fn get_all_sessions(&self) -> Result<Vec<Session>> {
        self.call(|reply| HubCommand::Sessions { reply }).await
    }

    pub async fn find_client_by_id(&self, client_id: &str) -> Result<Option<Client>> {
        self.call(|reply| HubCommand::FindClient {
            client_id: client_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn get_session_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        self.call(|reply| HubCommand::GetSession {
            session_id: session_id.to_string(),
            reply,
        })
        .await
    }

    /// Force-closes a connection. Its session, if any, is terminated with `reason`.
    pub async fn disconnect_client_by_id(&self, client_id: &str, reason: &str) -> Result<()> {
        let client = self
            .call(|reply| HubCommand::DisconnectClient {
                client_id: client_id.to_string(),
                reason: reason.to_string(),
                reply,
            })
            .await??;
        self.release_waiting(&client).await;
        Ok(())
    }

    /// Terminates a session on behalf of an operator.
    ///
    /// # Returns
    ///
    /// `AlreadyTerminated` for a session that already ended, `NotFound` once it was purged.
    pub async fn terminate_session_by_admin(
        &self,
        session_id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<AdminTermination> {
        self.call(|reply| HubCommand::TerminateByAdmin {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            reply,
        })
        .await?
    }

    /// Runs the inactivity and grace-period sweep.
    ///
    /// # Returns
    ///
    /// Sessions terminated plus sessions purged.
    pub async fn sweep_inactive(&self) -> Result<usize> {
        self.call(|reply| HubCommand::Sweep { reply }).await
    }

    async fn require_client(&self, client_id: &str) -> Result<Client> {
        self.find_client_by_id(client_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Client {} is not connected", client_id)))
    }

    async fn pairing_ended(&self, client_id: &str, role: Role, message: Option<ServerMessage>) -> Result<()> {
        self.tx
            .send(HubCommand::PairingEnded {
                client_id: client_id.to_string(),
                role,
                message,
            })
            .await
            .map_err(|_| AppError::Internal("Connection hub stopped".to_string()))
    }

    async fn release_waiting(&self, client: &Client) {
        let Some(role) = client.role else {
            return;
        };
        if let Err(e) = self
            .pairing
            .release_client(&client.user_id, role, &client.client_id)
            .await
        {
            tracing::warn!(
                client_id = %client.client_id,
                "⚠️ Failed to release waiting entry on disconnect: {}",
                e
            );
        }
    }
}
